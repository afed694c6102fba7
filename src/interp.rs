//! Reference interpreter for the supported bytecode subset.
//!
//! Used by the `interpret` subcommand and by tests to validate compiler
//! output. Frames hold a `u32` operand stack and `max_locals` locals;
//! `invokestatic` recurses with a fresh frame and pushes the callee's
//! return value, if any, into the caller's frame.

use crate::classfile::{
    check_print_descriptor, ClassFile, CodeInfo, MethodDescriptor, Opcode,
};
use anyhow::{anyhow, bail, Result};
use log::warn;
use std::io::Write;

/// A bytecode interpreter over one class file.
pub struct Interpreter<'a> {
    cls: &'a ClassFile,
}

struct Frame {
    stack: Vec<u32>,
    locals: Vec<u32>,
}

impl Frame {
    fn new(nlocals: usize) -> Self {
        Self { stack: Vec::new(), locals: vec![0; nlocals] }
    }

    fn push(&mut self, value: u32) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<u32> {
        self.stack.pop().ok_or_else(|| anyhow!("operand stack underflow"))
    }

    fn local(&mut self, index: usize) -> Result<&mut u32> {
        let len = self.locals.len();
        self.locals
            .get_mut(index)
            .ok_or_else(|| anyhow!("local index {} out of range ({} locals)", index, len))
    }
}

/// What one decoded instruction did to control flow.
enum Step {
    /// Advance the program counter by this signed amount.
    Advance(i64),
    /// Leave the method, optionally with a value for the caller.
    Return(Option<u32>),
}

impl<'a> Interpreter<'a> {
    pub fn new(cls: &'a ClassFile) -> Self {
        Self { cls }
    }

    /// Run `main`, writing program output to `out`.
    pub fn run(&self, out: &mut dyn Write) -> Result<()> {
        let method = self
            .cls
            .methods
            .main(&self.cls.pool)
            .ok_or_else(|| anyhow!("Could not find main() method"))?;
        let mut frame = Frame::new(method.code.max_locals as usize);
        self.exec(&method.code, &mut frame, out)?;
        Ok(())
    }

    fn exec(&self, code: &CodeInfo, frame: &mut Frame, out: &mut dyn Write) -> Result<Option<u32>> {
        let bytes = &code.code;
        let mut pc = 0i64;
        while (pc as usize) < bytes.len() {
            match self.instr(bytes, pc as usize, frame, out)? {
                Step::Advance(inc) => pc += inc,
                Step::Return(value) => return Ok(value),
            }
            if pc < 0 {
                bail!("program counter went negative");
            }
        }
        warn!("code finished executing without `return` instruction");
        Ok(None)
    }

    fn instr(
        &self,
        code: &[u8],
        pc: usize,
        frame: &mut Frame,
        out: &mut dyn Write,
    ) -> Result<Step> {
        let byte = code[pc];
        let op = Opcode::from_u8(byte)
            .ok_or_else(|| anyhow!("Unsupported opcode: {:#04x}", byte))?;

        use Opcode::*;
        Ok(match op {
            IconstM1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 => {
                let value = byte as i32 - Iconst0 as u8 as i32;
                frame.push(value as u32);
                Step::Advance(1)
            }

            Bipush => {
                frame.push(byte_at(code, pc + 1)? as i8 as i32 as u32);
                Step::Advance(2)
            }

            Sipush => {
                frame.push(i16_at(code, pc + 1)? as i32 as u32);
                Step::Advance(3)
            }

            Iload => {
                let index = byte_at(code, pc + 1)? as usize;
                let value = *frame.local(index)?;
                frame.push(value);
                Step::Advance(2)
            }

            Iload0 | Iload1 | Iload2 | Iload3 => {
                let index = (byte - Iload0 as u8) as usize;
                let value = *frame.local(index)?;
                frame.push(value);
                Step::Advance(1)
            }

            Istore => {
                let index = byte_at(code, pc + 1)? as usize;
                let value = frame.pop()?;
                *frame.local(index)? = value;
                Step::Advance(2)
            }

            Istore0 | Istore1 | Istore2 | Istore3 => {
                let index = (byte - Istore0 as u8) as usize;
                let value = frame.pop()?;
                *frame.local(index)? = value;
                Step::Advance(1)
            }

            Pop => {
                frame.pop()?;
                Step::Advance(1)
            }

            Iinc => {
                let index = byte_at(code, pc + 1)? as usize;
                let amount = byte_at(code, pc + 2)? as i8;
                let local = frame.local(index)?;
                *local = local.wrapping_add(amount as i32 as u32);
                Step::Advance(3)
            }

            Iadd => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(left.wrapping_add(right));
                Step::Advance(1)
            }

            Isub => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(left.wrapping_sub(right));
                Step::Advance(1)
            }

            Imul => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(left.wrapping_mul(right));
                Step::Advance(1)
            }

            Ishl => {
                let amount = frame.pop()? & 0x1f;
                let value = frame.pop()?;
                frame.push(value.wrapping_shl(amount));
                Step::Advance(1)
            }

            Ishr => {
                let amount = frame.pop()? & 0x1f;
                let value = frame.pop()? as i32;
                frame.push((value >> amount) as u32);
                Step::Advance(1)
            }

            IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple => {
                let right = frame.pop()? as i32;
                let left = frame.pop()? as i32;
                let branch = match op {
                    IfIcmpeq => left == right,
                    IfIcmpne => left != right,
                    IfIcmplt => left < right,
                    IfIcmpge => left >= right,
                    IfIcmpgt => left > right,
                    IfIcmple => left <= right,
                    _ => unreachable!(),
                };
                if branch {
                    Step::Advance(i16_at(code, pc + 1)? as i64)
                } else {
                    Step::Advance(3)
                }
            }

            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle => {
                let value = frame.pop()? as i32;
                let branch = match op {
                    Ifeq => value == 0,
                    Ifne => value != 0,
                    Iflt => value < 0,
                    Ifge => value >= 0,
                    Ifgt => value > 0,
                    Ifle => value <= 0,
                    _ => unreachable!(),
                };
                if branch {
                    Step::Advance(i16_at(code, pc + 1)? as i64)
                } else {
                    Step::Advance(3)
                }
            }

            Goto => Step::Advance(i16_at(code, pc + 1)? as i64),

            Invokestatic => self.invokestatic(code, pc, frame, out)?,
            Invokevirtual => self.invokevirtual(code, pc, frame, out)?,

            Return => Step::Return(None),

            Ireturn => {
                let value = frame.pop()?;
                Step::Return(Some(value))
            }

            // System.out: a dummy object reference, popped by the
            // print call.
            Getstatic => {
                frame.push(0);
                Step::Advance(3)
            }
        })
    }

    fn invokestatic(
        &self,
        code: &[u8],
        pc: usize,
        frame: &mut Frame,
        out: &mut dyn Write,
    ) -> Result<Step> {
        let index = u16_at(code, pc + 1)?;
        let pool = &self.cls.pool;
        let member = pool.method_ref(index)?;
        if member.class_index != self.cls.self_index {
            bail!("Cannot call method of other class");
        }
        let name_and_type = pool.name_and_type(member.name_type_index)?;

        let method = self
            .cls
            .methods
            .find(name_and_type)
            .ok_or_else(|| anyhow!("No such method"))?;

        let desc = MethodDescriptor::parse(pool.utf8(name_and_type.desc_index)?)?;
        let mut callee = Frame::new(method.code.max_locals as usize);
        for i in (0..desc.nargs()).rev() {
            *callee.local(i)? = frame.pop()?;
        }

        if let Some(value) = self.exec(&method.code, &mut callee, out)? {
            frame.push(value);
        }
        Ok(Step::Advance(3))
    }

    fn invokevirtual(
        &self,
        code: &[u8],
        pc: usize,
        frame: &mut Frame,
        out: &mut dyn Write,
    ) -> Result<Step> {
        let index = u16_at(code, pc + 1)?;
        let pool = &self.cls.pool;
        let member = pool.method_ref(index)?;
        let name_and_type = pool.name_and_type(member.name_type_index)?;
        let name = pool.utf8(name_and_type.name_index)?;
        let desc = MethodDescriptor::parse(pool.utf8(name_and_type.desc_index)?)?;

        match name {
            "print" => {
                check_print_descriptor(&desc, "print()")?;
                self.print_raw(&desc, frame, out)?;
            }
            "println" => {
                check_print_descriptor(&desc, "println()")?;
                self.print_raw(&desc, frame, out)?;
                writeln!(out)?;
            }
            other => bail!("Unsupported virtual method: {}", other),
        }
        frame.pop()?; // object reference
        Ok(Step::Advance(3))
    }

    fn print_raw(&self, desc: &MethodDescriptor, frame: &mut Frame, out: &mut dyn Write) -> Result<()> {
        if desc.nargs() == 0 {
            return Ok(());
        }
        let value = frame.pop()? as i32;
        if desc.arg(0) == 'C' {
            out.write_all(&[value as u8])?;
        } else {
            write!(out, "{}", value)?;
        }
        Ok(())
    }
}

fn byte_at(code: &[u8], index: usize) -> Result<u8> {
    code.get(index)
        .copied()
        .ok_or_else(|| anyhow!("bytecode truncated at {}", index))
}

fn u16_at(code: &[u8], index: usize) -> Result<u16> {
    Ok(u16::from_be_bytes([byte_at(code, index)?, byte_at(code, index + 1)?]))
}

fn i16_at(code: &[u8], index: usize) -> Result<i16> {
    Ok(u16_at(code, index)? as i16)
}
