//! Bytecode to linear-IR lowering.
//!
//! The builder walks each method's bytecode keeping a current operand-stack
//! depth. Pushes allocate `stack_<depth>` variables, pops release them, and
//! loads/stores become moves against `local_<n>` variables. Branches whose
//! target has not been linearized yet go onto a worklist; linearization
//! resumes at each pending target with the depth the branch recorded.

use super::{
    ArithOp, CmpOp, FuncId, Function, Instr, InstrId, InstrKind, Program, StandardKind, Value,
    Variable,
};
use crate::classfile::{
    check_print_descriptor, ClassError, ClassFile, MethodDescriptor, MethodInfo, NameAndType,
    Opcode,
};
use log::debug;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Errors from lowering a method to linear IR.
#[derive(Debug, Error)]
pub enum LowerError {
    #[error("Unsupported opcode: {0:#04x}")]
    UnsupportedOpcode(u8),
    #[error("Bytecode ran past the end of the method")]
    CodeOverrun,
    #[error("Expected method entry in constant pool at index {0}")]
    ExpectedMethodRef(u16),
    #[error("Cannot call method of other class")]
    CrossClassCall,
    #[error("Unresolved symbol: {0}")]
    UnresolvedSymbol(String),
    #[error("Unsupported virtual method: {0}")]
    UnsupportedVirtual(String),
    #[error("print() must take an argument")]
    PrintWithoutArgument,
    #[error(transparent)]
    Class(#[from] ClassError),
}

/// Lower every program method of `cls` to linear IR.
pub fn build_program(cls: &ClassFile) -> Result<Program, LowerError> {
    let methods = cls.methods.program_methods(&cls.pool)?;

    let mut program = Program::default();
    let mut func_map = HashMap::new();
    for (i, minfo) in methods.iter().enumerate() {
        let desc = minfo.descriptor(&cls.pool)?;
        let name = minfo.name(&cls.pool)?;
        program
            .functions
            .push(Function::new(name, desc.nargs(), desc.nreturn()));
        func_map.insert(minfo.name_and_type(), FuncId(i));
    }

    for (i, minfo) in methods.iter().enumerate() {
        let mut builder = FunctionBuilder {
            cls,
            func_map: &func_map,
            func: &mut program.functions[i],
            minfo,
            depth: -1,
            unlinked: VecDeque::new(),
            inst_map: HashMap::new(),
            sources: Vec::new(),
        };
        builder.build()?;
        debug!(
            "lowered {}: {} instructions",
            program.functions[i].name,
            program.functions[i].insts.len()
        );
    }
    Ok(program)
}

/// A branch whose target offset has not been linearized yet.
struct PendingBranch {
    /// Byte offset of the branch target.
    offset: usize,
    /// Operand-stack depth to resume linearization with.
    depth: i64,
    /// The emitted branch instruction whose target slot is open.
    branch: InstrId,
}

struct FunctionBuilder<'a> {
    cls: &'a ClassFile,
    func_map: &'a HashMap<NameAndType, FuncId>,
    func: &'a mut Function,
    minfo: &'a MethodInfo,
    depth: i64,
    unlinked: VecDeque<PendingBranch>,
    /// Byte offset of each bytecode to the first instruction emitted at or
    /// after it.
    inst_map: HashMap<usize, InstrId>,
    /// Offsets consumed since the last emission; drained into `inst_map` on
    /// every `emit` so opcodes that emit nothing still map forward.
    sources: Vec<usize>,
}

impl FunctionBuilder<'_> {
    fn build(&mut self) -> Result<(), LowerError> {
        self.build_at(0)?;

        while let Some(pending) = self.unlinked.pop_front() {
            if !self.inst_map.contains_key(&pending.offset) {
                self.depth = pending.depth;
                self.sources.clear();
                self.build_at(pending.offset)?;
            }
            let target = *self
                .inst_map
                .get(&pending.offset)
                .ok_or(LowerError::CodeOverrun)?;
            match &mut self.func.insts[pending.branch.0].kind {
                InstrKind::Branch { target: slot, .. }
                | InstrKind::UnconditionalBranch { target: slot } => *slot = Some(target),
                _ => unreachable!("pending entry always names a branch"),
            }
            self.func.insts[target.0].is_branch_target = true;
        }
        Ok(())
    }

    fn build_at(&mut self, mut offset: usize) -> Result<(), LowerError> {
        let len = self.minfo.code.code.len();
        loop {
            self.sources.push(offset);
            let inc = self.build_instruction(offset)?;
            if inc == 0 {
                return Ok(());
            }
            offset += inc;
            if offset >= len {
                return Err(LowerError::CodeOverrun);
            }
        }
    }

    /// Decode and lower one bytecode; returns the byte length consumed, or
    /// 0 when control flow does not fall through.
    fn build_instruction(&mut self, offset: usize) -> Result<usize, LowerError> {
        let code = &self.minfo.code.code;
        let byte = code[offset];
        let op = Opcode::from_u8(byte).ok_or(LowerError::UnsupportedOpcode(byte))?;

        use Opcode::*;
        match op {
            IconstM1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 => {
                let value = byte as i32 - Iconst0 as u8 as i32;
                self.push_const(value as i64 as u64);
                Ok(1)
            }

            Bipush => {
                let value = self.byte_at(offset + 1)? as i8;
                self.push_const(value as i64 as u64);
                Ok(2)
            }

            Sipush => {
                let value = self.i16_at(offset + 1)?;
                self.push_const(value as i64 as u64);
                Ok(3)
            }

            Iload => {
                let index = self.byte_at(offset + 1)?;
                self.push_local(index as u64);
                Ok(2)
            }

            Iload0 | Iload1 | Iload2 | Iload3 => {
                let index = byte as i32 - Iload0 as u8 as i32;
                self.push_local(index as u64);
                Ok(1)
            }

            Istore => {
                let index = self.byte_at(offset + 1)?;
                self.pop_local(index as u64);
                Ok(2)
            }

            Istore0 | Istore1 | Istore2 | Istore3 => {
                let index = byte as i32 - Istore0 as u8 as i32;
                self.pop_local(index as u64);
                Ok(1)
            }

            Pop => {
                self.pop();
                Ok(1)
            }

            Iinc => {
                let index = self.byte_at(offset + 1)? as u64;
                let amount = self.byte_at(offset + 2)? as i8;
                let var = Variable::local(index);
                self.emit(InstrKind::BinaryOp {
                    op: ArithOp::Add,
                    left: Value::Var(var),
                    right: Value::Constant(amount as i64 as u64),
                    dest: var,
                });
                Ok(3)
            }

            Iadd => self.binary_op(ArithOp::Add),
            Isub => self.binary_op(ArithOp::Sub),
            Imul => self.binary_op(ArithOp::Mul),
            Ishl => self.binary_op(ArithOp::Shl),
            Ishr => self.binary_op(ArithOp::Shr),

            IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple => {
                let right = self.pop();
                let left = self.pop();
                let cmp = icmp_op(op);
                self.branch(cmp, Value::Var(left), Value::Var(right), offset)?;
                Ok(3)
            }

            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle => {
                let left = self.pop();
                let cmp = if_op(op);
                self.branch(cmp, Value::Var(left), Value::Constant(0), offset)?;
                Ok(3)
            }

            Goto => {
                let id = self.emit(InstrKind::UnconditionalBranch { target: None });
                self.bind(id, offset, self.i16_at(offset + 1)?)?;
                Ok(0)
            }

            Invokestatic => self.build_invokestatic(offset),
            Invokevirtual => self.build_invokevirtual(offset),

            Return => {
                self.emit(InstrKind::ReturnVoid);
                Ok(0)
            }

            Ireturn => {
                let value = self.pop();
                self.emit(InstrKind::Return { value: Value::Var(value) });
                Ok(0)
            }

            // System.out access: the object reference is elided entirely.
            Getstatic => Ok(3),
        }
    }

    fn build_invokestatic(&mut self, offset: usize) -> Result<usize, LowerError> {
        let index = self.u16_at(offset + 1)?;
        let member = self
            .cls
            .pool
            .method_ref(index)
            .map_err(|_| LowerError::ExpectedMethodRef(index))?;
        if member.class_index != self.cls.self_index {
            return Err(LowerError::CrossClassCall);
        }

        let name_and_type = self.cls.pool.name_and_type(member.name_type_index)?;
        let name = self.cls.pool.utf8(name_and_type.name_index)?;
        let callee = *self
            .func_map
            .get(&name_and_type)
            .ok_or_else(|| LowerError::UnresolvedSymbol(name.to_string()))?;

        let desc = MethodDescriptor::parse(self.cls.pool.utf8(name_and_type.desc_index)?)?;

        let mut args = Vec::with_capacity(desc.nargs());
        for _ in 0..desc.nargs() {
            args.insert(0, Value::Var(self.pop()));
        }
        let dest = (desc.nreturn() > 0).then(|| self.push());

        self.emit(InstrKind::FunctionCall { callee, args, dest });
        Ok(3)
    }

    fn build_invokevirtual(&mut self, offset: usize) -> Result<usize, LowerError> {
        let index = self.u16_at(offset + 1)?;
        let member = self
            .cls
            .pool
            .method_ref(index)
            .map_err(|_| LowerError::ExpectedMethodRef(index))?;
        let name_and_type = self.cls.pool.name_and_type(member.name_type_index)?;
        let name = self.cls.pool.utf8(name_and_type.name_index)?.to_string();
        let desc = MethodDescriptor::parse(self.cls.pool.utf8(name_and_type.desc_index)?)?;

        if name != "print" && name != "println" {
            return Err(LowerError::UnsupportedVirtual(name));
        }
        check_print_descriptor(&desc, &format!("{}()", name))?;

        let kind = if name == "print" {
            if desc.nargs() == 0 {
                return Err(LowerError::PrintWithoutArgument);
            } else if desc.arg(0) == 'C' {
                StandardKind::PrintChar
            } else {
                StandardKind::PrintInt
            }
        } else if desc.nargs() == 0 {
            StandardKind::PrintlnVoid
        } else if desc.arg(0) == 'C' {
            StandardKind::PrintlnChar
        } else {
            StandardKind::PrintlnInt
        };

        let args = match kind.nargs() {
            0 => Vec::new(),
            _ => vec![Value::Var(self.pop())],
        };
        self.emit(InstrKind::StandardCall { kind, args });
        Ok(3)
    }

    fn binary_op(&mut self, op: ArithOp) -> Result<usize, LowerError> {
        let right = self.pop();
        let left = self.pop();
        let dest = self.push();
        self.emit(InstrKind::BinaryOp {
            op,
            left: Value::Var(left),
            right: Value::Var(right),
            dest,
        });
        Ok(1)
    }

    fn branch(
        &mut self,
        op: CmpOp,
        left: Value,
        right: Value,
        offset: usize,
    ) -> Result<(), LowerError> {
        let id = self.emit(InstrKind::Branch { op, left, right, target: None });
        self.bind(id, offset, self.i16_at(offset + 1)?)
    }

    /// Record `branch` as pending against the byte offset `base + disp`.
    fn bind(&mut self, branch: InstrId, base: usize, disp: i16) -> Result<(), LowerError> {
        let target = base
            .checked_add_signed(disp as isize)
            .filter(|&t| t < self.minfo.code.code.len())
            .ok_or(LowerError::CodeOverrun)?;
        self.unlinked.push_back(PendingBranch {
            offset: target,
            depth: self.depth,
            branch,
        });
        Ok(())
    }

    fn emit(&mut self, kind: InstrKind) -> InstrId {
        let id = InstrId(self.func.insts.len());
        self.func.insts.push(Instr { kind, is_branch_target: false });
        for offset in self.sources.drain(..) {
            self.inst_map.entry(offset).or_insert(id);
        }
        id
    }

    fn push(&mut self) -> Variable {
        self.depth += 1;
        Variable::stack(self.depth as u64)
    }

    fn pop(&mut self) -> Variable {
        let var = Variable::stack(self.depth as u64);
        self.depth -= 1;
        var
    }

    fn push_const(&mut self, value: u64) {
        let dest = self.push();
        self.emit(InstrKind::Move { source: Value::Constant(value), dest });
    }

    fn push_local(&mut self, index: u64) {
        let dest = self.push();
        self.emit(InstrKind::Move {
            source: Value::Var(Variable::local(index)),
            dest,
        });
    }

    fn pop_local(&mut self, index: u64) {
        let source = self.pop();
        self.emit(InstrKind::Move {
            source: Value::Var(source),
            dest: Variable::local(index),
        });
    }

    fn byte_at(&self, offset: usize) -> Result<u8, LowerError> {
        self.minfo
            .code
            .code
            .get(offset)
            .copied()
            .ok_or(LowerError::CodeOverrun)
    }

    fn u16_at(&self, offset: usize) -> Result<u16, LowerError> {
        let hi = self.byte_at(offset)?;
        let lo = self.byte_at(offset + 1)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn i16_at(&self, offset: usize) -> Result<i16, LowerError> {
        Ok(self.u16_at(offset)? as i16)
    }
}

fn icmp_op(op: Opcode) -> CmpOp {
    match op {
        Opcode::IfIcmpeq => CmpOp::Eq,
        Opcode::IfIcmpne => CmpOp::Ne,
        Opcode::IfIcmplt => CmpOp::Lt,
        Opcode::IfIcmpge => CmpOp::Ge,
        Opcode::IfIcmpgt => CmpOp::Gt,
        Opcode::IfIcmple => CmpOp::Le,
        _ => unreachable!("caller matched an if_icmp opcode"),
    }
}

fn if_op(op: Opcode) -> CmpOp {
    match op {
        Opcode::Ifeq => CmpOp::Eq,
        Opcode::Ifne => CmpOp::Ne,
        Opcode::Iflt => CmpOp::Lt,
        Opcode::Ifge => CmpOp::Ge,
        Opcode::Ifgt => CmpOp::Gt,
        Opcode::Ifle => CmpOp::Le,
        _ => unreachable!("caller matched an if opcode"),
    }
}
