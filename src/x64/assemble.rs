//! Machine-IR to byte emission.
//!
//! Encodes each instruction with a REX-prefix-aware scheme and records a
//! fixup for every rel32 branch/call displacement. Fixups resolve after
//! all functions are emitted: `rel32 = target - end_of_instruction`.

use super::{
    BinaryOp, EmitError, Inst, JumpCond, NullaryOp, Operand, Program, Register, UnaryOp,
};
use std::collections::HashMap;

/// A pending rel32 displacement.
#[derive(Debug)]
struct Fixup {
    target: FixupTarget,
    /// Byte offset of the end of the branch/call instruction.
    base: usize,
    /// Byte offset of the 4-byte displacement field.
    pos: usize,
}

#[derive(Debug, Clone, Copy)]
enum FixupTarget {
    /// A machine instruction (jump within one function).
    Inst { func: usize, inst: usize },
    /// A function's first instruction (calls).
    Function(usize),
}

/// Encoding bytes shared by add/sub/cmp.
struct BasicBinary {
    reg_opcode: u8,
    imm_opcode: u8,
    reg_base: u8,
    imm_base: u8,
}

/// Assembles a machine program into a flat code buffer.
pub struct Assembler<'a> {
    program: &'a Program,
    buf: Vec<u8>,
    inst_offsets: HashMap<(usize, usize), usize>,
    fixups: Vec<Fixup>,
}

impl<'a> Assembler<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            buf: Vec::new(),
            inst_offsets: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    /// Emit every function and resolve all displacements.
    pub fn assemble(&mut self) -> Result<(), EmitError> {
        for (func_index, func) in self.program.functions.iter().enumerate() {
            for (inst_index, inst) in func.insts.iter().enumerate() {
                self.inst_offsets
                    .insert((func_index, inst_index), self.buf.len());
                self.encode(func_index, inst)?;
            }
        }

        for fixup in std::mem::take(&mut self.fixups) {
            let target = match fixup.target {
                FixupTarget::Inst { func, inst } => *self
                    .inst_offsets
                    .get(&(func, inst))
                    .ok_or(EmitError::UnlinkedJump)?,
                FixupTarget::Function(func) => self.function_offset(func)?,
            };
            let rel = target as i64 - fixup.base as i64;
            let rel32 = i32::try_from(rel).map_err(|_| EmitError::Rel32OutOfRange)?;
            self.buf[fixup.pos..fixup.pos + 4].copy_from_slice(&rel32.to_le_bytes());
        }
        Ok(())
    }

    /// Byte offset of a function's first instruction.
    pub fn function_offset(&self, func: usize) -> Result<usize, EmitError> {
        if self
            .program
            .functions
            .get(func)
            .is_none_or(|f| f.insts.is_empty())
        {
            let name = self
                .program
                .functions
                .get(func)
                .map(|f| f.name.clone())
                .unwrap_or_default();
            return Err(EmitError::EmptyFunction(name));
        }
        self.inst_offsets
            .get(&(func, 0))
            .copied()
            .ok_or(EmitError::UnlinkedJump)
    }

    /// The assembled code bytes.
    pub fn into_code(self) -> Vec<u8> {
        self.buf
    }

    pub fn code(&self) -> &[u8] {
        &self.buf
    }

    fn encode(&mut self, func_index: usize, inst: &Inst) -> Result<(), EmitError> {
        match inst {
            Inst::Nullary { op: NullaryOp::Ret } => {
                self.byte(0xc3);
                Ok(())
            }
            Inst::Unary { op, operand } => self.encode_unary(*op, *operand),
            Inst::Binary { op, dest, source } => self.encode_binary(*op, *dest, *source),
            Inst::Jump { cond, target } => {
                let target = target.ok_or(EmitError::UnlinkedJump)?;
                match cond {
                    JumpCond::Always => self.byte(0xe9),
                    JumpCond::Zero => {
                        self.byte(0x0f);
                        self.byte(0x84);
                    }
                }
                self.imm32(0);
                self.bind_rel32(FixupTarget::Inst { func: func_index, inst: target });
                Ok(())
            }
            Inst::Call { target } => {
                self.byte(0xe8);
                self.imm32(0);
                self.bind_rel32(FixupTarget::Function(target.0));
                Ok(())
            }
            Inst::RegisterCall { reg } => {
                if reg.is_extended() {
                    self.byte(0x41);
                }
                self.byte(0xff);
                self.byte(0xd0 + reg.modrm());
                Ok(())
            }
        }
    }

    fn encode_unary(&mut self, op: UnaryOp, operand: Operand) -> Result<(), EmitError> {
        match op {
            UnaryOp::Push => match operand {
                Operand::Register(reg) => {
                    if reg.is_extended() {
                        self.byte(0x41);
                    }
                    self.byte(0x50 + reg.modrm());
                    Ok(())
                }
                Operand::Constant(value) => {
                    self.byte(0x68);
                    self.imm32(value as u32);
                    Ok(())
                }
                Operand::StackSlot(_) => Err(EmitError::BadOperand("push")),
            },
            UnaryOp::Pop => {
                let reg = register(operand, "pop")?;
                if reg.is_extended() {
                    self.byte(0x41);
                }
                self.byte(0x58 + reg.modrm());
                Ok(())
            }
            UnaryOp::Sete => self.setcc(operand, 0x94),
            UnaryOp::Setne => self.setcc(operand, 0x95),
            UnaryOp::Setl => self.setcc(operand, 0x9c),
            UnaryOp::Setle => self.setcc(operand, 0x9e),
            UnaryOp::Setg => self.setcc(operand, 0x9f),
            UnaryOp::Setge => self.setcc(operand, 0x9d),
        }
    }

    fn encode_binary(
        &mut self,
        op: BinaryOp,
        dest: Operand,
        source: Operand,
    ) -> Result<(), EmitError> {
        match op {
            BinaryOp::Mov => self.mov(dest, source),
            BinaryOp::Add => self.basic_binary(
                dest,
                source,
                BasicBinary { reg_opcode: 0x01, imm_opcode: 0x81, reg_base: 0xc0, imm_base: 0xc0 },
            ),
            BinaryOp::Sub => self.basic_binary(
                dest,
                source,
                BasicBinary { reg_opcode: 0x29, imm_opcode: 0x81, reg_base: 0xe8, imm_base: 0xe8 },
            ),
            BinaryOp::Cmp => self.basic_binary(
                dest,
                source,
                BasicBinary { reg_opcode: 0x39, imm_opcode: 0x81, reg_base: 0xc0, imm_base: 0xf8 },
            ),
            BinaryOp::Imul => self.imul(dest, source),
            BinaryOp::Shl => self.shift(dest, source, 0x00),
            BinaryOp::Shr => self.shift(dest, source, 0x08),
            BinaryOp::Test8 => self.test8(dest, source),
        }
    }

    fn setcc(&mut self, operand: Operand, opcode: u8) -> Result<(), EmitError> {
        let reg = register(operand, "setcc")?;
        let mut prefix = 0x40;
        if reg.is_extended() {
            prefix |= 0x01;
        }
        self.byte(prefix);
        self.byte(0x0f);
        self.byte(opcode);
        self.byte(0xc0 + reg.modrm());
        Ok(())
    }

    /// REX.W prefix for a two-operand instruction: 0x48, OR 0x01 when the
    /// destination is extended (ModR/M.rm), OR 0x04 when a register source
    /// is extended (ModR/M.reg).
    fn binary_prefix(&mut self, dest: Register, source: Operand) {
        let mut prefix = 0x48;
        if dest.is_extended() {
            prefix |= 0x01;
        }
        if let Operand::Register(source) = source {
            if source.is_extended() {
                prefix |= 0x04;
            }
        }
        self.byte(prefix);
    }

    fn basic_binary(
        &mut self,
        dest: Operand,
        source: Operand,
        config: BasicBinary,
    ) -> Result<(), EmitError> {
        let dest = register(dest, "binary op")?;
        self.binary_prefix(dest, source);
        match source {
            Operand::Register(source) => {
                self.byte(config.reg_opcode);
                self.byte(config.reg_base + dest.modrm() + (source.modrm() << 3));
                Ok(())
            }
            Operand::Constant(value) => {
                self.byte(config.imm_opcode);
                self.byte(config.imm_base + dest.modrm());
                self.imm32(value as u32);
                Ok(())
            }
            Operand::StackSlot(_) => Err(EmitError::BadOperand("binary op")),
        }
    }

    fn mov(&mut self, dest: Operand, source: Operand) -> Result<(), EmitError> {
        if let Operand::StackSlot(offset) = source {
            return self.load(dest, offset);
        }
        if let Operand::StackSlot(offset) = dest {
            return self.store(offset, source);
        }

        let dest = register(dest, "mov")?;
        self.binary_prefix(dest, source);
        match source {
            Operand::Register(source) => {
                self.byte(0x89);
                self.byte(0xc0 + dest.modrm() + (source.modrm() << 3));
                Ok(())
            }
            Operand::Constant(value) => {
                self.byte(0xb8 + dest.modrm());
                self.imm64(value);
                Ok(())
            }
            Operand::StackSlot(_) => unreachable!("handled above"),
        }
    }

    /// `mov reg, [rbp + disp8]`. Only signed 8-bit displacements encode.
    fn load(&mut self, dest: Operand, offset: i32) -> Result<(), EmitError> {
        let dest = register(dest, "load")?;
        let disp = disp8(offset)?;
        let mut prefix = 0x48;
        if dest.is_extended() {
            prefix |= 0x04;
        }
        self.byte(prefix);
        self.byte(0x8b);
        self.byte(0x45 + (dest.modrm() << 3));
        self.byte(disp as u8);
        Ok(())
    }

    /// `mov [rbp + disp8], reg`.
    fn store(&mut self, offset: i32, source: Operand) -> Result<(), EmitError> {
        let source = register(source, "store")?;
        let disp = disp8(offset)?;
        let mut prefix = 0x48;
        if source.is_extended() {
            prefix |= 0x04;
        }
        self.byte(prefix);
        self.byte(0x89);
        self.byte(0x45 + (source.modrm() << 3));
        self.byte(disp as u8);
        Ok(())
    }

    fn imul(&mut self, dest: Operand, source: Operand) -> Result<(), EmitError> {
        let dest = register(dest, "imul")?;
        self.binary_prefix(dest, source);
        let reg = 0xc0 + (dest.modrm() << 3);
        match source {
            Operand::Register(source) => {
                self.byte(0x0f);
                self.byte(0xaf);
                self.byte(reg + source.modrm());
                Ok(())
            }
            Operand::Constant(value) => {
                self.byte(0x69);
                self.byte(reg + dest.modrm());
                self.imm32(value as u32);
                Ok(())
            }
            Operand::StackSlot(_) => Err(EmitError::BadOperand("imul")),
        }
    }

    fn shift(&mut self, dest: Operand, source: Operand, reg_mask: u8) -> Result<(), EmitError> {
        let dest = register(dest, "shift")?;
        self.binary_prefix(dest, source);
        let reg = (0xe0 + dest.modrm()) | reg_mask;
        match source {
            Operand::Register(source) => {
                if source != Register::Rcx {
                    return Err(EmitError::InvalidShiftRegister(source.name()));
                }
                self.byte(0xd3);
                self.byte(reg);
                Ok(())
            }
            Operand::Constant(value) => {
                self.byte(0xc1);
                self.byte(reg);
                self.byte(value as u8);
                Ok(())
            }
            Operand::StackSlot(_) => Err(EmitError::BadOperand("shift")),
        }
    }

    fn test8(&mut self, dest: Operand, source: Operand) -> Result<(), EmitError> {
        let dest = register(dest, "test")?;
        let source = register(source, "test")?;
        let mut prefix = 0x40;
        if dest.is_extended() {
            prefix |= 0x01;
        }
        if source.is_extended() {
            prefix |= 0x04;
        }
        self.byte(prefix);
        self.byte(0x84);
        self.byte(0xc0 | dest.modrm() | (source.modrm() << 3));
        Ok(())
    }

    fn byte(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn imm32(&mut self, value: u32) {
        self.buf.extend(value.to_le_bytes());
    }

    fn imm64(&mut self, value: u64) {
        self.buf.extend(value.to_le_bytes());
    }

    /// Record a fixup for the 4 bytes just emitted.
    fn bind_rel32(&mut self, target: FixupTarget) {
        let base = self.buf.len();
        self.fixups.push(Fixup { target, base, pos: base - 4 });
    }
}

fn register(operand: Operand, context: &'static str) -> Result<Register, EmitError> {
    match operand {
        Operand::Register(reg) => Ok(reg),
        _ => Err(EmitError::BadOperand(context)),
    }
}

fn disp8(offset: i32) -> Result<i8, EmitError> {
    i8::try_from(offset).map_err(|_| EmitError::SlotOutOfRange(offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::{FuncId, Function};
    use proptest::prelude::*;

    fn assemble_insts(insts: Vec<Inst>) -> Vec<u8> {
        let program = Program {
            functions: vec![Function { name: "f".into(), insts }],
        };
        let mut asm = Assembler::new(&program);
        asm.assemble().unwrap();
        asm.into_code()
    }

    fn mov_rr(dest: Register, source: Register) -> Inst {
        Inst::Binary {
            op: BinaryOp::Mov,
            dest: Operand::Register(dest),
            source: Operand::Register(source),
        }
    }

    #[test]
    fn test_mov_reg_reg() {
        assert_eq!(assemble_insts(vec![mov_rr(Register::Rax, Register::Rbx)]), [0x48, 0x89, 0xd8]);
        // Extended destination sets REX.B; extended source sets REX.R.
        assert_eq!(assemble_insts(vec![mov_rr(Register::R8, Register::Rax)]), [0x49, 0x89, 0xc0]);
        assert_eq!(assemble_insts(vec![mov_rr(Register::Rax, Register::R9)]), [0x4c, 0x89, 0xc8]);
    }

    #[test]
    fn test_mov_imm64() {
        let code = assemble_insts(vec![Inst::Binary {
            op: BinaryOp::Mov,
            dest: Operand::Register(Register::Rax),
            source: Operand::Constant(0x1122334455667788),
        }]);
        assert_eq!(
            code,
            [0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(
            assemble_insts(vec![Inst::Unary {
                op: UnaryOp::Push,
                operand: Operand::Register(Register::Rbp),
            }]),
            [0x55]
        );
        assert_eq!(
            assemble_insts(vec![Inst::Unary {
                op: UnaryOp::Push,
                operand: Operand::Register(Register::R9),
            }]),
            [0x41, 0x51]
        );
        assert_eq!(
            assemble_insts(vec![Inst::Unary {
                op: UnaryOp::Pop,
                operand: Operand::Register(Register::Rbp),
            }]),
            [0x5d]
        );
    }

    #[test]
    fn test_add_sub_imm() {
        // add rsp, 16
        assert_eq!(
            assemble_insts(vec![Inst::Binary {
                op: BinaryOp::Add,
                dest: Operand::Register(Register::Rsp),
                source: Operand::Constant(16),
            }]),
            [0x48, 0x81, 0xc4, 0x10, 0x00, 0x00, 0x00]
        );
        // sub r8, 5 (REX.B for the extended rm)
        assert_eq!(
            assemble_insts(vec![Inst::Binary {
                op: BinaryOp::Sub,
                dest: Operand::Register(Register::R8),
                source: Operand::Constant(5),
            }]),
            [0x49, 0x81, 0xe8, 0x05, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_imul() {
        // imul rax, rbx
        assert_eq!(
            assemble_insts(vec![Inst::Binary {
                op: BinaryOp::Imul,
                dest: Operand::Register(Register::Rax),
                source: Operand::Register(Register::Rbx),
            }]),
            [0x48, 0x0f, 0xaf, 0xc3]
        );
    }

    #[test]
    fn test_shift_requires_rcx() {
        let err = {
            let program = Program {
                functions: vec![Function {
                    name: "f".into(),
                    insts: vec![Inst::Binary {
                        op: BinaryOp::Shl,
                        dest: Operand::Register(Register::Rax),
                        source: Operand::Register(Register::Rbx),
                    }],
                }],
            };
            let mut asm = Assembler::new(&program);
            asm.assemble().unwrap_err()
        };
        assert!(matches!(err, EmitError::InvalidShiftRegister("rbx")));

        // shl rax, cl
        assert_eq!(
            assemble_insts(vec![Inst::Binary {
                op: BinaryOp::Shl,
                dest: Operand::Register(Register::Rax),
                source: Operand::Register(Register::Rcx),
            }]),
            [0x48, 0xd3, 0xe0]
        );
        // shr rax, 3
        assert_eq!(
            assemble_insts(vec![Inst::Binary {
                op: BinaryOp::Shr,
                dest: Operand::Register(Register::Rax),
                source: Operand::Constant(3),
            }]),
            [0x48, 0xc1, 0xe8, 0x03]
        );
    }

    #[test]
    fn test_stack_slot_moves() {
        // mov rax, [rbp - 8]
        assert_eq!(
            assemble_insts(vec![Inst::Binary {
                op: BinaryOp::Mov,
                dest: Operand::Register(Register::Rax),
                source: Operand::StackSlot(-8),
            }]),
            [0x48, 0x8b, 0x45, 0xf8]
        );
        // mov [rbp + 16], rdi
        assert_eq!(
            assemble_insts(vec![Inst::Binary {
                op: BinaryOp::Mov,
                dest: Operand::StackSlot(16),
                source: Operand::Register(Register::Rdi),
            }]),
            [0x48, 0x89, 0x7d, 0x10]
        );
    }

    #[test]
    fn test_slot_out_of_range() {
        let program = Program {
            functions: vec![Function {
                name: "f".into(),
                insts: vec![Inst::Binary {
                    op: BinaryOp::Mov,
                    dest: Operand::Register(Register::Rax),
                    source: Operand::StackSlot(-136),
                }],
            }],
        };
        let mut asm = Assembler::new(&program);
        assert!(matches!(
            asm.assemble().unwrap_err(),
            EmitError::SlotOutOfRange(-136)
        ));
    }

    #[test]
    fn test_setcc_and_test() {
        // sete al
        assert_eq!(
            assemble_insts(vec![Inst::Unary {
                op: UnaryOp::Sete,
                operand: Operand::Register(Register::Rax),
            }]),
            [0x40, 0x0f, 0x94, 0xc0]
        );
        // test cl, cl
        assert_eq!(
            assemble_insts(vec![Inst::Binary {
                op: BinaryOp::Test8,
                dest: Operand::Register(Register::Rcx),
                source: Operand::Register(Register::Rcx),
            }]),
            [0x40, 0x84, 0xc9]
        );
    }

    #[test]
    fn test_backward_jump_displacement() {
        // [0] ret; [1] jmp [0]
        let code = assemble_insts(vec![
            Inst::Nullary { op: NullaryOp::Ret },
            Inst::Jump { cond: JumpCond::Always, target: Some(0) },
        ]);
        // jmp starts at 1, is 5 bytes, ends at 6; rel = 0 - 6 = -6.
        assert_eq!(code[0], 0xc3);
        assert_eq!(code[1], 0xe9);
        assert_eq!(i32::from_le_bytes([code[2], code[3], code[4], code[5]]), -6);
    }

    #[test]
    fn test_forward_jz_displacement() {
        // [0] jz [2]; [1] ret; [2] ret
        let code = assemble_insts(vec![
            Inst::Jump { cond: JumpCond::Zero, target: Some(2) },
            Inst::Nullary { op: NullaryOp::Ret },
            Inst::Nullary { op: NullaryOp::Ret },
        ]);
        // jz is 6 bytes; target instruction 2 is at offset 7; rel = 7 - 6.
        assert_eq!(&code[..2], [0x0f, 0x84]);
        assert_eq!(i32::from_le_bytes([code[2], code[3], code[4], code[5]]), 1);
    }

    #[test]
    fn test_call_targets_function_start() {
        let f = Function {
            name: "f".into(),
            insts: vec![Inst::Call { target: FuncId(1) }, Inst::Nullary { op: NullaryOp::Ret }],
        };
        let g = Function {
            name: "g".into(),
            insts: vec![Inst::Nullary { op: NullaryOp::Ret }],
        };
        let program = Program { functions: vec![f, g] };
        let mut asm = Assembler::new(&program);
        asm.assemble().unwrap();

        assert_eq!(asm.function_offset(0).unwrap(), 0);
        // call (5 bytes) + ret (1) -> g starts at 6; rel = 6 - 5 = 1.
        assert_eq!(asm.function_offset(1).unwrap(), 6);
        let code = asm.code();
        assert_eq!(code[0], 0xe8);
        assert_eq!(i32::from_le_bytes([code[1], code[2], code[3], code[4]]), 1);
    }

    #[test]
    fn test_empty_function_rejected() {
        let program = Program {
            functions: vec![Function { name: "empty".into(), insts: Vec::new() }],
        };
        let asm = Assembler::new(&program);
        assert!(matches!(
            asm.function_offset(0),
            Err(EmitError::EmptyFunction(_))
        ));
    }

    #[test]
    fn test_register_call() {
        assert_eq!(
            assemble_insts(vec![Inst::RegisterCall { reg: Register::Rcx }]),
            [0xff, 0xd1]
        );
        assert_eq!(
            assemble_insts(vec![Inst::RegisterCall { reg: Register::R10 }]),
            [0x41, 0xff, 0xd2]
        );
    }

    proptest! {
        /// rel32 fixups always land on `target - end_of_instruction`.
        #[test]
        fn prop_jump_fixup_arithmetic(pad_before in 0usize..20, pad_after in 0usize..20) {
            let mut insts = Vec::new();
            for _ in 0..pad_before {
                insts.push(Inst::Nullary { op: NullaryOp::Ret });
            }
            insts.push(Inst::Jump { cond: JumpCond::Always, target: Some(0) });
            for _ in 0..pad_after {
                insts.push(Inst::Nullary { op: NullaryOp::Ret });
            }
            // The jump targets instruction 0, which sits at offset 0.
            let code = assemble_insts(insts);
            let disp_pos = pad_before + 1;
            let rel = i32::from_le_bytes([
                code[disp_pos], code[disp_pos + 1], code[disp_pos + 2], code[disp_pos + 3],
            ]);
            let end = pad_before + 5;
            prop_assert_eq!(rel as i64, 0i64 - end as i64);
        }
    }
}
