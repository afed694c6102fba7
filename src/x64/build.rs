//! SSA to machine-IR lowering.
//!
//! Runs register allocation per function, then walks the blocks emitting
//! a flat instruction list. Block starts are recorded so branch targets
//! can be backpatched once every block has been emitted.

use super::{
    BinaryOp, Function, Inst, JumpCond, NullaryOp, Operand, Program, Register, UnaryOp,
};
use crate::regalloc::{self, RegMap};
use crate::runtime;
use crate::ssa::{self, BlockId, InstId, InstKind, Point, Terminator, Value};
use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeSet, HashMap};

/// Lower a whole SSA program, allocating registers as a side effect
/// (spill code is inserted into the SSA).
pub fn build_program(ssa_prog: &mut ssa::Program) -> Result<Program> {
    let mut program = Program {
        functions: ssa_prog
            .functions
            .iter()
            .map(|func| Function::new(func.name.clone()))
            .collect(),
    };

    for (i, ssa_func) in ssa_prog.functions.iter_mut().enumerate() {
        let allocation = regalloc::allocate(ssa_func)?;
        let builder = FunctionBuilder {
            func: &mut program.functions[i],
            ssa_func,
            regs: allocation.regs,
            live_vars: allocation.live_vars,
            block_map: HashMap::new(),
            unlinked: Vec::new(),
            pending_block: None,
            prologue_done: false,
        };
        builder.build()?;
    }
    Ok(program)
}

struct FunctionBuilder<'a> {
    func: &'a mut Function,
    ssa_func: &'a ssa::Function,
    regs: RegMap,
    live_vars: std::collections::BTreeMap<Point, BTreeSet<InstId>>,
    /// First machine instruction emitted for each SSA block.
    block_map: HashMap<BlockId, usize>,
    /// Jumps whose target block had not been emitted yet.
    unlinked: Vec<(BlockId, usize)>,
    pending_block: Option<BlockId>,
    prologue_done: bool,
}

impl FunctionBuilder<'_> {
    fn build(mut self) -> Result<()> {
        for block in self.ssa_func.block_ids().collect::<Vec<_>>() {
            self.build_block(block)?;
        }
        for (block, jump) in std::mem::take(&mut self.unlinked) {
            let target = *self
                .block_map
                .get(&block)
                .ok_or_else(|| anyhow!("jump to unemitted block @{}", block.0))?;
            match &mut self.func.insts[jump] {
                Inst::Jump { target: slot, .. } => *slot = Some(target),
                _ => bail!("unlinked entry does not name a jump"),
            }
        }
        Ok(())
    }

    fn build_block(&mut self, block: BlockId) -> Result<()> {
        self.pending_block = Some(block);
        for id in self.ssa_func.block(block).code().to_vec() {
            self.build_inst(id)?;
        }
        self.build_block_end(block)
    }

    fn build_inst(&mut self, id: InstId) -> Result<()> {
        self.ensure_prologue();
        let dest = self.reg_opt(id);

        match self.ssa_func.inst(id) {
            InstKind::Move { value } => {
                let Some(dest) = dest else { return Ok(()) };
                let source = self.operand(*value)?;
                self.mov(Operand::Register(dest), source);
            }

            InstKind::BinaryOperation { op, left, right } => {
                let Some(dest) = dest else { return Ok(()) };
                match op {
                    ssa::ArithOp::Shl | ssa::ArithOp::Shr => {
                        return self.build_shift(*op, *left, *right, dest);
                    }
                    _ => {}
                }

                let mut source = self.operand(*right)?;
                // A right operand living in dest would be clobbered by the
                // left move; stage it in rcx.
                if source == Operand::Register(dest) {
                    self.mov(Operand::Register(Register::Rcx), source);
                    source = Operand::Register(Register::Rcx);
                }

                let left = self.operand(*left)?;
                if left != Operand::Register(dest) {
                    self.mov(Operand::Register(dest), left);
                }

                let op = match op {
                    ssa::ArithOp::Add => BinaryOp::Add,
                    ssa::ArithOp::Sub => BinaryOp::Sub,
                    ssa::ArithOp::Mul => BinaryOp::Imul,
                    _ => unreachable!("shifts handled above"),
                };
                self.append(Inst::Binary { op, dest: Operand::Register(dest), source });
            }

            InstKind::Comparison { op, left, right } => {
                let Some(dest) = dest else { return Ok(()) };
                let mut left = self.operand(*left)?;
                if !matches!(left, Operand::Register(_)) {
                    self.mov(Operand::Register(dest), left);
                    left = Operand::Register(dest);
                }
                let right = self.operand(*right)?;
                self.append(Inst::Binary { op: BinaryOp::Cmp, dest: left, source: right });

                let setcc = match op {
                    ssa::CmpOp::Eq => UnaryOp::Sete,
                    ssa::CmpOp::Ne => UnaryOp::Setne,
                    ssa::CmpOp::Lt => UnaryOp::Setl,
                    ssa::CmpOp::Le => UnaryOp::Setle,
                    ssa::CmpOp::Gt => UnaryOp::Setg,
                    ssa::CmpOp::Ge => UnaryOp::Setge,
                };
                self.append(Inst::Unary { op: setcc, operand: Operand::Register(dest) });
            }

            InstKind::FunctionCall { callee, nreturn, args } => {
                let callee = *callee;
                let nreturn = *nreturn;
                let args = args.clone();
                let saved = self.save_registers(id, dest);
                for arg in &args {
                    let operand = self.operand(*arg)?;
                    self.append(Inst::Unary { op: UnaryOp::Push, operand });
                }
                self.append(Inst::Call { target: callee });
                self.append(Inst::Binary {
                    op: BinaryOp::Add,
                    dest: Operand::Register(Register::Rsp),
                    source: Operand::Constant(args.len() as u64 * 8),
                });
                if nreturn > 0 {
                    if let Some(dest) = dest {
                        self.mov(Operand::Register(dest), Operand::Register(Register::Rax));
                    }
                }
                self.restore_registers(&saved);
            }

            InstKind::StandardCall { kind, args } => {
                let address = runtime::helper_address(*kind);
                let args = args.clone();
                let saved = self.save_registers(id, dest);
                for arg in &args {
                    let operand = self.operand(*arg)?;
                    self.append(Inst::Unary { op: UnaryOp::Push, operand });
                }
                self.mov(Operand::Register(Register::Rcx), Operand::Constant(address));
                self.append(Inst::RegisterCall { reg: Register::Rcx });
                self.append(Inst::Binary {
                    op: BinaryOp::Add,
                    dest: Operand::Register(Register::Rsp),
                    source: Operand::Constant(args.len() as u64 * 8),
                });
                self.restore_registers(&saved);
            }

            InstKind::Phi(_) => {}

            InstKind::Load { slot } => {
                let Some(dest) = dest else { return Ok(()) };
                let offset = slot_offset(*slot);
                self.mov(Operand::Register(dest), Operand::StackSlot(offset));
            }

            InstKind::Store { slot, value } => {
                let offset = slot_offset(*slot);
                let source = self.operand(*value)?;
                self.mov(Operand::StackSlot(offset), source);
            }

            InstKind::LoadArgument { index } => {
                let Some(dest) = dest else { return Ok(()) };
                // Arguments sit above the saved rbp and the return address.
                let offset = 8 * (self.ssa_func.nargs as i32 - 1 + 2 - *index as i32);
                self.mov(Operand::Register(dest), Operand::StackSlot(offset));
            }
        }
        Ok(())
    }

    fn build_shift(
        &mut self,
        op: ssa::ArithOp,
        left: Value,
        right: Value,
        dest: Register,
    ) -> Result<()> {
        let mut source = self.operand(right)?;
        // The variable shift count must be in cl.
        if matches!(source, Operand::Register(_)) {
            self.mov(Operand::Register(Register::Rcx), source);
            source = Operand::Register(Register::Rcx);
        }

        let left = self.operand(left)?;
        if left != Operand::Register(dest) {
            self.mov(Operand::Register(dest), left);
        }

        let op = match op {
            ssa::ArithOp::Shl => BinaryOp::Shl,
            ssa::ArithOp::Shr => BinaryOp::Shr,
            _ => bail!("build_shift called for a non-shift"),
        };
        self.append(Inst::Binary { op, dest: Operand::Register(dest), source });
        Ok(())
    }

    fn build_block_end(&mut self, block: BlockId) -> Result<()> {
        self.ensure_prologue();
        let terminator = self
            .ssa_func
            .block(block)
            .terminator()
            .ok_or_else(|| anyhow!("block @{} has no terminator", block.0))?
            .clone();

        match terminator {
            Terminator::UnconditionalBranch { target } => {
                self.build_phi_transfers(block)?;
                let jump = self.append(Inst::Jump { cond: JumpCond::Always, target: None });
                self.bind(target, jump);
            }

            Terminator::Branch { cond, yes, no } => {
                // Stage the condition in rcx before φ transfers can
                // clobber its register.
                let operand = self.operand(cond)?;
                self.mov(Operand::Register(Register::Rcx), operand);
                self.build_phi_transfers(block)?;
                self.append(Inst::Binary {
                    op: BinaryOp::Test8,
                    dest: Operand::Register(Register::Rcx),
                    source: Operand::Register(Register::Rcx),
                });

                let jz = self.append(Inst::Jump { cond: JumpCond::Zero, target: None });
                self.bind(no, jz);
                let jmp = self.append(Inst::Jump { cond: JumpCond::Always, target: None });
                self.bind(yes, jmp);
            }

            Terminator::ReturnVoid => {
                self.epilogue();
                self.append(Inst::Nullary { op: NullaryOp::Ret });
            }

            Terminator::Return { value } => {
                let operand = self.operand(value)?;
                self.mov(Operand::Register(Register::Rax), operand);
                self.epilogue();
                self.append(Inst::Nullary { op: NullaryOp::Ret });
            }
        }
        Ok(())
    }

    /// Materialize φ transfers for every successor edge leaving `block`.
    fn build_phi_transfers(&mut self, block: BlockId) -> Result<()> {
        let succs: Vec<BlockId> = self
            .ssa_func
            .block(block)
            .successors()
            .iter()
            .copied()
            .collect();
        for succ in succs {
            for (phi, value) in self.ssa_func.phis_for_pred(succ, block) {
                if let Some(reg) = self.reg_opt(phi) {
                    let operand = self.operand(value)?;
                    self.mov(Operand::Register(reg), operand);
                }
            }
        }
        Ok(())
    }

    /// Push every live register (except the call's own destination) and
    /// pad to keep rsp 16-byte aligned.
    fn save_registers(&mut self, call: InstId, dest: Option<Register>) -> Vec<Register> {
        let live: Vec<InstId> = self
            .live_vars
            .get(&Point::Inst(call))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut saved = Vec::new();
        for inst in live {
            let Some(reg) = self.reg_opt(inst) else { continue };
            if dest == Some(reg) {
                continue;
            }
            if saved.contains(&reg) {
                continue;
            }
            saved.push(reg);
            self.append(Inst::Unary { op: UnaryOp::Push, operand: Operand::Register(reg) });
        }

        if saved.len() % 2 == 1 {
            self.append(Inst::Binary {
                op: BinaryOp::Sub,
                dest: Operand::Register(Register::Rsp),
                source: Operand::Constant(8),
            });
        }
        saved
    }

    fn restore_registers(&mut self, saved: &[Register]) {
        if saved.len() % 2 == 1 {
            self.append(Inst::Binary {
                op: BinaryOp::Add,
                dest: Operand::Register(Register::Rsp),
                source: Operand::Constant(8),
            });
        }
        for reg in saved.iter().rev() {
            self.append(Inst::Unary { op: UnaryOp::Pop, operand: Operand::Register(*reg) });
        }
    }

    /// Frame size: spill slots padded so rsp stays 16-byte aligned.
    fn sspace(&self) -> u64 {
        let slots = self.ssa_func.stack_slots as u64;
        let nargs = self.ssa_func.nargs as u64;
        8 * (slots + (slots + nargs) % 2)
    }

    fn ensure_prologue(&mut self) {
        if !self.prologue_done {
            self.prologue_done = true;
            self.append(Inst::Unary {
                op: UnaryOp::Push,
                operand: Operand::Register(Register::Rbp),
            });
            self.mov(Operand::Register(Register::Rbp), Operand::Register(Register::Rsp));
            self.append(Inst::Binary {
                op: BinaryOp::Sub,
                dest: Operand::Register(Register::Rsp),
                source: Operand::Constant(self.sspace()),
            });
        }
    }

    fn epilogue(&mut self) {
        self.append(Inst::Binary {
            op: BinaryOp::Add,
            dest: Operand::Register(Register::Rsp),
            source: Operand::Constant(self.sspace()),
        });
        self.append(Inst::Unary { op: UnaryOp::Pop, operand: Operand::Register(Register::Rbp) });
    }

    fn operand(&self, value: Value) -> Result<Operand> {
        match value {
            Value::Empty => bail!("unexpected empty SSA value"),
            Value::Constant(c) => Ok(Operand::Constant(c)),
            Value::Def(id) => {
                let reg = self
                    .reg_opt(id)
                    .ok_or_else(|| anyhow!("%{} was not assigned a register", id.0))?;
                Ok(Operand::Register(reg))
            }
        }
    }

    fn reg_opt(&self, id: InstId) -> Option<Register> {
        self.regs.get(&id).copied()
    }

    fn mov(&mut self, dest: Operand, source: Operand) {
        self.append(Inst::Binary { op: BinaryOp::Mov, dest, source });
    }

    fn append(&mut self, inst: Inst) -> usize {
        let index = self.func.insts.len();
        self.func.insts.push(inst);
        if let Some(block) = self.pending_block.take() {
            self.block_map.insert(block, index);
        }
        index
    }

    fn bind(&mut self, block: BlockId, jump: usize) {
        match self.block_map.get(&block) {
            Some(&target) => {
                if let Inst::Jump { target: slot, .. } = &mut self.func.insts[jump] {
                    *slot = Some(target);
                }
            }
            None => self.unlinked.push((block, jump)),
        }
    }
}

/// rbp-relative byte offset of spill slot `slot`.
fn slot_offset(slot: usize) -> i32 {
    8 * (-(slot as i32) - 1)
}
