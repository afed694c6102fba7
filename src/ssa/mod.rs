//! SSA intermediate representation.
//!
//! Each function owns an instruction arena indexed by [`InstId`]; ids are
//! stable for the lifetime of the compilation, so values can refer to their
//! defining instruction by index instead of by pointer. Blocks keep an
//! ordered list of instruction ids and exactly one terminator. Predecessor
//! and successor sets are derived from terminators and kept coherent by
//! [`Function::terminate`], the only way to (re)assign one.

mod build;
mod dominators;
pub mod liveness;
mod simplify;

pub use build::build_program;
pub use dominators::Dominators;
pub use liveness::{InterferenceGraph, Liveness, Point};
pub use simplify::simplify;

pub use crate::jir::{ArithOp, CmpOp, FuncId, StandardKind};

use std::collections::BTreeSet;
use std::fmt;

/// Identity of an SSA instruction within its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId(pub u32);

/// Identity of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

/// An SSA operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Value {
    /// Not yet linked; must not survive construction.
    #[default]
    Empty,
    Constant(u64),
    /// The value produced by an instruction.
    Def(InstId),
}

impl Value {
    pub fn def(self) -> Option<InstId> {
        match self {
            Value::Def(id) => Some(id),
            _ => None,
        }
    }
}

/// One incoming `(predecessor, value)` pair of a φ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhiPair {
    pub block: BlockId,
    pub value: Value,
}

/// SSA instruction payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    Move {
        value: Value,
    },
    BinaryOperation {
        op: ArithOp,
        left: Value,
        right: Value,
    },
    Comparison {
        op: CmpOp,
        left: Value,
        right: Value,
    },
    FunctionCall {
        callee: FuncId,
        /// Snapshot of the callee's return count, so liveness and lowering
        /// need no cross-function lookups.
        nreturn: usize,
        args: Vec<Value>,
    },
    StandardCall {
        kind: StandardKind,
        args: Vec<Value>,
    },
    Phi(Vec<PhiPair>),
    Load {
        slot: usize,
    },
    Store {
        slot: usize,
        value: Value,
    },
    LoadArgument {
        index: usize,
    },
}

impl InstKind {
    /// The operand values this instruction reads, in a stable order.
    /// φ pair values are included.
    pub fn inputs(&self) -> Vec<&Value> {
        match self {
            InstKind::Move { value } => vec![value],
            InstKind::BinaryOperation { left, right, .. }
            | InstKind::Comparison { left, right, .. } => vec![left, right],
            InstKind::FunctionCall { args, .. } | InstKind::StandardCall { args, .. } => {
                args.iter().collect()
            }
            InstKind::Phi(pairs) => pairs.iter().map(|pair| &pair.value).collect(),
            InstKind::Load { .. } | InstKind::LoadArgument { .. } => Vec::new(),
            InstKind::Store { value, .. } => vec![value],
        }
    }

    /// Mutable operand slots, in the same order as [`InstKind::inputs`].
    pub fn inputs_mut(&mut self) -> Vec<&mut Value> {
        match self {
            InstKind::Move { value } => vec![value],
            InstKind::BinaryOperation { left, right, .. }
            | InstKind::Comparison { left, right, .. } => vec![left, right],
            InstKind::FunctionCall { args, .. } | InstKind::StandardCall { args, .. } => {
                args.iter_mut().collect()
            }
            InstKind::Phi(pairs) => pairs.iter_mut().map(|pair| &mut pair.value).collect(),
            InstKind::Load { .. } | InstKind::LoadArgument { .. } => Vec::new(),
            InstKind::Store { value, .. } => vec![value],
        }
    }

    /// Whether the instruction must be kept even when its value is unused.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            InstKind::FunctionCall { .. } | InstKind::StandardCall { .. } | InstKind::Store { .. }
        )
    }

    /// Whether the instruction defines an SSA value.
    pub fn produces_value(&self) -> bool {
        match self {
            InstKind::Move { .. }
            | InstKind::BinaryOperation { .. }
            | InstKind::Comparison { .. }
            | InstKind::Phi(_)
            | InstKind::Load { .. }
            | InstKind::LoadArgument { .. } => true,
            InstKind::FunctionCall { nreturn, .. } => *nreturn > 0,
            InstKind::StandardCall { .. } | InstKind::Store { .. } => false,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi(_))
    }
}

/// Block terminators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    UnconditionalBranch { target: BlockId },
    Branch { cond: Value, yes: BlockId, no: BlockId },
    ReturnVoid,
    Return { value: Value },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::UnconditionalBranch { target } => vec![*target],
            Terminator::Branch { yes, no, .. } => vec![*yes, *no],
            Terminator::ReturnVoid | Terminator::Return { .. } => Vec::new(),
        }
    }

    pub fn inputs(&self) -> Vec<&Value> {
        match self {
            Terminator::Branch { cond, .. } => vec![cond],
            Terminator::Return { value } => vec![value],
            _ => Vec::new(),
        }
    }

    pub fn inputs_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Terminator::Branch { cond, .. } => vec![cond],
            Terminator::Return { value } => vec![value],
            _ => Vec::new(),
        }
    }
}

/// Arena entry: an instruction and its owning block.
#[derive(Debug, Clone)]
struct Inst {
    kind: InstKind,
    block: BlockId,
}

/// A basic block: ordered instructions plus one terminator.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    code: Vec<InstId>,
    terminator: Option<Terminator>,
    predecessors: BTreeSet<BlockId>,
    successors: BTreeSet<BlockId>,
}

impl BasicBlock {
    pub fn code(&self) -> &[InstId] {
        &self.code
    }

    pub fn terminator(&self) -> Option<&Terminator> {
        self.terminator.as_ref()
    }

    pub fn predecessors(&self) -> &BTreeSet<BlockId> {
        &self.predecessors
    }

    pub fn successors(&self) -> &BTreeSet<BlockId> {
        &self.successors
    }
}

/// An SSA function.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub nargs: usize,
    pub nreturn: usize,
    /// Stack slots consumed by spills.
    pub stack_slots: usize,
    insts: Vec<Inst>,
    blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn new(name: impl Into<String>, nargs: usize, nreturn: usize) -> Self {
        Self {
            name: name.into(),
            nargs,
            nreturn,
            stack_slots: 0,
            insts: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Append a new empty block; the first block added is the entry.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::default());
        id
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Block ids in creation order (entry first).
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn inst(&self, id: InstId) -> &InstKind {
        &self.insts[id.0 as usize].kind
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut InstKind {
        &mut self.insts[id.0 as usize].kind
    }

    /// The block owning `id`.
    pub fn inst_block(&self, id: InstId) -> BlockId {
        self.insts[id.0 as usize].block
    }

    /// Append an instruction to the end of `block`.
    pub fn append(&mut self, block: BlockId, kind: InstKind) -> InstId {
        let id = self.alloc(block, kind);
        self.blocks[block.0 as usize].code.push(id);
        id
    }

    /// Prepend an instruction to the front of `block`.
    pub fn prepend(&mut self, block: BlockId, kind: InstKind) -> InstId {
        let id = self.alloc(block, kind);
        self.blocks[block.0 as usize].code.insert(0, id);
        id
    }

    /// Insert an instruction immediately before `before` in its block.
    pub fn insert_before(&mut self, before: InstId, kind: InstKind) -> InstId {
        let block = self.inst_block(before);
        let pos = self.position(block, before);
        let id = self.alloc(block, kind);
        self.blocks[block.0 as usize].code.insert(pos, id);
        id
    }

    /// Insert an instruction immediately after `after` in its block.
    pub fn insert_after(&mut self, after: InstId, kind: InstKind) -> InstId {
        let block = self.inst_block(after);
        let pos = self.position(block, after);
        let id = self.alloc(block, kind);
        self.blocks[block.0 as usize].code.insert(pos + 1, id);
        id
    }

    /// Remove an instruction from its block. The arena entry stays behind;
    /// nothing may reference the erased id afterwards.
    pub fn erase(&mut self, id: InstId) {
        let block = self.inst_block(id);
        self.blocks[block.0 as usize].code.retain(|&i| i != id);
    }

    /// Assign `block`'s terminator and rebuild the affected edge sets.
    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) {
        let old_succs: Vec<BlockId> = self.blocks[block.0 as usize]
            .successors
            .iter()
            .copied()
            .collect();
        for succ in old_succs {
            self.blocks[succ.0 as usize].predecessors.remove(&block);
        }
        self.blocks[block.0 as usize].successors.clear();

        let succs = terminator.successors();
        self.blocks[block.0 as usize].terminator = Some(terminator);
        for succ in succs {
            self.blocks[block.0 as usize].successors.insert(succ);
            self.blocks[succ.0 as usize].predecessors.insert(block);
        }
    }

    /// Mutable access to the value operands of `block`'s terminator.
    /// Targets are not reachable this way; use [`Function::terminate`] to
    /// change them.
    pub fn terminator_inputs_mut(&mut self, block: BlockId) -> Vec<&mut Value> {
        match &mut self.blocks[block.0 as usize].terminator {
            Some(term) => term.inputs_mut(),
            None => Vec::new(),
        }
    }

    /// The leading φs of `block` paired with the value each carries for
    /// edge `pred -> block`.
    pub fn phis_for_pred(&self, block: BlockId, pred: BlockId) -> Vec<(InstId, Value)> {
        let mut result = Vec::new();
        for &id in self.block(block).code() {
            let InstKind::Phi(pairs) = self.inst(id) else {
                break;
            };
            if let Some(pair) = pairs.iter().find(|pair| pair.block == pred) {
                result.push((id, pair.value));
            }
        }
        result
    }

    fn alloc(&mut self, block: BlockId, kind: InstKind) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Inst { kind, block });
        id
    }

    fn position(&self, block: BlockId, id: InstId) -> usize {
        self.blocks[block.0 as usize]
            .code
            .iter()
            .position(|&i| i == id)
            .expect("instruction listed in its owning block")
    }
}

/// All SSA functions of a program. Function order matches the linear IR,
/// so [`FuncId`] is shared across stages.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0]
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, func) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
                writeln!(f)?;
            }
            self.fmt_function(f, func)?;
        }
        Ok(())
    }
}

impl Program {
    fn fmt_function(&self, f: &mut fmt::Formatter<'_>, func: &Function) -> fmt::Result {
        writeln!(f, "function {} ({}) {{", func.name, func.nargs)?;
        for (i, block) in func.block_ids().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            self.fmt_block(f, func, block)?;
        }
        write!(f, "}}")
    }

    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, func: &Function, id: BlockId) -> fmt::Result {
        let block = func.block(id);
        writeln!(f, "    block @{}", id.0)?;
        write!(f, "    pred(")?;
        fmt_ids(f, block.predecessors())?;
        writeln!(f, ")")?;
        write!(f, "    succ(")?;
        fmt_ids(f, block.successors())?;
        writeln!(f, ") {{")?;

        for &inst in block.code() {
            write!(f, "        %{} = ", inst.0)?;
            self.fmt_inst(f, func.inst(inst))?;
            writeln!(f)?;
        }
        if let Some(term) = block.terminator() {
            write!(f, "        ")?;
            fmt_terminator(f, term)?;
            writeln!(f)?;
        }
        writeln!(f, "    }}")
    }

    fn fmt_inst(&self, f: &mut fmt::Formatter<'_>, kind: &InstKind) -> fmt::Result {
        match kind {
            InstKind::Move { value } => write!(f, "{}", value),
            InstKind::BinaryOperation { op, left, right } => {
                write!(f, "{} {} {}", left, op, right)
            }
            InstKind::Comparison { op, left, right } => write!(f, "{} {} {}", left, op, right),
            InstKind::FunctionCall { callee, args, .. } => {
                write!(f, "call {}(", self.function(*callee).name)?;
                fmt_values(f, args)?;
                write!(f, ")")
            }
            InstKind::StandardCall { kind, args } => {
                write!(f, "call {}(", kind)?;
                fmt_values(f, args)?;
                write!(f, ")")
            }
            InstKind::Phi(pairs) => {
                write!(f, "phi ")?;
                for (i, pair) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[@{}, {}]", pair.block.0, pair.value)?;
                }
                Ok(())
            }
            InstKind::Load { slot } => write!(f, "load [{}]", slot),
            InstKind::Store { slot, value } => write!(f, "store [{}], {}", slot, value),
            InstKind::LoadArgument { index } => write!(f, "load arg_{}", index),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "<empty>"),
            Value::Constant(c) => write!(f, "{}", *c as i64),
            Value::Def(id) => write!(f, "%{}", id.0),
        }
    }
}

fn fmt_terminator(f: &mut fmt::Formatter<'_>, term: &Terminator) -> fmt::Result {
    match term {
        Terminator::UnconditionalBranch { target } => write!(f, "goto @{}", target.0),
        Terminator::Branch { cond, yes, no } => {
            write!(f, "goto {} ? @{} : @{}", cond, yes.0, no.0)
        }
        Terminator::ReturnVoid => write!(f, "return"),
        Terminator::Return { value } => write!(f, "return {}", value),
    }
}

fn fmt_ids(f: &mut fmt::Formatter<'_>, ids: &BTreeSet<BlockId>) -> fmt::Result {
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", id.0)?;
    }
    Ok(())
}

fn fmt_values(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminate_maintains_edges() {
        let mut func = Function::new("test", 0, 0);
        let a = func.add_block();
        let b = func.add_block();
        let c = func.add_block();

        func.terminate(a, Terminator::UnconditionalBranch { target: b });
        assert!(func.block(b).predecessors().contains(&a));
        assert!(func.block(a).successors().contains(&b));

        // Retargeting drops the old edge.
        func.terminate(a, Terminator::UnconditionalBranch { target: c });
        assert!(!func.block(b).predecessors().contains(&a));
        assert!(func.block(c).predecessors().contains(&a));
        assert_eq!(func.block(a).successors().len(), 1);
    }

    #[test]
    fn test_branch_edges_both_ways() {
        let mut func = Function::new("test", 0, 0);
        let a = func.add_block();
        let yes = func.add_block();
        let no = func.add_block();
        let cond = func.append(
            a,
            InstKind::Comparison {
                op: CmpOp::Eq,
                left: Value::Constant(1),
                right: Value::Constant(2),
            },
        );
        func.terminate(a, Terminator::Branch { cond: Value::Def(cond), yes, no });

        for succ in func.block(a).successors() {
            assert!(func.block(*succ).predecessors().contains(&a));
        }
        assert_eq!(func.block(a).successors().len(), 2);
    }

    #[test]
    fn test_insert_and_erase() {
        let mut func = Function::new("test", 0, 0);
        let b = func.add_block();
        let first = func.append(b, InstKind::Load { slot: 0 });
        let third = func.append(b, InstKind::Load { slot: 2 });
        let second = func.insert_before(third, InstKind::Load { slot: 1 });
        let fourth = func.insert_after(third, InstKind::Load { slot: 3 });

        assert_eq!(func.block(b).code(), &[first, second, third, fourth]);

        func.erase(second);
        assert_eq!(func.block(b).code(), &[first, third, fourth]);
    }

    #[test]
    fn test_phis_for_pred() {
        let mut func = Function::new("test", 0, 0);
        let a = func.add_block();
        let b = func.add_block();
        let j = func.add_block();
        let x = func.append(a, InstKind::Move { value: Value::Constant(1) });
        let y = func.append(b, InstKind::Move { value: Value::Constant(2) });
        let phi = func.prepend(
            j,
            InstKind::Phi(vec![
                PhiPair { block: a, value: Value::Def(x) },
                PhiPair { block: b, value: Value::Def(y) },
            ]),
        );
        // A non-phi after the prefix ends the scan.
        func.append(j, InstKind::Move { value: Value::Def(phi) });

        let from_a = func.phis_for_pred(j, a);
        assert_eq!(from_a, vec![(phi, Value::Def(x))]);
        let from_b = func.phis_for_pred(j, b);
        assert_eq!(from_b, vec![(phi, Value::Def(y))]);
    }
}
