//! SSA construction from linear IR.
//!
//! Blocks are discovered while walking the linear instruction list: a new
//! block starts at the first instruction, at every branch target, and after
//! every terminator. Uses of a variable with no in-block definition are
//! left unlinked and resolved after φ insertion from the per-block entry
//! values computed by the φ fixer.

use super::dominators::{DefMap, PhiFixer};
use super::{BlockId, Function, InstId, InstKind, Program, Terminator, Value};
use crate::jir::{self, InstrId, InstrKind, Variable};
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use std::collections::HashMap;

/// Build the SSA program for a lowered linear-IR program.
pub fn build_program(jprog: &jir::Program) -> Result<Program> {
    let mut functions: Vec<Function> = jprog
        .functions
        .iter()
        .map(|jfunc| Function::new(jfunc.name.clone(), jfunc.nargs, jfunc.nreturn))
        .collect();

    for (i, jfunc) in jprog.functions.iter().enumerate() {
        FunctionBuilder::new(&mut functions[i], jfunc, jprog)
            .build()
            .with_context(|| format!("building SSA for {}", jfunc.name))?;
        debug!("built SSA for {}: {} blocks", jfunc.name, functions[i].num_blocks());
    }

    Ok(Program { functions })
}

/// Where an unlinked use sits: an instruction operand slot or the block's
/// terminator value.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Input { inst: InstId, index: usize },
    Term { block: BlockId },
}

#[derive(Debug)]
struct UnlinkedValue {
    var: Variable,
    slot: Slot,
}

struct FunctionBuilder<'a> {
    func: &'a mut Function,
    jfunc: &'a jir::Function,
    jprog: &'a jir::Program,
    defs: DefMap,
    unlinked: HashMap<BlockId, Vec<UnlinkedValue>>,
    block_map: HashMap<InstrId, BlockId>,
}

impl<'a> FunctionBuilder<'a> {
    fn new(func: &'a mut Function, jfunc: &'a jir::Function, jprog: &'a jir::Program) -> Self {
        Self {
            func,
            jfunc,
            jprog,
            defs: DefMap::new(),
            unlinked: HashMap::new(),
            block_map: HashMap::new(),
        }
    }

    fn build(mut self) -> Result<()> {
        if self.jfunc.insts.is_empty() {
            bail!("function has no instructions");
        }

        let entry = self.func.add_block();
        self.defs.entry(entry).or_default();
        let first = self.block(InstrId(0));
        self.func.terminate(entry, Terminator::UnconditionalBranch { target: first });
        for i in 0..self.func.nargs {
            let id = self.func.append(entry, InstKind::LoadArgument { index: i });
            self.defs
                .entry(entry)
                .or_default()
                .insert(Variable::local(i as u64), Value::Def(id));
        }

        let mut j = 0;
        while j < self.jfunc.insts.len() {
            let block = self.block(InstrId(j));
            j = self.build_block(block, j)?;
        }

        let fixer = PhiFixer::new(&mut *self.func, &mut self.defs);
        let links = fixer.fix()?;

        for (block, entries) in &self.unlinked {
            let block_links = links.get(block);
            for entry in entries {
                let value = block_links
                    .and_then(|map| map.get(&entry.var))
                    .copied()
                    .ok_or_else(|| {
                        anyhow!("no value for {} at entry of block @{}", entry.var, block.0)
                    })?;
                match entry.slot {
                    Slot::Input { inst, index } => {
                        *self.func.inst_mut(inst).inputs_mut()[index] = value;
                    }
                    Slot::Term { block } => {
                        *self.func.terminator_inputs_mut(block)[0] = value;
                    }
                }
            }
        }
        Ok(())
    }

    /// Translate linear instructions into `block` starting at index `j`;
    /// returns the index of the first untranslated instruction.
    fn build_block(&mut self, block: BlockId, mut j: usize) -> Result<usize> {
        self.defs.entry(block).or_default();
        let jfunc = self.jfunc;
        let mut index = 0;
        loop {
            let jinst = &jfunc.insts[j];
            if index > 0 && jinst.is_branch_target {
                let next = self.block(InstrId(j));
                self.func.terminate(block, Terminator::UnconditionalBranch { target: next });
                return Ok(j);
            }

            match &jinst.kind {
                InstrKind::Move { source, dest } => {
                    let (value, pending) = self.resolve(block, source);
                    let id = self.func.append(block, InstKind::Move { value });
                    self.note_pending(block, pending, Slot::Input { inst: id, index: 0 });
                    self.define(block, *dest, Value::Def(id));
                }

                InstrKind::BinaryOp { op, left, right, dest } => {
                    let (left, left_pending) = self.resolve(block, left);
                    let (right, right_pending) = self.resolve(block, right);
                    let id = self
                        .func
                        .append(block, InstKind::BinaryOperation { op: *op, left, right });
                    self.note_pending(block, left_pending, Slot::Input { inst: id, index: 0 });
                    self.note_pending(block, right_pending, Slot::Input { inst: id, index: 1 });
                    self.define(block, *dest, Value::Def(id));
                }

                InstrKind::Branch { op, left, right, target } => {
                    let (left, left_pending) = self.resolve(block, left);
                    let (right, right_pending) = self.resolve(block, right);
                    let cmp = self
                        .func
                        .append(block, InstKind::Comparison { op: *op, left, right });
                    self.note_pending(block, left_pending, Slot::Input { inst: cmp, index: 0 });
                    self.note_pending(block, right_pending, Slot::Input { inst: cmp, index: 1 });

                    let target = target.ok_or_else(|| anyhow!("unlinked branch target"))?;
                    let yes = self.block(target);
                    let no = self.block(InstrId(j + 1));
                    self.func
                        .terminate(block, Terminator::Branch { cond: Value::Def(cmp), yes, no });
                    return Ok(j + 1);
                }

                InstrKind::UnconditionalBranch { target } => {
                    let target = target.ok_or_else(|| anyhow!("unlinked branch target"))?;
                    let dest = self.block(target);
                    self.func
                        .terminate(block, Terminator::UnconditionalBranch { target: dest });
                    return Ok(j + 1);
                }

                InstrKind::Return { value } => {
                    let (value, pending) = self.resolve(block, value);
                    self.func.terminate(block, Terminator::Return { value });
                    self.note_pending(block, pending, Slot::Term { block });
                    return Ok(j + 1);
                }

                InstrKind::ReturnVoid => {
                    self.func.terminate(block, Terminator::ReturnVoid);
                    return Ok(j + 1);
                }

                InstrKind::FunctionCall { callee, args, dest } => {
                    let mut values = Vec::with_capacity(args.len());
                    let mut pendings = Vec::with_capacity(args.len());
                    for arg in args {
                        let (value, pending) = self.resolve(block, arg);
                        values.push(value);
                        pendings.push(pending);
                    }
                    let nreturn = self.jprog.function(*callee).nreturn;
                    let id = self.func.append(
                        block,
                        InstKind::FunctionCall { callee: *callee, nreturn, args: values },
                    );
                    for (index, pending) in pendings.into_iter().enumerate() {
                        self.note_pending(block, pending, Slot::Input { inst: id, index });
                    }
                    if let Some(dest) = dest {
                        self.define(block, *dest, Value::Def(id));
                    }
                }

                InstrKind::StandardCall { kind, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    let mut pendings = Vec::with_capacity(args.len());
                    for arg in args {
                        let (value, pending) = self.resolve(block, arg);
                        values.push(value);
                        pendings.push(pending);
                    }
                    let id = self
                        .func
                        .append(block, InstKind::StandardCall { kind: *kind, args: values });
                    for (index, pending) in pendings.into_iter().enumerate() {
                        self.note_pending(block, pending, Slot::Input { inst: id, index });
                    }
                }
            }

            j += 1;
            index += 1;
        }
    }

    /// Bind a linear operand. Returns the value (or `Empty`) and, when the
    /// variable has no in-block definition yet, the variable to resolve at
    /// block entry.
    fn resolve(&mut self, block: BlockId, value: &jir::Value) -> (Value, Option<Variable>) {
        match value {
            jir::Value::Constant(c) => (Value::Constant(*c), None),
            jir::Value::Var(var) => match self.defs.get(&block).and_then(|map| map.get(var)) {
                Some(value) => (*value, None),
                None => (Value::Empty, Some(*var)),
            },
        }
    }

    fn note_pending(&mut self, block: BlockId, pending: Option<Variable>, slot: Slot) {
        if let Some(var) = pending {
            self.unlinked
                .entry(block)
                .or_default()
                .push(UnlinkedValue { var, slot });
        }
    }

    fn define(&mut self, block: BlockId, var: Variable, value: Value) {
        self.defs.entry(block).or_default().insert(var, value);
    }

    fn block(&mut self, j: InstrId) -> BlockId {
        if let Some(&block) = self.block_map.get(&j) {
            return block;
        }
        let block = self.func.add_block();
        self.block_map.insert(j, block);
        block
    }
}
