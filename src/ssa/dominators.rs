//! Dominator sets, dominance frontiers, and φ placement.

use super::{BlockId, Function, InstId, InstKind, PhiPair, Value};
use crate::jir::Variable;
use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Per-block variable definitions accumulated during SSA construction.
pub(crate) type DefMap = HashMap<BlockId, BTreeMap<Variable, Value>>;

/// Per-block value of each variable at block entry.
pub(crate) type LinkMap = HashMap<BlockId, BTreeMap<Variable, Value>>;

/// Dominator sets computed by iterative forward dataflow:
/// `dom(n) = {n} ∪ ⋂ dom(p)` over predecessors `p`, with
/// `dom(entry) = {entry}`.
pub struct Dominators {
    doms: HashMap<BlockId, BTreeSet<BlockId>>,
    frontiers: HashMap<BlockId, BTreeSet<BlockId>>,
}

impl Dominators {
    pub fn compute(func: &Function) -> Self {
        let blocks: Vec<BlockId> = func.block_ids().collect();
        let mut doms: HashMap<BlockId, BTreeSet<BlockId>> = HashMap::new();

        if let Some(&entry) = blocks.first() {
            doms.insert(entry, BTreeSet::from([entry]));
            let all: BTreeSet<BlockId> = blocks.iter().copied().collect();
            for &block in &blocks[1..] {
                doms.insert(block, all.clone());
            }

            let mut changed = true;
            while changed {
                changed = false;
                for &block in &blocks[1..] {
                    let mut next: Option<BTreeSet<BlockId>> = None;
                    for &pred in func.block(block).predecessors() {
                        let pred_doms = &doms[&pred];
                        next = Some(match next {
                            None => pred_doms.clone(),
                            Some(acc) => acc.intersection(pred_doms).copied().collect(),
                        });
                    }
                    let mut next = next.unwrap_or_default();
                    next.insert(block);
                    if next != doms[&block] {
                        doms.insert(block, next);
                        changed = true;
                    }
                }
            }
        }

        let mut result = Self { doms, frontiers: HashMap::new() };
        let frontiers: HashMap<BlockId, BTreeSet<BlockId>> = blocks
            .iter()
            .map(|&block| (block, result.compute_frontier(func, block)))
            .collect();
        result.frontiers = frontiers;
        result
    }

    pub fn dominates(&self, dom: BlockId, other: BlockId) -> bool {
        self.doms.get(&other).is_some_and(|set| set.contains(&dom))
    }

    pub fn strictly_dominates(&self, dom: BlockId, other: BlockId) -> bool {
        dom != other && self.dominates(dom, other)
    }

    /// The dominance frontier of `block`.
    pub fn frontiers(&self, block: BlockId) -> &BTreeSet<BlockId> {
        static EMPTY: BTreeSet<BlockId> = BTreeSet::new();
        self.frontiers.get(&block).unwrap_or(&EMPTY)
    }

    fn compute_frontier(&self, func: &Function, block: BlockId) -> BTreeSet<BlockId> {
        func.block_ids()
            .filter(|&front| self.in_frontier(func, block, front))
            .collect()
    }

    fn in_frontier(&self, func: &Function, block: BlockId, front: BlockId) -> bool {
        if self.strictly_dominates(block, front) {
            return false;
        }
        func.block(front)
            .predecessors()
            .iter()
            .any(|&pred| self.dominates(block, pred))
    }
}

/// Inserts φs at dominance frontiers, removes the spurious ones, and
/// records each variable's value at every block entry (the links table).
pub(crate) struct PhiFixer<'a> {
    func: &'a mut Function,
    defs: &'a mut DefMap,
    doms: Dominators,
    links: LinkMap,
}

impl<'a> PhiFixer<'a> {
    pub fn new(func: &'a mut Function, defs: &'a mut DefMap) -> Self {
        let doms = Dominators::compute(func);
        Self { func, defs, doms, links: LinkMap::new() }
    }

    pub fn fix(mut self) -> Result<LinkMap> {
        let vars: BTreeSet<Variable> = self
            .defs
            .values()
            .flat_map(|map| map.keys().copied())
            .collect();
        for var in vars {
            self.fix_var(var)?;
        }
        Ok(self.links)
    }

    fn fix_var(&mut self, var: Variable) -> Result<()> {
        let mut work: BTreeSet<BlockId> = self
            .func
            .block_ids()
            .filter(|block| {
                self.defs
                    .get(block)
                    .is_some_and(|map| map.contains_key(&var))
            })
            .collect();
        let mut done = work.clone();
        let mut has_phi: BTreeSet<BlockId> = BTreeSet::new();
        let mut phis: Vec<InstId> = Vec::new();
        let mut referenced: BTreeSet<InstId> = BTreeSet::new();

        // Place a φ in every frontier block reachable from a definition.
        while let Some(&block) = work.iter().next() {
            work.remove(&block);
            for &front in self.doms.frontiers(block) {
                if has_phi.contains(&front) {
                    continue;
                }
                let phi = self.func.prepend(front, InstKind::Phi(Vec::new()));
                phis.push(phi);
                has_phi.insert(front);

                let front_defs = self.defs.entry(front).or_default();
                if !front_defs.contains_key(&var) {
                    front_defs.insert(var, Value::Def(phi));
                    referenced.insert(phi);
                }

                if done.insert(front) {
                    work.insert(front);
                }
            }
        }

        // Blocks without a φ inherit the entry value from the first
        // predecessor that has a definition.
        for block in self.func.block_ids().collect::<Vec<_>>() {
            if has_phi.contains(&block) {
                continue;
            }
            let preds: Vec<BlockId> = self
                .func
                .block(block)
                .predecessors()
                .iter()
                .copied()
                .filter(|&pred| pred != block)
                .collect();
            for pred in preds {
                let Some(def) = self.defs.get(&pred).and_then(|map| map.get(&var)).copied()
                else {
                    continue;
                };
                if let Some(inst) = def.def() {
                    referenced.insert(inst);
                }
                self.links.entry(block).or_default().entry(var).or_insert(def);
                self.defs.entry(block).or_default().entry(var).or_insert(def);
                break;
            }
        }

        // Fill each φ from its predecessors' definitions; a φ with a
        // def-less predecessor is spurious and gets erased, provided
        // nothing picked it up already.
        for phi in phis {
            let block = self.func.inst_block(phi);
            let preds: Vec<BlockId> = self
                .func
                .block(block)
                .predecessors()
                .iter()
                .copied()
                .collect();

            let mut pairs = Vec::with_capacity(preds.len());
            let mut removed = false;
            for pred in preds {
                match self.defs.get(&pred).and_then(|map| map.get(&var)).copied() {
                    Some(value) => pairs.push(PhiPair { block: pred, value }),
                    None => {
                        if referenced.contains(&phi) {
                            bail!("unnecessary phi has uses");
                        }
                        self.func.erase(phi);
                        if self.defs.get(&block).and_then(|map| map.get(&var))
                            == Some(&Value::Def(phi))
                        {
                            self.defs.entry(block).or_default().remove(&var);
                        }
                        removed = true;
                        break;
                    }
                }
            }
            if !removed {
                if let InstKind::Phi(slots) = self.func.inst_mut(phi) {
                    *slots = pairs;
                }
                self.links
                    .entry(block)
                    .or_default()
                    .entry(var)
                    .or_insert(Value::Def(phi));
            }
        }
        Ok(())
    }
}
