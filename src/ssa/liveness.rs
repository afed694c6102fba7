//! Liveness analysis and interference for register allocation.
//!
//! Live sets are computed by a backward fixpoint over blocks. A φ's
//! operands are not live at the φ itself; instead each incoming value is
//! live out of the edge's predecessor, which `block_live_start` accounts
//! for per-edge.

use super::{BlockId, Function, InstId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A program point: an instruction or a block's terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Point {
    Inst(InstId),
    Term(BlockId),
}

type InstSet = BTreeSet<InstId>;

/// Liveness results for one function.
#[derive(Debug, Default)]
pub struct Liveness {
    /// def -> every point where the def is live.
    pub life_map: BTreeMap<InstId, BTreeSet<Point>>,
    /// point -> every def live at that point.
    pub live_vars: BTreeMap<Point, InstSet>,
}

/// Compute liveness for `func`.
pub fn compute(func: &Function) -> Liveness {
    Builder {
        func,
        live_in: HashMap::new(),
        result: Liveness::default(),
    }
    .run()
}

struct Builder<'a> {
    func: &'a Function,
    live_in: HashMap<BlockId, InstSet>,
    result: Liveness,
}

impl Builder<'_> {
    fn run(mut self) -> Liveness {
        if self.func.num_blocks() == 0 {
            return self.result;
        }
        while self.calculate_once() {}
        self.result
    }

    fn calculate_once(&mut self) -> bool {
        let mut changed = false;
        for block in self.func.block_ids().collect::<Vec<_>>().into_iter().rev() {
            changed |= self.calculate(block);
        }
        changed
    }

    fn calculate(&mut self, block: BlockId) -> bool {
        let mut live = self.block_live_end(block);
        for &inst in &live {
            self.record(inst, Point::Term(block));
        }

        for &id in self.func.block(block).code().iter().rev() {
            if self.func.inst(id).produces_value() {
                live.remove(&id);
            }
            for input in self.inputs(id) {
                live.insert(input);
            }
            for &inst in &live {
                self.record(inst, Point::Inst(id));
            }
        }

        let prev = self.live_in.entry(block).or_default();
        if live == *prev {
            false
        } else {
            *prev = live;
            true
        }
    }

    /// Values live at the end of `block`: the terminator's inputs plus
    /// whatever each successor needs on entry from this block.
    fn block_live_end(&self, block: BlockId) -> InstSet {
        let mut live = InstSet::new();
        if let Some(term) = self.func.block(block).terminator() {
            for value in term.inputs() {
                if let Some(def) = value.def() {
                    live.insert(def);
                }
            }
            for succ in term.successors() {
                live.extend(self.block_live_start(succ, block));
            }
        }
        live
    }

    /// Values live on entry to `block` along the edge from `pred`: the
    /// block's live-in set plus the φ values flowing over that edge.
    fn block_live_start(&self, block: BlockId, pred: BlockId) -> InstSet {
        let mut live = self.live_in.get(&block).cloned().unwrap_or_default();
        for (_, value) in self.func.phis_for_pred(block, pred) {
            if let Some(def) = value.def() {
                live.insert(def);
            }
        }
        live
    }

    /// The defs an instruction reads. φ operands are excluded; they are
    /// handled per-edge by `block_live_start`.
    fn inputs(&self, id: InstId) -> InstSet {
        let kind = self.func.inst(id);
        if kind.is_phi() {
            return InstSet::new();
        }
        kind.inputs()
            .into_iter()
            .filter_map(|value| value.def())
            .collect()
    }

    fn record(&mut self, inst: InstId, point: Point) {
        self.result.life_map.entry(inst).or_default().insert(point);
        self.result.live_vars.entry(point).or_default().insert(inst);
    }
}

/// Undirected interference graph over SSA defs: two defs interfere when
/// their live-point sets intersect.
#[derive(Debug, Default)]
pub struct InterferenceGraph {
    map: BTreeMap<InstId, InstSet>,
}

impl InterferenceGraph {
    pub fn build(life_map: &BTreeMap<InstId, BTreeSet<Point>>) -> Self {
        let mut graph = Self::default();
        let entries: Vec<(&InstId, &BTreeSet<Point>)> = life_map.iter().collect();
        for (i, (&inst1, points1)) in entries.iter().enumerate() {
            graph.map.entry(inst1).or_default();
            for (&inst2, points2) in &entries[i + 1..] {
                if points1.intersection(points2).next().is_some() {
                    graph.add(inst1, inst2);
                }
            }
        }
        graph
    }

    pub fn add(&mut self, a: InstId, b: InstId) {
        self.map.entry(a).or_default().insert(b);
        self.map.entry(b).or_default().insert(a);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstId, &InstSet)> {
        self.map.iter().map(|(&inst, set)| (inst, set))
    }

    pub fn neighbors(&self, inst: InstId) -> Option<&InstSet> {
        self.map.get(&inst)
    }

    /// Detach `inst`, returning its neighbor set at removal time.
    pub fn remove(&mut self, inst: InstId) -> InstSet {
        let neighbors = self.map.remove(&inst).unwrap_or_default();
        for set in self.map.values_mut() {
            set.remove(&inst);
        }
        neighbors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jir::ArithOp;
    use crate::ssa::{InstKind, Terminator, Value};

    #[test]
    fn test_straight_line_liveness() {
        let mut func = Function::new("test", 0, 1);
        let entry = func.add_block();
        let a = func.append(entry, InstKind::Move { value: Value::Constant(10) });
        let b = func.append(entry, InstKind::Move { value: Value::Constant(20) });
        let sum = func.append(
            entry,
            InstKind::BinaryOperation {
                op: ArithOp::Add,
                left: Value::Def(a),
                right: Value::Def(b),
            },
        );
        func.terminate(entry, Terminator::Return { value: Value::Def(sum) });

        let liveness = compute(&func);

        // a is live at b and at the add; not at the terminator.
        let a_points = &liveness.life_map[&a];
        assert!(a_points.contains(&Point::Inst(b)));
        assert!(a_points.contains(&Point::Inst(sum)));
        assert!(!a_points.contains(&Point::Term(entry)));

        // sum is live only at the terminator.
        let sum_points = &liveness.life_map[&sum];
        assert_eq!(sum_points, &BTreeSet::from([Point::Term(entry)]));
    }

    #[test]
    fn test_interference_from_overlap() {
        let mut func = Function::new("test", 0, 1);
        let entry = func.add_block();
        let a = func.append(entry, InstKind::Move { value: Value::Constant(1) });
        let b = func.append(entry, InstKind::Move { value: Value::Constant(2) });
        let sum = func.append(
            entry,
            InstKind::BinaryOperation {
                op: ArithOp::Add,
                left: Value::Def(a),
                right: Value::Def(b),
            },
        );
        func.terminate(entry, Terminator::Return { value: Value::Def(sum) });

        let liveness = compute(&func);
        let graph = InterferenceGraph::build(&liveness.life_map);

        // a and b are simultaneously live at the add.
        assert!(graph.neighbors(a).unwrap().contains(&b));
        assert!(graph.neighbors(b).unwrap().contains(&a));
        // sum only becomes live after both die.
        assert!(!graph.neighbors(sum).unwrap().contains(&a));
    }

    #[test]
    fn test_phi_value_live_out_of_pred_edge() {
        use crate::ssa::PhiPair;

        let mut func = Function::new("test", 0, 1);
        let entry = func.add_block();
        let left = func.add_block();
        let right = func.add_block();
        let join = func.add_block();

        let cond = func.append(
            entry,
            InstKind::Comparison {
                op: crate::jir::CmpOp::Ne,
                left: Value::Constant(0),
                right: Value::Constant(1),
            },
        );
        func.terminate(
            entry,
            Terminator::Branch { cond: Value::Def(cond), yes: left, no: right },
        );
        let x = func.append(left, InstKind::Move { value: Value::Constant(1) });
        func.terminate(left, Terminator::UnconditionalBranch { target: join });
        let y = func.append(right, InstKind::Move { value: Value::Constant(2) });
        func.terminate(right, Terminator::UnconditionalBranch { target: join });
        let phi = func.prepend(
            join,
            InstKind::Phi(vec![
                PhiPair { block: left, value: Value::Def(x) },
                PhiPair { block: right, value: Value::Def(y) },
            ]),
        );
        func.terminate(join, Terminator::Return { value: Value::Def(phi) });

        let liveness = compute(&func);

        // x is live at the end of its own block only; never inside `right`.
        let x_points = &liveness.life_map[&x];
        assert!(x_points.contains(&Point::Term(left)));
        assert!(!x_points.contains(&Point::Inst(y)));
        assert!(!x_points.contains(&Point::Term(right)));

        // x and y never interfere even though both feed the same φ.
        let graph = InterferenceGraph::build(&liveness.life_map);
        assert!(!graph.neighbors(x).unwrap().contains(&y));
    }

    #[test]
    fn test_remove_detaches_node() {
        let mut graph = InterferenceGraph::default();
        let a = InstId(0);
        let b = InstId(1);
        let c = InstId(2);
        graph.add(a, b);
        graph.add(b, c);

        let neighbors = graph.remove(b);
        assert_eq!(neighbors, BTreeSet::from([a, c]));
        assert!(graph.neighbors(a).unwrap().is_empty());
        assert!(graph.neighbors(c).unwrap().is_empty());
    }
}
