//! SSA simplification: copy propagation and dead-code elimination.

use super::{Function, InstId, InstKind, Value};
use log::debug;
use std::collections::{HashMap, HashSet};

/// Maximum simplification rounds before giving up on a fixpoint.
const MAX_ROUNDS: usize = 20;

/// Run copy propagation and dead-code elimination to a fixpoint
/// (or the round cap).
pub fn simplify(func: &mut Function) {
    for round in 0..MAX_ROUNDS {
        let propagated = propagate_copies(func);
        let eliminated = eliminate_dead_code(func);
        if !propagated && !eliminated {
            debug!("simplified {} in {} rounds", func.name, round);
            return;
        }
    }
    debug!("simplification of {} hit the round cap", func.name);
}

/// Rewrite every use of a `Move` to the move's source value.
fn propagate_copies(func: &mut Function) -> bool {
    let mut moves: HashMap<InstId, Value> = HashMap::new();
    for block in func.block_ids().collect::<Vec<_>>() {
        for &id in func.block(block).code() {
            if let InstKind::Move { value } = func.inst(id) {
                moves.insert(id, *value);
            }
        }
    }
    if moves.is_empty() {
        return false;
    }

    let mut changed = false;
    let mut rewrite = |value: &mut Value| {
        if let Value::Def(def) = value {
            if let Some(&source) = moves.get(def) {
                if *value != source {
                    *value = source;
                    changed = true;
                }
            }
        }
    };

    for block in func.block_ids().collect::<Vec<_>>() {
        for id in func.block(block).code().to_vec() {
            for input in func.inst_mut(id).inputs_mut() {
                rewrite(input);
            }
        }
        for input in func.terminator_inputs_mut(block) {
            rewrite(input);
        }
    }
    changed
}

/// Erase instructions that produce no side effect and whose value nothing
/// references.
fn eliminate_dead_code(func: &mut Function) -> bool {
    let mut referenced: HashSet<InstId> = HashSet::new();
    for block in func.block_ids().collect::<Vec<_>>() {
        for &id in func.block(block).code() {
            for input in func.inst(id).inputs() {
                if let Some(def) = input.def() {
                    referenced.insert(def);
                }
            }
        }
        if let Some(term) = func.block(block).terminator() {
            for input in term.inputs() {
                if let Some(def) = input.def() {
                    referenced.insert(def);
                }
            }
        }
    }

    let mut dead = Vec::new();
    for block in func.block_ids().collect::<Vec<_>>() {
        for &id in func.block(block).code() {
            if !func.inst(id).has_side_effect() && !referenced.contains(&id) {
                dead.push(id);
            }
        }
    }
    for id in &dead {
        func.erase(*id);
    }
    !dead.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jir::ArithOp;
    use crate::ssa::Terminator;

    /// return (1 + 2) routed through two copies.
    fn copied_add() -> Function {
        let mut func = Function::new("test", 0, 1);
        let entry = func.add_block();
        let one = func.append(entry, InstKind::Move { value: Value::Constant(1) });
        let copy = func.append(entry, InstKind::Move { value: Value::Def(one) });
        let two = func.append(entry, InstKind::Move { value: Value::Constant(2) });
        let sum = func.append(
            entry,
            InstKind::BinaryOperation {
                op: ArithOp::Add,
                left: Value::Def(copy),
                right: Value::Def(two),
            },
        );
        func.terminate(entry, Terminator::Return { value: Value::Def(sum) });
        func
    }

    #[test]
    fn test_copy_chain_collapses() {
        let mut func = copied_add();
        simplify(&mut func);

        let entry = func.entry();
        let code = func.block(entry).code().to_vec();
        // Only the add survives; its operands became constants.
        assert_eq!(code.len(), 1);
        assert_eq!(
            func.inst(code[0]),
            &InstKind::BinaryOperation {
                op: ArithOp::Add,
                left: Value::Constant(1),
                right: Value::Constant(2),
            }
        );
    }

    #[test]
    fn test_idempotent() {
        let mut func = copied_add();
        simplify(&mut func);
        let after_first: Vec<_> = func.block(func.entry()).code().to_vec();
        simplify(&mut func);
        let after_second: Vec<_> = func.block(func.entry()).code().to_vec();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_calls_survive() {
        let mut func = Function::new("test", 0, 0);
        let entry = func.add_block();
        let value = func.append(entry, InstKind::Move { value: Value::Constant(65) });
        func.append(
            entry,
            InstKind::StandardCall {
                kind: crate::jir::StandardKind::PrintChar,
                args: vec![Value::Def(value)],
            },
        );
        func.terminate(entry, Terminator::ReturnVoid);

        simplify(&mut func);

        let code = func.block(func.entry()).code().to_vec();
        assert_eq!(code.len(), 1);
        assert!(matches!(func.inst(code[0]), InstKind::StandardCall { .. }));
        // The move was propagated into the call argument, then erased.
        if let InstKind::StandardCall { args, .. } = func.inst(code[0]) {
            assert_eq!(args[0], Value::Constant(65));
        }
    }

    #[test]
    fn test_dead_value_removed() {
        let mut func = Function::new("test", 0, 0);
        let entry = func.add_block();
        func.append(
            entry,
            InstKind::BinaryOperation {
                op: ArithOp::Mul,
                left: Value::Constant(6),
                right: Value::Constant(7),
            },
        );
        func.terminate(entry, Terminator::ReturnVoid);

        simplify(&mut func);
        assert!(func.block(func.entry()).code().is_empty());
    }
}
