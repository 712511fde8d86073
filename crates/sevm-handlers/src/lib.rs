// SPDX-License-Identifier: AGPL-3.0

//! Per-opcode step functions.
//!
//! Grounded on `greed/SEtaac/TAC_ops/flow_ops.py`'s `TAC_Jump`/`TAC_Jumpi`
//! (the branch-forking algorithm this engine generalizes) and, for the
//! push/pop feasibility-probing shape, `cbse-sevm::opcodes::handle_jumpi`.
//! Destinations are resolved through
//! [`sevm_state::SymState::get_non_fallthrough_pc`] rather than read as a
//! raw stack value, and probing goes through [`sevm_solver::ScopedSolver`]
//! instead of a shared `Rc<Solver>` with a manual scope counter.
//!
//! Every handler here takes the state it's stepping by value but never
//! mutates it directly: a fresh clone (`succ`, or `succ_true`/`succ_false`
//! when forking) carries the mutation, and the original is only consumed
//! once a handler is certain it will succeed. On failure the original,
//! untouched state comes back out through [`HandleResult`]'s `Err` side so
//! the caller (the simulation manager) can attach the error to it and still
//! emit it as its own successor, per spec §7's propagation policy.

use sevm_bitvec::{SymBitVec, SymBool};
use sevm_exceptions::{ExecError, ExecResult};
use sevm_project::{Statement, StatementKind};
use sevm_state::SymState;
use z3::SatResult;

/// `Ok` carries the statement's successors; `Err` carries back the
/// original, unmutated state alongside the failure so it can still be
/// re-binned (as `errored`) rather than lost.
pub type HandleResult<'ctx> = Result<Vec<SymState<'ctx>>, (SymState<'ctx>, ExecError)>;

/// Step a single state through `statement`, returning its successors.
///
/// This is the engine's side of spec §6's uniform `handle(state) ->
/// list<state>` statement interface: control-flow opcodes fork or redirect
/// `pc`; everything else is out of scope as a modeled handler (spec §1) and
/// falls through to [`handle_fallthrough`], which only advances `pc`.
pub fn handle<'ctx>(state: SymState<'ctx>, statement: &Statement) -> HandleResult<'ctx> {
    match &statement.kind {
        StatementKind::Jump => handle_jump(state, statement),
        StatementKind::Jumpi => handle_jumpi(state, statement),
        StatementKind::Other(name) => match name.as_str() {
            "STOP" | "RETURN" | "REVERT" | "INVALID" | "SELFDESTRUCT" => handle_halt(state, name),
            "ADD" | "SUB" | "MUL" => handle_binop(state, statement, name),
            _ => {
                sevm_logs::warn_code(
                    sevm_logs::DiagnosticCode::UnsupportedOpcode,
                    &format!("opcode {name} is not modeled, advancing pc only"),
                );
                handle_fallthrough(state)
            }
        },
    }
}

/// Opcodes outside the control-flow core (spec §1: "treated as a uniform
/// `handle(state) -> [state]` interface"). This engine does not model their
/// arithmetic/memory/storage/hashing semantics; the stub only advances
/// `pc`, which is enough to drive a state across a block of non-branching
/// statements for CFG-navigation and simulation-manager testing. Cannot
/// fail, so it mutates in place rather than cloning.
pub fn handle_fallthrough<'ctx>(mut state: SymState<'ctx>) -> HandleResult<'ctx> {
    state.set_next_pc();
    Ok(vec![state])
}

/// Illustrative halting opcodes: no successor, the state is simply marked
/// halted (and reverted for `REVERT`/`INVALID`) so the manager re-bins it to
/// `deadended` on the next step. Grounded on `cbse-sevm::opcodes`'s
/// `OP_STOP` arm, adapted from a stack-machine `return true` to this
/// engine's TAC register state.
fn handle_halt<'ctx>(mut state: SymState<'ctx>, name: &str) -> HandleResult<'ctx> {
    state.halt = true;
    state.revert = matches!(name, "REVERT" | "INVALID");
    Ok(vec![state])
}

/// Illustrative arithmetic opcodes over TAC registers: `defs[0] = uses[0] op
/// uses[1]`. Grounded on `cbse-sevm::opcodes`'s `OP_ADD`/`OP_SUB`/`OP_MUL`
/// arms, adapted from stack pop/push to register read/write.
fn handle_binop<'ctx>(state: SymState<'ctx>, statement: &Statement, name: &str) -> HandleResult<'ctx> {
    let Some(lhs_reg) = statement.uses.first() else {
        return Err((state, ExecError::VMException(format!("{name} has no left operand"))));
    };
    let Some(rhs_reg) = statement.uses.get(1) else {
        return Err((state, ExecError::VMException(format!("{name} has no right operand"))));
    };
    let Some(dest_reg) = statement.defs.first() else {
        return Err((state, ExecError::VMException(format!("{name} has no destination register"))));
    };

    let lhs = match register(&state, lhs_reg) {
        Ok(v) => v,
        Err(e) => return Err((state, e)),
    };
    let rhs = match register(&state, rhs_reg) {
        Ok(v) => v,
        Err(e) => return Err((state, e)),
    };

    let ctx = state.z3ctx();
    let result = match name {
        "ADD" => lhs.add(&rhs, ctx),
        "SUB" => lhs.sub(&rhs, ctx),
        "MUL" => lhs.mul(&rhs, ctx),
        _ => unreachable!("handle_binop only dispatched for ADD/SUB/MUL"),
    };

    let mut succ = state.copy();
    succ.registers.insert(dest_reg.clone(), result);
    succ.set_next_pc();
    Ok(vec![succ])
}

fn register<'ctx>(state: &SymState<'ctx>, name: &str) -> ExecResult<SymBitVec<'ctx>> {
    state
        .registers
        .get(name)
        .cloned()
        .ok_or_else(|| ExecError::VMException(format!("register {name} is not set")))
}

/// Spec §4.3: unconditional jump. Exactly one successor; fails if the
/// destination isn't concrete.
pub fn handle_jump<'ctx>(state: SymState<'ctx>, statement: &Statement) -> HandleResult<'ctx> {
    let Some(dest_reg) = statement.uses.first() else {
        return Err((state, ExecError::VMException("JUMP has no destination operand".to_string())));
    };
    let dest = match register(&state, dest_reg) {
        Ok(v) => v,
        Err(e) => return Err((state, e)),
    };
    let next_pc = match state.get_non_fallthrough_pc(&dest) {
        Ok(pc) => pc,
        Err(e) => return Err((state, e)),
    };
    let mut succ = state.copy();
    succ.pc = Some(next_pc);
    Ok(vec![succ])
}

/// Spec §4.4: the conditional branch, the only handler that forks. Operand
/// order is `[cond, dest]` per the statement's `uses`.
pub fn handle_jumpi<'ctx>(state: SymState<'ctx>, statement: &Statement) -> HandleResult<'ctx> {
    let Some(cond_reg) = statement.uses.first() else {
        return Err((state, ExecError::VMException("JUMPI has no condition operand".to_string())));
    };
    let Some(dest_reg) = statement.uses.get(1) else {
        return Err((state, ExecError::VMException("JUMPI has no destination operand".to_string())));
    };

    let dest = match register(&state, dest_reg) {
        Ok(v) => v,
        Err(e) => return Err((state, e)),
    };
    let cond = match register(&state, cond_reg) {
        Ok(v) => v,
        Err(e) => return Err((state, e)),
    };
    let cond_nonzero = cond.is_non_zero(state.z3ctx());
    let fallthrough = state.get_fallthrough_pc();

    match &cond_nonzero {
        SymBool::Concrete(true) => {
            let next_pc = match state.get_non_fallthrough_pc(&dest) {
                Ok(pc) => pc,
                Err(e) => return Err((state, e)),
            };
            let mut succ = state.copy();
            succ.pc = Some(next_pc);
            Ok(vec![succ])
        }
        SymBool::Concrete(false) => {
            let fallthrough_pc = match fallthrough {
                Ok(pc) => pc,
                Err(e) => return Err((state, e)),
            };
            let mut succ = state.copy();
            succ.pc = Some(fallthrough_pc);
            Ok(vec![succ])
        }
        SymBool::Symbolic(_) => fork_symbolic(state, &cond_nonzero, &dest, fallthrough),
    }
}

/// The symbolic half of the branch handler: probe both directions in
/// push/pop scopes over the (still owned, unmutated) input state's path
/// condition, then fork, take, or prune depending on which directions come
/// back feasible. Probing never mutates `state`, so cloning is deferred
/// until a successor is actually about to be produced.
fn fork_symbolic<'ctx>(
    state: SymState<'ctx>,
    cond_nonzero: &SymBool<'ctx>,
    dest: &SymBitVec<'ctx>,
    fallthrough: ExecResult<String>,
) -> HandleResult<'ctx> {
    let ctx = state.z3ctx();
    let true_cond = cond_nonzero.as_z3(ctx);
    let false_cond = cond_nonzero.not(ctx).as_z3(ctx);

    // SatResult::Unknown is treated as feasible (spec §5: "treat unknown the
    // same as sat for safety; do not silently drop the branch").
    let potential_true = state.solver.probe(&true_cond) != SatResult::Unsat;
    let potential_false = state.solver.probe(&false_cond) != SatResult::Unsat;

    match (potential_true, potential_false) {
        (false, false) => Ok(Vec::new()),
        (true, false) => {
            let next_pc = match state.get_non_fallthrough_pc(dest) {
                Ok(pc) => pc,
                Err(e) => return Err((state, e)),
            };
            let mut succ = state.copy();
            succ.add_constraint(true_cond);
            succ.pc = Some(next_pc);
            Ok(vec![succ])
        }
        (false, true) => {
            let fallthrough_pc = match fallthrough {
                Ok(pc) => pc,
                Err(e) => return Err((state, e)),
            };
            let mut succ = state.copy();
            succ.add_constraint(false_cond);
            succ.pc = Some(fallthrough_pc);
            Ok(vec![succ])
        }
        (true, true) => {
            let fallthrough_pc = match fallthrough {
                Ok(pc) => pc,
                Err(e) => return Err((state, e)),
            };
            let mut succ_false = state.copy();
            let mut succ_true = succ_false.copy();

            succ_true.add_constraint(true_cond);
            // The dest-concreteness requirement applies only to the true
            // branch; if it fails, that branch alone is extinguished as an
            // errored state rather than aborting the whole fork.
            match succ_true.get_non_fallthrough_pc(dest) {
                Ok(pc) => succ_true.pc = Some(pc),
                Err(err) => {
                    succ_true.error = Some(err);
                    succ_true.halt = true;
                }
            }

            succ_false.add_constraint(false_cond);
            succ_false.pc = Some(fallthrough_pc);

            Ok(vec![succ_true, succ_false])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sevm_config::EngineOptions;
    use sevm_project::{Block, Project};
    use sevm_state::InitCtx;
    use std::rc::Rc;
    use z3::{Config, Context};

    fn stmt(id: &str, block_id: &str, kind: StatementKind, uses: Vec<&str>) -> Statement {
        Statement {
            id: id.to_string(),
            block_id: block_id.to_string(),
            kind,
            uses: uses.into_iter().map(|s| s.to_string()).collect(),
            defs: vec![],
        }
    }

    /// A -> JUMPI cond,dest -> B (taken) / C (fallthrough).
    fn branching_project() -> Project {
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![stmt("A_jumpi", "A", StatementKind::Jumpi, vec!["cond", "dest"])],
            pred: vec![],
            succ: vec!["0xB".into(), "0xC".into()],
            fallthrough_edge: Some("0xC".into()),
        });
        project.add_block(Block {
            id: "0xB".into(),
            statements: vec![stmt("0xB", "0xB", StatementKind::Other("JUMPDEST".into()), vec![])],
            pred: vec!["A".into()],
            succ: vec![],
            fallthrough_edge: None,
        });
        project.add_block(Block {
            id: "0xC".into(),
            statements: vec![stmt("0xC", "0xC", StatementKind::Other("JUMPDEST".into()), vec![])],
            pred: vec!["A".into()],
            succ: vec![],
            fallthrough_edge: None,
        });
        project
    }

    fn fresh_state<'ctx>(ctx: &'ctx Context, project: Rc<Project>, pc: &str) -> SymState<'ctx> {
        let mut state = SymState::new(0, project, ctx, &InitCtx::default(), EngineOptions::default(), None, false);
        state.pc = Some(pc.to_string());
        state
    }

    #[test]
    fn s1_concrete_branch_taken() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let project = Rc::new(branching_project());
        let mut state = fresh_state(&ctx, Rc::clone(&project), "A_jumpi");
        state.registers.insert("cond".to_string(), SymBitVec::from_u64(1, 256));
        state.registers.insert("dest".to_string(), SymBitVec::from_u64(0xB, 256));

        let stmt = project.statement("A_jumpi").unwrap().clone();
        let successors = handle(state, &stmt).unwrap();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].pc.as_deref(), Some("0xB"));
    }

    #[test]
    fn s2_concrete_branch_not_taken() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let project = Rc::new(branching_project());
        let mut state = fresh_state(&ctx, Rc::clone(&project), "A_jumpi");
        state.registers.insert("cond".to_string(), SymBitVec::from_u64(0, 256));
        state.registers.insert("dest".to_string(), SymBitVec::from_u64(0xB, 256));

        let stmt = project.statement("A_jumpi").unwrap().clone();
        let successors = handle(state, &stmt).unwrap();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].pc.as_deref(), Some("0xC"));
    }

    #[test]
    fn s3_symbolic_fork_produces_both_branches_with_matching_constraints() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let project = Rc::new(branching_project());
        let mut state = fresh_state(&ctx, Rc::clone(&project), "A_jumpi");
        state
            .registers
            .insert("cond".to_string(), SymBitVec::symbolic(&ctx, "X", 256));
        state.registers.insert("dest".to_string(), SymBitVec::from_u64(0xB, 256));

        let stmt = project.statement("A_jumpi").unwrap().clone();
        let successors = handle(state, &stmt).unwrap();
        assert_eq!(successors.len(), 2);

        let true_branch = successors.iter().find(|s| s.pc.as_deref() == Some("0xB")).unwrap();
        let false_branch = successors.iter().find(|s| s.pc.as_deref() == Some("0xC")).unwrap();

        let x = SymBitVec::symbolic(&ctx, "X", 256);
        let one = x.eq(&SymBitVec::from_u64(1, 256), &ctx).as_z3(&ctx);
        let zero = x.eq(&SymBitVec::from_u64(0, 256), &ctx).as_z3(&ctx);

        assert!(true_branch.solver.is_true(&one));
        assert!(false_branch.solver.is_true(&zero));
    }

    #[test]
    fn s4_symbolic_pruned_by_preexisting_constraint() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let project = Rc::new(branching_project());
        let mut state = fresh_state(&ctx, Rc::clone(&project), "A_jumpi");
        let x = SymBitVec::symbolic(&ctx, "X", 256);
        state.registers.insert("cond".to_string(), x.clone());
        state.registers.insert("dest".to_string(), SymBitVec::from_u64(0xB, 256));
        let nonzero = x.eq(&SymBitVec::from_u64(0, 256), &ctx).as_z3(&ctx).not();
        state.add_constraint(nonzero);

        let stmt = project.statement("A_jumpi").unwrap().clone();
        let successors = handle(state, &stmt).unwrap();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].pc.as_deref(), Some("0xB"));
    }

    #[test]
    fn s5_symbolic_jump_destination_errors_and_preserves_original_state() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![stmt("A_jump", "A", StatementKind::Jump, vec!["dest"])],
            pred: vec![],
            succ: vec!["0xB".into()],
            fallthrough_edge: None,
        });
        let project = Rc::new(project);
        let mut state = fresh_state(&ctx, Rc::clone(&project), "A_jump");
        state
            .registers
            .insert("dest".to_string(), SymBitVec::symbolic(&ctx, "Y", 256));

        let stmt = project.statement("A_jump").unwrap().clone();
        let (original, err) = handle(state, &stmt).unwrap_err();
        assert_eq!(err, ExecError::SymbolicJumpTarget);
        // the original state comes back untouched, not halted by the handler itself.
        assert!(!original.halt);
        assert_eq!(original.pc.as_deref(), Some("A_jump"));
    }

    #[test]
    fn neither_branch_feasible_extinguishes_path() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let project = Rc::new(branching_project());
        let mut state = fresh_state(&ctx, Rc::clone(&project), "A_jumpi");
        let x = SymBitVec::symbolic(&ctx, "X", 256);
        state.registers.insert("cond".to_string(), x.clone());
        state.registers.insert("dest".to_string(), SymBitVec::from_u64(0xB, 256));
        let is_zero = x.eq(&SymBitVec::from_u64(0, 256), &ctx).as_z3(&ctx);
        state.add_constraint(is_zero.clone());
        state.add_constraint(is_zero.not());

        let stmt = project.statement("A_jumpi").unwrap().clone();
        let successors = handle(state, &stmt).unwrap();
        assert!(successors.is_empty());
    }

    #[test]
    fn fallthrough_handler_advances_pc_for_non_control_flow_opcode() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![
                stmt("A_0", "A", StatementKind::Other("PUSH1".into()), vec![]),
                stmt("A_1", "A", StatementKind::Other("ADD".into()), vec![]),
            ],
            pred: vec![],
            succ: vec![],
            fallthrough_edge: None,
        });
        let project = Rc::new(project);
        let state = fresh_state(&ctx, Rc::clone(&project), "A_0");

        let stmt_obj = project.statement("A_0").unwrap().clone();
        let successors = handle(state, &stmt_obj).unwrap();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].pc.as_deref(), Some("A_1"));
    }

    #[test]
    fn stop_opcode_halts_without_reverting() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![stmt("A_0", "A", StatementKind::Other("STOP".into()), vec![])],
            pred: vec![],
            succ: vec![],
            fallthrough_edge: None,
        });
        let project = Rc::new(project);
        let state = fresh_state(&ctx, Rc::clone(&project), "A_0");

        let stmt_obj = project.statement("A_0").unwrap().clone();
        let successors = handle(state, &stmt_obj).unwrap();
        assert_eq!(successors.len(), 1);
        assert!(successors[0].halt);
        assert!(!successors[0].revert);
    }

    #[test]
    fn revert_opcode_halts_and_marks_revert() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![stmt("A_0", "A", StatementKind::Other("REVERT".into()), vec![])],
            pred: vec![],
            succ: vec![],
            fallthrough_edge: None,
        });
        let project = Rc::new(project);
        let state = fresh_state(&ctx, Rc::clone(&project), "A_0");

        let stmt_obj = project.statement("A_0").unwrap().clone();
        let successors = handle(state, &stmt_obj).unwrap();
        assert!(successors[0].halt);
        assert!(successors[0].revert);
    }

    #[test]
    fn add_opcode_writes_sum_into_destination_register_and_advances_pc() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![Statement {
                id: "A_0".into(),
                block_id: "A".into(),
                kind: StatementKind::Other("ADD".into()),
                uses: vec!["a".into(), "b".into()],
                defs: vec!["c".into()],
            }],
            pred: vec![],
            succ: vec![],
            fallthrough_edge: None,
        });
        let project = Rc::new(project);
        let mut state = fresh_state(&ctx, Rc::clone(&project), "A_0");
        state.registers.insert("a".to_string(), SymBitVec::from_u64(2, 256));
        state.registers.insert("b".to_string(), SymBitVec::from_u64(3, 256));

        let stmt_obj = project.statement("A_0").unwrap().clone();
        let successors = handle(state, &stmt_obj).unwrap();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].registers["c"].as_u64().unwrap(), 5);
    }

    #[test]
    fn binop_with_missing_operand_errors_and_preserves_original_state() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![Statement {
                id: "A_0".into(),
                block_id: "A".into(),
                kind: StatementKind::Other("ADD".into()),
                uses: vec!["a".into(), "b".into()],
                defs: vec!["c".into()],
            }],
            pred: vec![],
            succ: vec![],
            fallthrough_edge: None,
        });
        let project = Rc::new(project);
        let state = fresh_state(&ctx, Rc::clone(&project), "A_0");

        let stmt_obj = project.statement("A_0").unwrap().clone();
        let (original, err) = handle(state, &stmt_obj).unwrap_err();
        assert!(matches!(err, ExecError::VMException(_)));
        assert_eq!(original.pc.as_deref(), Some("A_0"));
    }
}
