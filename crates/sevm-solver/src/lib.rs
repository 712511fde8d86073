// SPDX-License-Identifier: AGPL-3.0

//! A per-state SMT solver context.
//!
//! Forking a path in the teacher's `cbse-sevm::Path` shares one `Rc<Solver>`
//! across every resulting state and tracks a manual `num_scopes` counter to
//! emulate independent scopes over that single solver. That breaks down the
//! moment two sibling states need to diverge and be queried concurrently (or
//! be dropped independently) rather than strictly nested push/pop.
//!
//! `ScopedSolver` instead keeps an append-only assertion log per state.
//! Cloning a state clones the log (cheap: `Bool`/`BV` terms are themselves
//! refcounted Z3 handles) but never the underlying `z3::Solver` — each clone
//! lazily builds and populates its own `Solver` the first time it's queried.
//! Two sibling states can then be checked, have transient probes pushed and
//! popped, or be dropped, with zero interaction with each other.

use std::cell::RefCell;
use z3::ast::{Ast, Bool};
use z3::{Context, Model, SatResult, Solver};

/// An independent, lazily-materialized solver context carrying an
/// append-only log of permanent assertions.
pub struct ScopedSolver<'ctx> {
    ctx: &'ctx Context,
    assertions: Vec<Bool<'ctx>>,
    inner: RefCell<Option<Solver<'ctx>>>,
}

impl<'ctx> Clone for ScopedSolver<'ctx> {
    fn clone(&self) -> Self {
        // Intentionally does not clone `inner`: the new state gets its own
        // solver, built on first use, so forked paths never share scopes.
        Self {
            ctx: self.ctx,
            assertions: self.assertions.clone(),
            inner: RefCell::new(None),
        }
    }
}

impl<'ctx> ScopedSolver<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Self {
            ctx,
            assertions: Vec::new(),
            inner: RefCell::new(None),
        }
    }

    fn ensure_materialized(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.is_none() {
            let solver = Solver::new(self.ctx);
            for cond in &self.assertions {
                solver.assert(cond);
            }
            *inner = Some(solver);
        }
    }

    /// Permanently add a constraint to this state's path condition. Appends
    /// to the log and invalidates the materialized solver so the next query
    /// rebuilds it from scratch, replaying every assertion in order.
    pub fn add(&mut self, cond: Bool<'ctx>) {
        self.assertions.push(cond);
        *self.inner.borrow_mut() = None;
    }

    /// Number of permanent assertions accumulated so far.
    pub fn len(&self) -> usize {
        self.assertions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }

    pub fn assertions(&self) -> &[Bool<'ctx>] {
        &self.assertions
    }

    /// Open a transient scope on the materialized solver. Anything asserted
    /// after `push` and before the matching `pop` does not become part of
    /// the permanent log — use [`add`](Self::add) for that.
    pub fn push(&self) {
        self.ensure_materialized();
        self.inner.borrow().as_ref().unwrap().push();
    }

    pub fn pop(&self, n: u32) {
        self.ensure_materialized();
        self.inner.borrow().as_ref().unwrap().pop(n);
    }

    /// Assert a constraint into the current (transient) scope.
    pub fn assert(&self, cond: &Bool<'ctx>) {
        self.ensure_materialized();
        self.inner.borrow().as_ref().unwrap().assert(cond);
    }

    /// Check satisfiability of the permanent log plus any open transient
    /// scopes.
    pub fn check(&self) -> SatResult {
        self.ensure_materialized();
        self.inner.borrow().as_ref().unwrap().check()
    }

    /// Check whether `cond` is satisfiable together with everything already
    /// asserted, without permanently recording it (push/assert/check/pop).
    pub fn probe(&self, cond: &Bool<'ctx>) -> SatResult {
        self.push();
        self.assert(cond);
        let result = self.check();
        self.pop(1);
        result
    }

    /// Whether `cond` necessarily holds given the current path condition
    /// (i.e. its negation is unsatisfiable).
    pub fn is_true(&self, cond: &Bool<'ctx>) -> bool {
        self.probe(&cond.not()) == SatResult::Unsat
    }

    /// Whether `cond` necessarily fails given the current path condition.
    pub fn is_false(&self, cond: &Bool<'ctx>) -> bool {
        self.probe(cond) == SatResult::Unsat
    }

    /// A satisfying model for the current path condition, if one exists.
    pub fn model(&self) -> Option<Model<'ctx>> {
        self.ensure_materialized();
        let inner = self.inner.borrow();
        let solver = inner.as_ref().unwrap();
        if solver.check() == SatResult::Sat {
            solver.get_model()
        } else {
            None
        }
    }

    /// Evaluate `term` against a satisfying model of the current path
    /// condition.
    pub fn eval<T: Ast<'ctx>>(&self, term: &T, model_completion: bool) -> Option<T> {
        self.model().and_then(|m| m.eval(term, model_completion))
    }

    /// Render the permanent assertion log as an SMT-LIB2 query.
    pub fn to_smt2(&self) -> String {
        self.ensure_materialized();
        self.inner.borrow().as_ref().unwrap().to_string()
    }

    /// Whether the permanent log is currently satisfiable.
    pub fn is_sat(&self) -> bool {
        self.check() == SatResult::Sat
    }

    /// Release the materialized `z3::Solver`, keeping the assertion log
    /// around for post-mortem inspection (`to_smt2`, `assertions`). Called
    /// when a state is moved to a terminal stash it will never be stepped
    /// or queried from again.
    pub fn dispose_context(&self) {
        *self.inner.borrow_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::ast::BV;
    use z3::Config;

    #[test]
    fn fresh_solver_is_trivially_sat() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let solver = ScopedSolver::new(&ctx);
        assert_eq!(solver.check(), SatResult::Sat);
    }

    #[test]
    fn add_is_permanent_probe_is_not() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut solver = ScopedSolver::new(&ctx);

        let x = BV::new_const(&ctx, "x", 256);
        let five = BV::from_u64(&ctx, 5, 256);
        let ten = BV::from_u64(&ctx, 10, 256);

        assert_eq!(solver.probe(&x._eq(&ten)), SatResult::Sat);

        solver.add(x._eq(&five));
        assert_eq!(solver.check(), SatResult::Sat);

        // x == 5 is now permanent, so x == 10 must be infeasible.
        assert_eq!(solver.probe(&x._eq(&ten)), SatResult::Unsat);
        // but the probe must not have left any lasting scope behind
        assert_eq!(solver.check(), SatResult::Sat);
    }

    #[test]
    fn clones_are_independent_solver_contexts() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut base = ScopedSolver::new(&ctx);

        let x = BV::new_const(&ctx, "x", 256);
        let five = BV::from_u64(&ctx, 5, 256);
        base.add(x._eq(&five));

        let mut left = base.clone();
        let mut right = base.clone();

        let ten = BV::from_u64(&ctx, 10, 256);
        let fifteen = BV::from_u64(&ctx, 15, 256);

        // Diverging each clone must not affect the other or the original.
        left.add(x._eq(&ten)); // now contradicts x == 5
        right.add(x._eq(&five)); // consistent, redundant

        assert_eq!(left.check(), SatResult::Unsat);
        assert_eq!(right.check(), SatResult::Sat);
        assert_eq!(base.check(), SatResult::Sat);
    }

    #[test]
    fn is_true_and_is_false_reflect_entailment() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut solver = ScopedSolver::new(&ctx);

        let x = BV::new_const(&ctx, "x", 256);
        let five = BV::from_u64(&ctx, 5, 256);
        solver.add(x._eq(&five));

        let cond_true = x._eq(&five);
        let cond_false = x._eq(&BV::from_u64(&ctx, 6, 256));

        assert!(solver.is_true(&cond_true));
        assert!(solver.is_false(&cond_false));
    }
}
