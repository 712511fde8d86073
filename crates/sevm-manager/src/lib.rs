// SPDX-License-Identifier: AGPL-3.0

//! The simulation manager: owns stashes of states, drives stepping, and
//! coordinates exploration techniques.
//!
//! Grounded on `greed/sim_manager.py`'s `SimulationManager`: same six named
//! stashes, the same `step`/`single_step_state`/`run`/`move` shape and the
//! same re-binning order. Python's duck-typed dict-of-lists becomes a typed
//! [`Stashes`] struct indexed by [`StashName`]; its `_techniques` list
//! becomes `Box<dyn ExplorationTechnique>` trait objects taken out of
//! `self` via `mem::take` for the duration of each hook call, so a
//! technique can read the rest of the manager while being handed a
//! `&mut` view of itself — the same role Python's implicit `self` reference
//! plays when a technique method reaches back into `manager`.

use sevm_config::EngineOptions;
use sevm_handlers::handle;
use sevm_project::Project;
use sevm_state::SymState;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

/// A breakpoint callback, keyed by the same pc/opcode tag the `inspect`
/// plugin's `pc_breakpoints`/`opcode_breakpoints` sets use (spec §4.7).
pub type InspectCallback<'ctx> = Box<dyn Fn(&mut SimulationManager<'ctx>, &mut SymState<'ctx>)>;

/// One of the six buckets a state can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashName {
    Active,
    Deadended,
    Found,
    Pruned,
    Unsat,
    Errored,
}

/// The named stashes (spec §4.5). `states()` yields the union.
#[derive(Default)]
pub struct Stashes<'ctx> {
    pub active: Vec<SymState<'ctx>>,
    pub deadended: Vec<SymState<'ctx>>,
    pub found: Vec<SymState<'ctx>>,
    pub pruned: Vec<SymState<'ctx>>,
    pub unsat: Vec<SymState<'ctx>>,
    pub errored: Vec<SymState<'ctx>>,
}

impl<'ctx> Stashes<'ctx> {
    fn get_mut(&mut self, name: StashName) -> &mut Vec<SymState<'ctx>> {
        match name {
            StashName::Active => &mut self.active,
            StashName::Deadended => &mut self.deadended,
            StashName::Found => &mut self.found,
            StashName::Pruned => &mut self.pruned,
            StashName::Unsat => &mut self.unsat,
            StashName::Errored => &mut self.errored,
        }
    }

    pub fn states(&self) -> impl Iterator<Item = &SymState<'ctx>> {
        self.active
            .iter()
            .chain(self.deadended.iter())
            .chain(self.found.iter())
            .chain(self.pruned.iter())
            .chain(self.unsat.iter())
            .chain(self.errored.iter())
    }
}

/// A pluggable exploration strategy (spec §4.6). Default hooks are
/// pass-through, so a technique only overrides the ones it needs — the
/// same effect as Python's duck-typed techniques only defining the methods
/// they care about.
pub trait ExplorationTechnique<'ctx> {
    fn setup(&mut self, _manager: &SimulationManager<'ctx>) {}

    fn check_stashes(&mut self, _manager: &SimulationManager<'ctx>, stashes: Stashes<'ctx>) -> Stashes<'ctx> {
        stashes
    }

    fn check_state(&mut self, _manager: &SimulationManager<'ctx>, state: SymState<'ctx>) -> SymState<'ctx> {
        state
    }

    fn check_successors(
        &mut self,
        _manager: &SimulationManager<'ctx>,
        successors: Vec<SymState<'ctx>>,
    ) -> Vec<SymState<'ctx>> {
        successors
    }

    fn is_complete(&self, _manager: &SimulationManager<'ctx>) -> bool {
        true
    }
}

/// Owns every state in flight and drives stepping (spec §4.5).
pub struct SimulationManager<'ctx> {
    project: Rc<Project>,
    stashes: Stashes<'ctx>,
    techniques: Vec<Box<dyn ExplorationTechnique<'ctx> + 'ctx>>,
    inspect_callbacks: HashMap<String, InspectCallback<'ctx>>,
    pub insns_count: u64,
    pub errors: Vec<String>,
    halt: bool,
    options: EngineOptions,
}

impl<'ctx> SimulationManager<'ctx> {
    pub fn new(entry_state: SymState<'ctx>, project: Rc<Project>, options: EngineOptions) -> Self {
        let mut stashes = Stashes::default();
        stashes.active.push(entry_state);
        Self {
            project,
            stashes,
            techniques: Vec::new(),
            inspect_callbacks: HashMap::new(),
            insns_count: 0,
            errors: Vec::new(),
            halt: false,
            options,
        }
    }

    /// Register a callback run the next time a state's `inspect` plugin
    /// reports a hit on `tag` (a pc or opcode string, matching whatever was
    /// inserted into that state's `pc_breakpoints`/`opcode_breakpoints`).
    pub fn register_inspect_callback(&mut self, tag: impl Into<String>, callback: InspectCallback<'ctx>) {
        self.inspect_callbacks.insert(tag.into(), callback);
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn stashes(&self) -> &Stashes<'ctx> {
        &self.stashes
    }

    pub fn active(&self) -> &[SymState<'ctx>] {
        &self.stashes.active
    }

    pub fn found(&self) -> &[SymState<'ctx>] {
        &self.stashes.found
    }

    pub fn errored(&self) -> &[SymState<'ctx>] {
        &self.stashes.errored
    }

    pub fn deadended(&self) -> &[SymState<'ctx>] {
        &self.stashes.deadended
    }

    /// All states across every stash (spec §4.5 `states`).
    pub fn states(&self) -> impl Iterator<Item = &SymState<'ctx>> {
        self.stashes.states()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(%message, "simulation manager error");
        self.errors.push(message);
    }

    /// Cooperative cancellation, checked at the top of `run`'s loop (spec §5).
    pub fn request_halt(&mut self) {
        self.halt = true;
    }

    pub fn use_technique(&mut self, mut technique: Box<dyn ExplorationTechnique<'ctx> + 'ctx>) {
        technique.setup(self);
        self.techniques.push(technique);
    }

    /// Move every state in `from` matching `filter` into `to`, preserving
    /// relative order (spec §4.5 `move`).
    pub fn move_states<F>(&mut self, from: StashName, to: StashName, filter: F)
    where
        F: Fn(&SymState<'ctx>) -> bool,
    {
        let source = mem::take(self.stashes.get_mut(from));
        let (matched, rest): (Vec<_>, Vec<_>) = source.into_iter().partition(|s| filter(s));
        *self.stashes.get_mut(from) = rest;
        self.stashes.get_mut(to).extend(matched);
    }

    /// Spec §4.5 `single_step_state`.
    pub fn single_step_state(&mut self, state: SymState<'ctx>) -> Vec<SymState<'ctx>> {
        let mut state = state;
        if let Some(pc) = state.pc.clone() {
            let opcode = self.project.statement(&pc).map(|stmt| stmt.internal_name().to_string());
            let hits = opcode
                .as_deref()
                .and_then(|opcode| state.inspect().map(|inspect| inspect.hits(&pc, opcode)))
                .unwrap_or(false);
            if hits {
                tracing::debug!(pc = %pc, "inspect breakpoint hit");
                let mut callbacks = mem::take(&mut self.inspect_callbacks);
                if let Some(callback) = callbacks.get(&pc) {
                    callback(self, &mut state);
                }
                if let Some(opcode) = &opcode {
                    if let Some(callback) = callbacks.get(opcode) {
                        callback(self, &mut state);
                    }
                }
                self.inspect_callbacks = callbacks;
            }
        }

        let mut techniques = mem::take(&mut self.techniques);

        let mut state_to_step = state;
        for tech in techniques.iter_mut() {
            state_to_step = tech.check_state(self, state_to_step);
        }

        let statement = state_to_step
            .pc
            .as_deref()
            .and_then(|pc| self.project.statement(pc))
            .cloned();

        let mut successors = match statement {
            Some(stmt) => match handle(state_to_step, &stmt) {
                Ok(succs) => succs,
                Err((mut failed, err)) => {
                    failed.error = Some(err);
                    failed.halt = true;
                    vec![failed]
                }
            },
            None => {
                let mut halted = state_to_step;
                halted.halt = true;
                vec![halted]
            }
        };

        for tech in techniques.iter_mut() {
            successors = tech.check_successors(self, successors);
        }

        self.techniques = techniques;
        successors
    }

    /// Spec §4.5 `step`: one global step across every active state.
    pub fn step<F, P>(&mut self, find: F, prune: P)
    where
        F: Fn(&SymState<'ctx>) -> bool,
        P: Fn(&SymState<'ctx>) -> bool,
    {
        let mut stashes = mem::take(&mut self.stashes);
        let mut techniques = mem::take(&mut self.techniques);
        for tech in techniques.iter_mut() {
            stashes = tech.check_stashes(self, stashes);
        }
        self.stashes = stashes;
        self.techniques = techniques;

        let active = mem::take(&mut self.stashes.active);
        let mut new_active = Vec::new();
        for state in active {
            new_active.extend(self.single_step_state(state));
        }
        self.stashes.active = new_active;

        self.insns_count += 1;

        self.move_states(StashName::Active, StashName::Found, &find);
        self.move_states(StashName::Active, StashName::Errored, |s| s.error.is_some());
        self.move_states(StashName::Active, StashName::Deadended, |s| s.halt);
        self.move_states(StashName::Active, StashName::Pruned, &prune);

        if !self.options.lazy_solves() {
            self.move_states(StashName::Active, StashName::Unsat, |s| !s.solver.is_sat());
        }
        self.move_states(StashName::Found, StashName::Unsat, |s| !s.solver.is_sat());

        for state in self
            .stashes
            .pruned
            .iter()
            .chain(self.stashes.unsat.iter())
            .chain(self.stashes.errored.iter())
        {
            state.solver.dispose_context();
        }
    }

    /// Spec §4.5 `run`: loop `step` until active is exhausted (and every
    /// technique reports complete), `found` gets a hit and `find_all` isn't
    /// set, or cancellation is requested.
    pub fn run<F, P>(&mut self, find: F, prune: P, find_all: bool)
    where
        F: Fn(&SymState<'ctx>) -> bool,
        P: Fn(&SymState<'ctx>) -> bool,
    {
        loop {
            let techniques = mem::take(&mut self.techniques);
            let techniques_done = !techniques.is_empty() && techniques.iter().all(|t| t.is_complete(self));
            self.techniques = techniques;

            if self.stashes.active.is_empty() && (self.techniques.is_empty() || techniques_done) {
                break;
            }
            if !self.stashes.found.is_empty() && !find_all {
                break;
            }
            if self.halt {
                break;
            }
            self.step(&find, &prune);
        }
    }
}
