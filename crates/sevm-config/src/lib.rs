// SPDX-License-Identifier: AGPL-3.0

//! Engine options (spec §6 "Options (consumed)") and the CLI flags that set
//! them, matching the teacher's `cbse-config::Config` pattern of a
//! `clap::Parser` struct translated into a typed, engine-facing options
//! value.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Boolean engine options. Represented as a set of tags rather than a list
/// (spec §9 open question "options cloning"): the Python source sometimes
/// treats `state.options` as a dict-used-as-set and sometimes clones it as a
/// list, which would let duplicates creep in across `copy()`. A `HashSet` is
/// unambiguous and its `Clone` is exactly the independent-copy semantics
/// `SymbolicState::copy()` needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionFlag {
    /// Skip the per-step unsat sweep of the `active` stash.
    LazySolves,
    /// Attach the `inspect` plugin (pc/opcode breakpoints) to new states.
    StateInspect,
    /// Break into a debugger hook on every `add_constraint` call.
    StateStopAtAddConstraint,
}

pub type OptionSet = HashSet<OptionFlag>;

/// Default upper bound on symbolic CALLDATA length, in bytes, when the
/// caller doesn't pin CALLDATASIZE exactly.
pub const DEFAULT_MAX_CALLDATA_SIZE: u64 = 1024;

/// Typed, per-engine-run configuration. One `EngineOptions` is shared
/// (read-only, by reference) across every state created for a run; flags are
/// copied by value into a fresh state's `options` set at construction, not
/// re-read from this struct afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub flags: OptionSet,
    pub max_calldata_size: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            flags: OptionSet::new(),
            max_calldata_size: DEFAULT_MAX_CALLDATA_SIZE,
        }
    }
}

impl EngineOptions {
    pub fn has(&self, flag: OptionFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn lazy_solves(&self) -> bool {
        self.has(OptionFlag::LazySolves)
    }

    pub fn state_inspect(&self) -> bool {
        self.has(OptionFlag::StateInspect)
    }

    pub fn stop_at_add_constraint(&self) -> bool {
        self.has(OptionFlag::StateStopAtAddConstraint)
    }
}

/// Command-line configuration for the `sevm` CLI, translated into
/// [`EngineOptions`] before the engine is invoked.
#[derive(Parser, Debug, Clone)]
#[command(name = "sevm", version, about = "Symbolic execution engine for EVM TAC programs")]
pub struct CliConfig {
    /// Path to the TAC program (project) to explore.
    pub program: std::path::PathBuf,

    /// Upper bound on symbolic CALLDATA length in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_CALLDATA_SIZE)]
    pub max_calldata_size: u64,

    /// Skip the per-step unsat sweep of the `active` stash.
    #[arg(long)]
    pub lazy_solves: bool,

    /// Attach pc/opcode breakpoints to every new state.
    #[arg(long)]
    pub state_inspect: bool,

    /// Target program counter to search for (moves matching states to `found`).
    #[arg(long)]
    pub find_pc: Option<String>,

    /// Keep exploring after the first `found` state instead of stopping.
    #[arg(long)]
    pub find_all: bool,

    /// Back storage with a concrete snapshot plus array instead of a fully
    /// lazy concrete/symbolic map.
    #[arg(long)]
    pub partial_concrete_storage: bool,
}

impl CliConfig {
    pub fn to_engine_options(&self) -> EngineOptions {
        let mut flags = OptionSet::new();
        if self.lazy_solves {
            flags.insert(OptionFlag::LazySolves);
        }
        if self.state_inspect {
            flags.insert(OptionFlag::StateInspect);
        }
        EngineOptions {
            flags,
            max_calldata_size: self.max_calldata_size,
        }
    }
}
