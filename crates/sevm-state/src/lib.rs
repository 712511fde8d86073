// SPDX-License-Identifier: AGPL-3.0

//! The per-path symbolic machine snapshot.
//!
//! Grounded almost line-for-line on `SEtaac/state.py`'s `SymbolicEVMState`:
//! same field set, same `new`/`copy`/`reset`/`set_next_pc` shape, same
//! CALLDATA initialization scheme. Two deliberate departures from that
//! source, per spec §9's redesign notes:
//!
//! - Plugins carry no back-reference to their owning state. Python's
//!   `plugin.state` pointer becomes unnecessary once every hook that would
//!   use it (`check_state`, `check_successors`, inspect breakpoints) takes
//!   the state as an explicit argument instead.
//! - `solver` is a dedicated field rather than a plugin like `globals`: it
//!   is consulted from the branch handler and the manager's sat sweep on
//!   every step, so routing it through the same `Box<dyn StatePlugin>` +
//!   downcast indirection as `globals`/`inspect` would buy nothing.

use num_bigint::BigUint;
use sevm_bitvec::SymBitVec;
use sevm_config::EngineOptions;
use sevm_exceptions::{ExecError, ExecResult};
use sevm_memory::{Memory, Storage};
use sevm_project::Project;
use sevm_solver::ScopedSolver;
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use z3::Context;

static NEXT_UUID: AtomicU64 = AtomicU64::new(1);

fn next_uuid() -> u64 {
    NEXT_UUID.fetch_add(1, Ordering::Relaxed)
}

/// Seconds since the epoch for 2022-01-01, the lower timestamp bound every
/// fresh state is fenced to (spec §3 `min_timestamp`). A fixed constant
/// rather than "now minus N years" so runs are reproducible.
const MIN_TIMESTAMP_EPOCH_SECS: u64 = 1_640_995_200;

/// One `{inputs, output}` hash observation. Plain `Clone` is enough to
/// satisfy "preserved across clones" (spec §3) since both fields are cheap
/// refcounted Z3 handles under the hood; no back-reference to rebind.
#[derive(Debug, Clone)]
pub struct ShaObservation<'ctx> {
    pub inputs: Vec<SymBitVec<'ctx>>,
    pub output: SymBitVec<'ctx>,
}

/// A call frame pushed onto `callstack`. Call opcodes themselves are out of
/// scope (spec §1); this is the minimal shape `callstack` needs to satisfy
/// clone/copy tests and a future call handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnFrame {
    pub caller_pc: String,
    pub caller_xid: u64,
}

/// Outcome descriptor of the most recently completed inner call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReturnData {
    pub size: Option<u64>,
    pub instruction_count: Option<u64>,
}

/// A named side-car attached to a state (spec §4.7, §9 "Plugins by dynamic
/// attribute installation"). `plugin_copy` is invoked by [`SymState::copy`]
/// for every registered plugin; there is no `set_state`/back-reference step
/// since plugins never call back into their owner.
pub trait StatePlugin: Any {
    fn plugin_copy(&self) -> Box<dyn StatePlugin>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Free-form key/value scratch space, shared across a state's lifetime and
/// carried across clones.
#[derive(Debug, Clone, Default)]
pub struct GlobalsPlugin {
    pub values: HashMap<String, String>,
}

impl StatePlugin for GlobalsPlugin {
    fn plugin_copy(&self) -> Box<dyn StatePlugin> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Breakpoint membership for the `inspect` plugin. `sevm-manager`'s
/// `SimulationManager` owns the actual callbacks, registered via
/// `register_inspect_callback` and keyed by the same tags, since a callback
/// type living here would need to name `SimulationManager`, inverting the
/// dependency direction; this plugin only answers "is pc/opcode X a
/// breakpoint on this state".
#[derive(Debug, Clone, Default)]
pub struct InspectPlugin {
    pub pc_breakpoints: std::collections::HashSet<String>,
    pub opcode_breakpoints: std::collections::HashSet<String>,
}

impl InspectPlugin {
    pub fn hits(&self, pc: &str, opcode: &str) -> bool {
        self.pc_breakpoints.contains(pc) || self.opcode_breakpoints.contains(opcode)
    }
}

impl StatePlugin for InspectPlugin {
    fn plugin_copy(&self) -> Box<dyn StatePlugin> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Recognized keys for a state's initial context (spec §6 "Init context").
#[derive(Debug, Clone, Default)]
pub struct InitCtx {
    /// Hex string (with or without `0x`); the token `SS` at a byte position
    /// marks that byte as symbolic.
    pub calldata: Option<String>,
    pub calldatasize: Option<u64>,
    pub caller: Option<String>,
    pub origin: Option<String>,
    pub address: Option<String>,
    pub balance: Option<u64>,
    pub number: Option<u64>,
    pub difficulty: Option<u64>,
    pub timestamp: Option<u64>,
    pub callvalue: Option<u64>,
}

fn hex_concrete<'ctx>(value: &SymBitVec<'ctx>) -> Option<String> {
    value.as_biguint().ok().map(|v| format!("0x{v:x}"))
}

fn parse_hex_u256<'ctx>(ctx: &'ctx Context, text: &str) -> SymBitVec<'ctx> {
    let stripped = text.strip_prefix("0x").unwrap_or(text);
    let value = BigUint::parse_bytes(stripped.as_bytes(), 16).unwrap_or_default();
    SymBitVec::from_biguint(value, 256)
}

/// The per-path machine snapshot.
pub struct SymState<'ctx> {
    z3ctx: &'ctx Context,

    pub xid: u64,
    pub uuid: u64,
    project: Rc<Project>,

    pub pc: Option<String>,
    pub trace: Vec<String>,

    pub memory: Memory<'ctx>,
    pub storage: Storage<'ctx>,
    pub registers: HashMap<String, SymBitVec<'ctx>>,
    pub ctx: HashMap<String, SymBitVec<'ctx>>,
    pub callstack: Vec<ReturnFrame>,
    pub returndata: ReturnData,
    pub instruction_count: u64,

    pub halt: bool,
    pub revert: bool,
    pub error: Option<ExecError>,

    pub gas: SymBitVec<'ctx>,
    pub start_balance: SymBitVec<'ctx>,
    pub balance: SymBitVec<'ctx>,

    pub calldata: Memory<'ctx>,
    pub calldatasize: SymBitVec<'ctx>,
    max_calldata_size: u64,

    pub sha_observed: Vec<ShaObservation<'ctx>>,

    pub solver: ScopedSolver<'ctx>,
    active_plugins: HashMap<String, Box<dyn StatePlugin>>,

    pub min_timestamp: u64,
    pub max_timestamp: u64,

    options: EngineOptions,
}

impl<'ctx> SymState<'ctx> {
    pub fn new(
        xid: u64,
        project: Rc<Project>,
        z3ctx: &'ctx Context,
        init_ctx: &InitCtx,
        options: EngineOptions,
        max_calldatasize: Option<u64>,
        partial_concrete_storage: bool,
    ) -> Self {
        let max_calldata_size = max_calldatasize.unwrap_or(options.max_calldata_size);
        let code_size = project.code().len() as u64;
        let storage = if partial_concrete_storage {
            Storage::new_partial_concrete(z3ctx, xid)
        } else {
            Storage::new(z3ctx)
        };

        let mut state = Self {
            z3ctx,
            xid,
            uuid: next_uuid(),
            project,
            pc: None,
            trace: Vec::new(),
            memory: Memory::new(z3ctx),
            storage,
            registers: HashMap::new(),
            ctx: HashMap::new(),
            callstack: Vec::new(),
            returndata: ReturnData::default(),
            instruction_count: 0,
            halt: false,
            revert: false,
            error: None,
            gas: SymBitVec::symbolic_xid(z3ctx, "GAS", xid, 256),
            start_balance: SymBitVec::symbolic_xid(z3ctx, "BALANCE", xid, 256),
            balance: SymBitVec::from_u64(0, 256),
            calldata: Memory::new(z3ctx),
            calldatasize: SymBitVec::from_u64(0, 256),
            max_calldata_size,
            sha_observed: Vec::new(),
            solver: ScopedSolver::new(z3ctx),
            active_plugins: HashMap::new(),
            min_timestamp: MIN_TIMESTAMP_EPOCH_SECS,
            max_timestamp: now_epoch_secs(),
            options,
        };

        state.register_default_plugins();

        let callvalue = match init_ctx.callvalue {
            Some(v) => SymBitVec::from_u64(v, 256),
            None => SymBitVec::symbolic_xid(z3ctx, "CALLVALUE", xid, 256),
        };
        state.balance = state.start_balance.add(&callvalue, z3ctx);
        state.ctx.insert("CALLVALUE".to_string(), callvalue);
        state.ctx.insert(
            "CODESIZE-ADDRESS".to_string(),
            SymBitVec::from_u64(code_size, 256),
        );

        state.apply_init_ctx(init_ctx);
        state.assert_timestamp_bounds();
        state
    }

    fn register_default_plugins(&mut self) {
        self.register_plugin("globals", Box::new(GlobalsPlugin::default()));
        if self.options.state_inspect() {
            self.register_plugin("inspect", Box::new(InspectPlugin::default()));
        }
    }

    pub fn register_plugin(&mut self, name: &str, plugin: Box<dyn StatePlugin>) {
        self.active_plugins.insert(name.to_string(), plugin);
    }

    pub fn active_plugin_names(&self) -> Vec<&str> {
        self.active_plugins.keys().map(|s| s.as_str()).collect()
    }

    pub fn globals(&self) -> &GlobalsPlugin {
        self.active_plugins
            .get("globals")
            .and_then(|p| p.as_any().downcast_ref())
            .expect("globals plugin is always registered")
    }

    pub fn globals_mut(&mut self) -> &mut GlobalsPlugin {
        self.active_plugins
            .get_mut("globals")
            .and_then(|p| p.as_any_mut().downcast_mut())
            .expect("globals plugin is always registered")
    }

    pub fn inspect(&self) -> Option<&InspectPlugin> {
        self.active_plugins
            .get("inspect")
            .and_then(|p| p.as_any().downcast_ref())
    }

    pub fn inspect_mut(&mut self) -> Option<&mut InspectPlugin> {
        self.active_plugins
            .get_mut("inspect")
            .and_then(|p| p.as_any_mut().downcast_mut())
    }

    fn apply_init_ctx(&mut self, init_ctx: &InitCtx) {
        self.apply_calldata(init_ctx);

        if let Some(caller) = &init_ctx.caller {
            self.ctx.insert("CALLER".to_string(), parse_hex_u256(self.z3ctx, caller));
        }
        if let Some(origin) = &init_ctx.origin {
            self.ctx.insert("ORIGIN".to_string(), parse_hex_u256(self.z3ctx, origin));
        }
        if let Some(balance) = init_ctx.balance {
            let cond = self
                .start_balance
                .eq(&SymBitVec::from_u64(balance, 256), self.z3ctx)
                .as_z3(self.z3ctx);
            self.add_constraint(cond);
        }
        if let Some(address) = &init_ctx.address {
            self.ctx.insert("ADDRESS".to_string(), parse_hex_u256(self.z3ctx, address));
        }
        if let Some(number) = init_ctx.number {
            self.ctx.insert("NUMBER".to_string(), SymBitVec::from_u64(number, 256));
        }
        if let Some(difficulty) = init_ctx.difficulty {
            self.ctx
                .insert("DIFFICULTY".to_string(), SymBitVec::from_u64(difficulty, 256));
        }
        if let Some(timestamp) = init_ctx.timestamp {
            self.ctx
                .insert("TIMESTAMP".to_string(), SymBitVec::from_u64(timestamp, 256));
        }
        // CALLVALUE is already seeded into `ctx` (concrete or fresh symbolic)
        // by `new()`, before `apply_init_ctx` runs, since `balance` depends
        // on it too.
    }

    fn apply_calldata(&mut self, init_ctx: &InitCtx) {
        self.calldatasize = SymBitVec::symbolic_xid(self.z3ctx, "CALLDATASIZE", self.xid, 256);

        let Some(raw) = &init_ctx.calldata else {
            let bound = SymBitVec::from_u64(self.max_calldata_size + 1, 256);
            let cond = self.calldatasize.ult(&bound, self.z3ctx).as_z3(self.z3ctx);
            self.add_constraint(cond);
            return;
        };

        let stripped = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes: Vec<&str> = stripped
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap_or(""))
            .collect();

        if let Some(size) = init_ctx.calldatasize {
            let cond = self
                .calldatasize
                .eq(&SymBitVec::from_u64(size, 256), self.z3ctx)
                .as_z3(self.z3ctx);
            self.add_constraint(cond);
            self.max_calldata_size = size;

            for (index, chunk) in bytes.iter().enumerate() {
                let value = byte_value(self.z3ctx, chunk, self.xid, index);
                self.calldata
                    .store_byte(SymBitVec::from_u64(index as u64, 256), value, self.z3ctx, self.xid);
            }
            for index in bytes.len()..size as usize {
                let value = SymBitVec::symbolic_xid(self.z3ctx, &format!("CALLDATA_BYTE_{index}"), self.xid, 8);
                self.calldata
                    .store_byte(SymBitVec::from_u64(index as u64, 256), value, self.z3ctx, self.xid);
            }
        } else {
            let bound = SymBitVec::from_u64(self.max_calldata_size + 1, 256);
            let upper = self.calldatasize.ult(&bound, self.z3ctx).as_z3(self.z3ctx);
            self.add_constraint(upper);
            let lower = self
                .calldatasize
                .uge(&SymBitVec::from_u64(bytes.len() as u64, 256), self.z3ctx)
                .as_z3(self.z3ctx);
            self.add_constraint(lower);

            for (index, chunk) in bytes.iter().enumerate() {
                let value = byte_value(self.z3ctx, chunk, self.xid, index);
                self.calldata
                    .store_byte(SymBitVec::from_u64(index as u64, 256), value, self.z3ctx, self.xid);
            }
        }
    }

    fn assert_timestamp_bounds(&mut self) {
        let timestamp = self
            .ctx
            .get("TIMESTAMP")
            .cloned()
            .unwrap_or_else(|| SymBitVec::symbolic_xid(self.z3ctx, "TIMESTAMP", self.xid, 256));
        let lower = SymBitVec::from_u64(self.min_timestamp, 256);
        let upper = SymBitVec::from_u64(self.max_timestamp, 256);
        let ge = timestamp.uge(&lower, self.z3ctx).as_z3(self.z3ctx);
        let le = timestamp.ule(&upper, self.z3ctx).as_z3(self.z3ctx);
        self.add_constraint(ge);
        self.add_constraint(le);
        self.ctx.entry("TIMESTAMP".to_string()).or_insert(timestamp);
    }

    /// Record a permanent path constraint. Policy for
    /// `STATE_STOP_AT_ADDCONSTRAINT` (spec's open debugger-hook question):
    /// since there is no interactive debugger to drop into in a compiled
    /// binary, this traces the addition at `debug` level instead of the
    /// source's `ipdb.set_trace()` — still an inspectable hook, just via
    /// `tracing` rather than a REPL.
    pub fn add_constraint(&mut self, cond: z3::ast::Bool<'ctx>) {
        if self.options.stop_at_add_constraint() {
            tracing::debug!(xid = self.xid, uuid = self.uuid, "adding path constraint");
        }
        self.solver.add(cond);
    }

    pub fn constraints(&self) -> &[z3::ast::Bool<'ctx>] {
        self.solver.assertions()
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn z3ctx(&self) -> &'ctx Context {
        self.z3ctx
    }

    pub fn curr_block_id(&self) -> Option<&str> {
        let pc = self.pc.as_deref()?;
        self.project.statement(pc).map(|s| s.block_id.as_str())
    }

    /// Spec §4.2: advance within the current block, or fall through to the
    /// next block; absorbs `VMNoSuccessors`/`VMUnexpectedSuccessors` into
    /// `halt = true` per the §7 propagation policy.
    pub fn set_next_pc(&mut self) {
        let Some(pc) = self.pc.clone() else {
            self.halt = true;
            return;
        };
        if let Some(next) = self.project.next_in_block(&pc) {
            self.pc = Some(next.to_string());
            return;
        }
        match self.get_fallthrough_pc() {
            Ok(next) => self.pc = Some(next),
            Err(err) => {
                debug_assert!(err.halts_silently());
                self.halt = true;
            }
        }
    }

    pub fn get_fallthrough_pc(&self) -> ExecResult<String> {
        let block_id = self
            .curr_block_id()
            .ok_or_else(|| ExecError::VMNoSuccessors("<no pc>".to_string()))?;
        self.project.fallthrough_pc(block_id)
    }

    pub fn get_non_fallthrough_pc(&self, destination_val: &SymBitVec<'ctx>) -> ExecResult<String> {
        let block_id = self
            .curr_block_id()
            .ok_or_else(|| ExecError::VMNoSuccessors("<no pc>".to_string()))?;
        let destination = hex_concrete(destination_val).ok_or(ExecError::SymbolicJumpTarget)?;
        self.project.non_fallthrough_pc(block_id, &destination)
    }

    /// Independent deep clone: a fresh uuid, copy-on-write memory/storage/
    /// calldata, an independent solver context, and cloned plugins. Matches
    /// `SymbolicEVMState.copy()`.
    pub fn copy(&self) -> Self {
        let mut active_plugins = HashMap::new();
        for (name, plugin) in &self.active_plugins {
            active_plugins.insert(name.clone(), plugin.plugin_copy());
        }

        Self {
            z3ctx: self.z3ctx,
            xid: self.xid,
            uuid: next_uuid(),
            project: Rc::clone(&self.project),
            pc: self.pc.clone(),
            trace: self.trace.clone(),
            memory: self.memory.clone(),
            storage: self.storage.clone(),
            registers: self.registers.clone(),
            ctx: self.ctx.clone(),
            callstack: self.callstack.clone(),
            returndata: self.returndata.clone(),
            instruction_count: self.instruction_count,
            halt: self.halt,
            revert: self.revert,
            error: self.error.clone(),
            gas: self.gas.clone(),
            start_balance: self.start_balance.clone(),
            balance: self.balance.clone(),
            calldata: self.calldata.clone(),
            calldatasize: self.calldatasize.clone(),
            max_calldata_size: self.max_calldata_size,
            sha_observed: self.sha_observed.clone(),
            solver: self.solver.clone(),
            active_plugins,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            options: self.options.clone(),
        }
    }

    /// Reinitialize in place for a new transaction over the same project
    /// (spec §4.1 `reset`). Context (`ctx`) is cleared along with
    /// everything else, matching the source's behavior.
    pub fn reset(&mut self, xid: u64) {
        self.xid = xid;
        self.uuid = next_uuid();
        self.active_plugins.clear();
        self.register_default_plugins();

        self.pc = None;
        self.trace.clear();
        self.memory = Memory::new(self.z3ctx);
        self.registers.clear();
        self.ctx.clear();
        self.callstack.clear();
        self.returndata = ReturnData::default();
        self.instruction_count = 0;
        self.halt = false;
        self.revert = false;
        self.error = None;
        self.gas = SymBitVec::symbolic_xid(self.z3ctx, "GAS", xid, 256);
        self.start_balance = SymBitVec::symbolic_xid(self.z3ctx, "BALANCE", xid, 256);
        let callvalue = SymBitVec::symbolic_xid(self.z3ctx, "CALLVALUE", xid, 256);
        self.balance = self.start_balance.add(&callvalue, self.z3ctx);
        self.ctx.insert("CALLVALUE".to_string(), callvalue);
        let code_size = self.project.code().len() as u64;
        self.ctx
            .insert("CODESIZE-ADDRESS".to_string(), SymBitVec::from_u64(code_size, 256));
        self.sha_observed.clear();
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(MIN_TIMESTAMP_EPOCH_SECS)
}

fn byte_value<'ctx>(ctx: &'ctx Context, chunk: &str, xid: u64, index: usize) -> SymBitVec<'ctx> {
    if chunk.eq_ignore_ascii_case("SS") {
        SymBitVec::symbolic_xid(ctx, &format!("CALLDATA_BYTE_{index}"), xid, 8)
    } else {
        let value = u8::from_str_radix(chunk, 16).unwrap_or(0);
        SymBitVec::from_u64(value as u64, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sevm_project::{Block, Project, Statement, StatementKind};
    use z3::Config;

    fn empty_project() -> Rc<Project> {
        Rc::new(Project::new(vec![0u8; 10]))
    }

    fn fresh_state<'ctx>(ctx: &'ctx Context, init: &InitCtx) -> SymState<'ctx> {
        SymState::new(0, empty_project(), ctx, init, EngineOptions::default(), None, false)
    }

    #[test]
    fn missing_callvalue_becomes_fresh_symbolic_term() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let state = fresh_state(&ctx, &InitCtx::default());
        let callvalue = state.ctx.get("CALLVALUE").expect("CALLVALUE seeded by default");
        assert!(callvalue.is_symbolic());
        assert!(state.balance.is_symbolic());
    }

    #[test]
    fn explicit_callvalue_is_concrete_and_folds_into_balance() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let init = InitCtx {
            callvalue: Some(7),
            ..InitCtx::default()
        };
        let state = SymState::new(0, empty_project(), &ctx, &init, EngineOptions::default(), None, false);
        let callvalue = state.ctx.get("CALLVALUE").expect("CALLVALUE seeded");
        assert_eq!(callvalue.as_u64().unwrap(), 7);
    }

    #[test]
    fn partial_concrete_storage_flag_selects_snapshot_backed_storage() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let state = SymState::new(
            0,
            empty_project(),
            &ctx,
            &InitCtx::default(),
            EngineOptions::default(),
            None,
            true,
        );
        assert!(state.storage.is_symbolic());
    }

    #[test]
    fn new_state_has_fresh_uuid_and_no_pc() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let state = fresh_state(&ctx, &InitCtx::default());
        assert!(state.pc.is_none());
        assert!(!state.halt);
    }

    #[test]
    fn two_fresh_states_get_distinct_uuids() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let a = fresh_state(&ctx, &InitCtx::default());
        let b = fresh_state(&ctx, &InitCtx::default());
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn clone_independence_across_mutable_fields() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut base = fresh_state(&ctx, &InitCtx::default());
        base.registers
            .insert("v0".to_string(), SymBitVec::from_u64(1, 256));
        base.storage
            .store(SymBitVec::from_u64(1, 256), SymBitVec::from_u64(1, 256), &ctx, 0);
        base.callstack.push(ReturnFrame {
            caller_pc: "A".to_string(),
            caller_xid: 0,
        });

        let mut clone = base.copy();
        assert_ne!(clone.uuid, base.uuid);

        clone
            .registers
            .insert("v0".to_string(), SymBitVec::from_u64(2, 256));
        clone
            .storage
            .store(SymBitVec::from_u64(1, 256), SymBitVec::from_u64(99, 256), &ctx, 0);
        clone.callstack.push(ReturnFrame {
            caller_pc: "B".to_string(),
            caller_xid: 0,
        });
        clone.solver.add(SymBitVec::from_u64(1, 256).eq(&SymBitVec::from_u64(1, 256), &ctx).as_z3(&ctx));

        assert_eq!(base.registers.get("v0").unwrap().as_u64().unwrap(), 1);
        assert_eq!(
            base.storage.load(&SymBitVec::from_u64(1, 256), &ctx).as_u64().unwrap(),
            1
        );
        assert_eq!(base.callstack.len(), 1);
        assert_eq!(clone.callstack.len(), 2);
        assert_eq!(base.solver.len(), clone.solver.len() - 1);
    }

    #[test]
    fn calldata_with_symbolic_bytes_constrains_size_exactly() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let init = InitCtx {
            calldata: Some("0x11SS33".to_string()),
            calldatasize: Some(3),
            ..Default::default()
        };
        let state = fresh_state(&ctx, &init);
        assert_eq!(state.max_calldata_size, 3);
        assert!(!state.solver.is_empty());
        let byte0 = state.calldata.load_byte(&SymBitVec::from_u64(0, 256), &ctx);
        assert_eq!(byte0.as_u64().unwrap(), 0x11);
    }

    #[test]
    fn fully_symbolic_calldata_bounds_size() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let state = fresh_state(&ctx, &InitCtx::default());
        // calldatasize < MAX_CALLDATA_SIZE + 1 must be in the permanent log.
        assert!(state.solver.len() >= 1);
    }

    #[test]
    fn timestamp_bounds_are_asserted_for_symbolic_timestamp() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let state = fresh_state(&ctx, &InitCtx::default());
        // two bound constraints plus calldatasize bound.
        assert!(state.solver.len() >= 3);
    }

    #[test]
    fn explicit_timestamp_is_concrete_in_ctx() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let init = InitCtx {
            timestamp: Some(1_700_000_000),
            ..Default::default()
        };
        let state = fresh_state(&ctx, &init);
        let ts = state.ctx.get("TIMESTAMP").unwrap();
        assert_eq!(ts.as_u64().unwrap(), 1_700_000_000);
    }

    #[test]
    fn reset_reinitializes_in_place() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = fresh_state(&ctx, &InitCtx::default());
        state.pc = Some("A".to_string());
        state.halt = true;
        state.instruction_count = 5;
        state.reset(7);
        assert_eq!(state.xid, 7);
        assert!(state.pc.is_none());
        assert!(!state.halt);
        assert_eq!(state.instruction_count, 0);
    }

    #[test]
    fn set_next_pc_falls_through_single_successor() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![Statement {
                id: "A".into(),
                block_id: "A".into(),
                kind: StatementKind::Other("NOP".into()),
                uses: vec![],
                defs: vec![],
            }],
            pred: vec![],
            succ: vec!["B".into()],
            fallthrough_edge: None,
        });
        project.add_block(Block {
            id: "B".into(),
            statements: vec![Statement {
                id: "B".into(),
                block_id: "B".into(),
                kind: StatementKind::Other("STOP".into()),
                uses: vec![],
                defs: vec![],
            }],
            pred: vec!["A".into()],
            succ: vec![],
            fallthrough_edge: None,
        });

        let mut state = SymState::new(0, Rc::new(project), &ctx, &InitCtx::default(), EngineOptions::default(), None, false);
        state.pc = Some("A".to_string());
        state.set_next_pc();
        assert_eq!(state.pc.as_deref(), Some("B"));
    }

    #[test]
    fn set_next_pc_halts_on_no_successors() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![Statement {
                id: "A".into(),
                block_id: "A".into(),
                kind: StatementKind::Other("STOP".into()),
                uses: vec![],
                defs: vec![],
            }],
            pred: vec![],
            succ: vec![],
            fallthrough_edge: None,
        });
        let mut state = SymState::new(0, Rc::new(project), &ctx, &InitCtx::default(), EngineOptions::default(), None, false);
        state.pc = Some("A".to_string());
        state.set_next_pc();
        assert!(state.halt);
    }

    #[test]
    fn globals_plugin_survives_clone_independently() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = fresh_state(&ctx, &InitCtx::default());
        state.globals_mut().values.insert("k".to_string(), "v".to_string());
        let mut clone = state.copy();
        clone.globals_mut().values.insert("k2".to_string(), "v2".to_string());
        assert_eq!(state.globals().values.len(), 1);
        assert_eq!(clone.globals().values.len(), 2);
    }
}
