// SPDX-License-Identifier: AGPL-3.0

//! The control-flow graph and statement table: the read-only, shared-by-
//! reference collaborator every [`sevm_state::SymState`] borrows from.
//!
//! Per spec §9 "Dynamic dispatch on opcode name", a `Statement`'s opcode
//! kind is a tagged variant rather than a string tag matched at dispatch
//! time; `internal_name()` is kept as an accessor so breakpoint matching
//! (the `inspect` plugin) can still key off the opcode name. The variant
//! itself carries no behavior — `handle` lives in `sevm-handlers`, which
//! depends on this crate rather than the reverse, so that the CFG/statement
//! table never needs to know about `SymState`.

use sevm_exceptions::{ExecError, ExecResult};
use std::collections::HashMap;

/// The opcode kind of a statement. Only control-flow opcodes are broken out
/// as dedicated variants since they are the ones this engine's core cares
/// about (spec §1: "The opcode handler set beyond control-flow ... treated
/// as a uniform `handle(state) -> [state]` interface").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Jump,
    Jumpi,
    /// Any opcode outside the control-flow core, identified by its TAC
    /// mnemonic (e.g. `"ADD"`, `"SSTORE"`, `"STOP"`).
    Other(String),
}

impl StatementKind {
    pub fn internal_name(&self) -> &str {
        match self {
            StatementKind::Jump => "JUMP",
            StatementKind::Jumpi => "JUMPI",
            StatementKind::Other(name) => name,
        }
    }
}

/// A single TAC statement: an opcode occurrence at a specific program point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub id: String,
    pub block_id: String,
    pub kind: StatementKind,
    /// Register operands, in the order the original TAC statement lists
    /// them (e.g. `[cond, dest]` for a `JUMPI`). Handlers in `sevm-handlers`
    /// index into this rather than re-deriving operand order.
    pub uses: Vec<String>,
    pub defs: Vec<String>,
}

impl Statement {
    pub fn internal_name(&self) -> &str {
        self.kind.internal_name()
    }
}

/// An ordered sequence of statements with CFG edges to other blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Matches `statements[0].id` (spec §3).
    pub id: String,
    pub statements: Vec<Statement>,
    pub pred: Vec<String>,
    pub succ: Vec<String>,
    /// The designated "not taken" successor among `succ`, required when
    /// `succ.len() > 1`.
    pub fallthrough_edge: Option<String>,
}

impl Block {
    pub fn first_ins(&self) -> Option<&str> {
        self.statements.first().map(|s| s.id.as_str())
    }
}

/// The shared, read-only program under analysis: every block and statement,
/// indexed for O(1) lookup. Per spec §9 "Shared project state", this is
/// never cloned — every `SymState` holds a borrow of it for its whole
/// lifetime.
#[derive(Debug, Clone, Default)]
pub struct Project {
    blocks: HashMap<String, Block>,
    statements: HashMap<String, Statement>,
    /// The statement each statement_id's block transitions into next,
    /// within the same block (index-based, built from `blocks`).
    code: Vec<u8>,
}

impl Project {
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            blocks: HashMap::new(),
            statements: HashMap::new(),
            code,
        }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Register a block and index its statements. Blocks must be added
    /// before any `block`/`statement`/navigation call references them.
    pub fn add_block(&mut self, block: Block) {
        for stmt in &block.statements {
            self.statements.insert(stmt.id.clone(), stmt.clone());
        }
        self.blocks.insert(block.id.clone(), block);
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn statement(&self, id: &str) -> Option<&Statement> {
        self.statements.get(id)
    }

    /// The block a given statement belongs to.
    pub fn block_of(&self, statement_id: &str) -> Option<&Block> {
        self.statement(statement_id)
            .and_then(|s| self.block(&s.block_id))
    }

    /// The next statement to execute after `statement_id` within its own
    /// block, or `None` if it is the block's last statement (spec §4.2).
    pub fn next_in_block(&self, statement_id: &str) -> Option<&str> {
        let stmt = self.statement(statement_id)?;
        let block = self.block(&stmt.block_id)?;
        let idx = block.statements.iter().position(|s| s.id == statement_id)?;
        block.statements.get(idx + 1).map(|s| s.id.as_str())
    }

    /// Spec §4.2 `get_fallthrough_pc`: given the block a statement falls off
    /// the end of, compute the pc to continue at.
    pub fn fallthrough_pc(&self, block_id: &str) -> ExecResult<String> {
        let block = self
            .block(block_id)
            .ok_or_else(|| ExecError::VMNoSuccessors(block_id.to_string()))?;
        match block.succ.len() {
            0 => Err(ExecError::VMNoSuccessors(block_id.to_string())),
            1 => {
                let only = &block.succ[0];
                let target = self
                    .block(only)
                    .ok_or_else(|| ExecError::VMNoSuccessors(only.clone()))?;
                target
                    .first_ins()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ExecError::VMNoSuccessors(only.clone()))
            }
            _ => {
                let edge = block.fallthrough_edge.as_ref().ok_or_else(|| {
                    ExecError::VMUnexpectedSuccessors(
                        block_id.to_string(),
                        "multiple successors, no fallthrough_edge designated".to_string(),
                    )
                })?;
                let target = self
                    .block(edge)
                    .ok_or_else(|| ExecError::VMNoSuccessors(edge.clone()))?;
                target
                    .first_ins()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ExecError::VMNoSuccessors(edge.clone()))
            }
        }
    }

    /// Spec §4.2 `get_non_fallthrough_pc`: resolve a concrete jump
    /// destination against the current block's successor set. Dispatch-
    /// synthesized block ids (`destination + "0x..."`) are matched by
    /// prefix alongside an exact match, exactly as the source CFG encodes
    /// multiple dispatch targets sharing one concrete address.
    pub fn non_fallthrough_pc(&self, block_id: &str, destination: &str) -> ExecResult<String> {
        let block = self
            .block(block_id)
            .ok_or_else(|| ExecError::VMNoSuccessors(block_id.to_string()))?;
        let prefix = format!("{destination}0x");
        let matches: Vec<&String> = block
            .succ
            .iter()
            .filter(|succ_id| succ_id.as_str() == destination || succ_id.starts_with(&prefix))
            .collect();
        match matches.as_slice() {
            [one] => {
                let target = self
                    .block(one)
                    .ok_or_else(|| ExecError::VMNoSuccessors((*one).clone()))?;
                target
                    .first_ins()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ExecError::VMNoSuccessors((*one).clone()))
            }
            [] => Err(ExecError::VMUnexpectedSuccessors(
                block_id.to_string(),
                format!("no successor matches destination {destination}"),
            )),
            _ => Err(ExecError::VMUnexpectedSuccessors(
                block_id.to_string(),
                format!("multiple successors match destination {destination}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(id: &str, block_id: &str, kind: StatementKind) -> Statement {
        Statement {
            id: id.to_string(),
            block_id: block_id.to_string(),
            kind,
            uses: Vec::new(),
            defs: Vec::new(),
        }
    }

    fn linear_project() -> Project {
        // A -> B -> C, single-successor chain.
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![stmt("A", "A", StatementKind::Other("NOP".into()))],
            pred: vec![],
            succ: vec!["B".into()],
            fallthrough_edge: None,
        });
        project.add_block(Block {
            id: "B".into(),
            statements: vec![stmt("B", "B", StatementKind::Other("NOP".into()))],
            pred: vec!["A".into()],
            succ: vec!["C".into()],
            fallthrough_edge: None,
        });
        project.add_block(Block {
            id: "C".into(),
            statements: vec![stmt("C", "C", StatementKind::Other("STOP".into()))],
            pred: vec!["B".into()],
            succ: vec![],
            fallthrough_edge: None,
        });
        project
    }

    fn branching_project() -> Project {
        // A ends in JUMPI, dest=B, fallthrough=C.
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![stmt("A_jumpi", "A", StatementKind::Jumpi)],
            pred: vec![],
            succ: vec!["B".into(), "C".into()],
            fallthrough_edge: Some("C".into()),
        });
        project.add_block(Block {
            id: "B".into(),
            statements: vec![stmt("B", "B", StatementKind::Other("JUMPDEST".into()))],
            pred: vec!["A".into()],
            succ: vec![],
            fallthrough_edge: None,
        });
        project.add_block(Block {
            id: "C".into(),
            statements: vec![stmt("C", "C", StatementKind::Other("JUMPDEST".into()))],
            pred: vec!["A".into()],
            succ: vec![],
            fallthrough_edge: None,
        });
        project
    }

    #[test]
    fn next_in_block_advances_within_block() {
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![
                stmt("A_0", "A", StatementKind::Other("PUSH1".into())),
                stmt("A_1", "A", StatementKind::Other("ADD".into())),
            ],
            pred: vec![],
            succ: vec![],
            fallthrough_edge: None,
        });
        assert_eq!(project.next_in_block("A_0"), Some("A_1"));
        assert_eq!(project.next_in_block("A_1"), None);
    }

    #[test]
    fn fallthrough_single_successor() {
        let project = linear_project();
        assert_eq!(project.fallthrough_pc("A").unwrap(), "B");
    }

    #[test]
    fn fallthrough_zero_successors_errors() {
        let project = linear_project();
        let err = project.fallthrough_pc("C").unwrap_err();
        assert!(matches!(err, ExecError::VMNoSuccessors(_)));
        assert!(err.halts_silently());
    }

    #[test]
    fn fallthrough_multi_successor_uses_designated_edge() {
        let project = branching_project();
        assert_eq!(project.fallthrough_pc("A").unwrap(), "C");
    }

    #[test]
    fn non_fallthrough_exact_match() {
        let project = branching_project();
        assert_eq!(project.non_fallthrough_pc("A", "B").unwrap(), "B");
    }

    #[test]
    fn non_fallthrough_dispatch_prefix_match() {
        let mut project = Project::new(Vec::new());
        project.add_block(Block {
            id: "A".into(),
            statements: vec![stmt("A_jumpi", "A", StatementKind::Jumpi)],
            pred: vec![],
            succ: vec!["0x100xdeadbeef".into()],
            fallthrough_edge: None,
        });
        project.add_block(Block {
            id: "0x100xdeadbeef".into(),
            statements: vec![stmt(
                "0x100xdeadbeef",
                "0x100xdeadbeef",
                StatementKind::Other("JUMPDEST".into()),
            )],
            pred: vec!["A".into()],
            succ: vec![],
            fallthrough_edge: None,
        });
        assert_eq!(
            project.non_fallthrough_pc("A", "0x10").unwrap(),
            "0x100xdeadbeef"
        );
    }

    #[test]
    fn non_fallthrough_no_match_errors() {
        let project = branching_project();
        let err = project.non_fallthrough_pc("A", "0xdead").unwrap_err();
        assert!(matches!(err, ExecError::VMUnexpectedSuccessors(_, _)));
    }

    #[test]
    fn non_fallthrough_ambiguous_match_errors() {
        let mut project = branching_project();
        // Make "B" ambiguous with a synthesized dispatch successor.
        let a = project.blocks.get_mut("A").unwrap();
        a.succ.push("B0xcafe".into());
        project.add_block(Block {
            id: "B0xcafe".into(),
            statements: vec![stmt("B0xcafe", "B0xcafe", StatementKind::Other("JUMPDEST".into()))],
            pred: vec!["A".into()],
            succ: vec![],
            fallthrough_edge: None,
        });
        let err = project.non_fallthrough_pc("A", "B").unwrap_err();
        assert!(matches!(err, ExecError::VMUnexpectedSuccessors(_, _)));
    }
}
