//! JSON program loader.
//!
//! `sevm-project::Project` deliberately carries no (de)serialization of its
//! own (spec §9 "Shared project state" keeps it a plain in-memory table), so
//! the on-disk format lives here instead, next to the only thing that reads
//! it. Mirrors the shape `cbse`'s `parse_build_out` expects from a Foundry
//! artifact: a flat JSON document, deserialized with `serde_json` and
//! converted into the engine's own types field by field.

use anyhow::{bail, Context, Result};
use sevm_project::{Block, Project, Statement, StatementKind};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct StatementFile {
    id: String,
    op: String,
    #[serde(default)]
    uses: Vec<String>,
    #[serde(default)]
    defs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BlockFile {
    id: String,
    statements: Vec<StatementFile>,
    #[serde(default)]
    pred: Vec<String>,
    #[serde(default)]
    succ: Vec<String>,
    #[serde(default)]
    fallthrough_edge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgramFile {
    #[serde(default)]
    code: String,
    entry: String,
    blocks: Vec<BlockFile>,
}

fn kind_of(op: &str) -> StatementKind {
    match op {
        "JUMP" => StatementKind::Jump,
        "JUMPI" => StatementKind::Jumpi,
        other => StatementKind::Other(other.to_string()),
    }
}

/// Load a TAC program from `path`, returning the built [`Project`] and the
/// entry statement id to seed the initial state's `pc` with.
pub fn load(path: &Path) -> Result<(Project, String)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading program file {}", path.display()))?;
    let program: ProgramFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing program file {}", path.display()))?;

    if program.blocks.is_empty() {
        bail!("program {} declares no blocks", path.display());
    }

    let code_hex = program.code.strip_prefix("0x").unwrap_or(&program.code);
    let code = hex::decode(code_hex).unwrap_or_default();

    let mut project = Project::new(code);
    for block in program.blocks {
        let statements = block
            .statements
            .into_iter()
            .map(|s| Statement {
                id: s.id,
                block_id: block.id.clone(),
                kind: kind_of(&s.op),
                uses: s.uses,
                defs: s.defs,
            })
            .collect();
        project.add_block(Block {
            id: block.id,
            statements,
            pred: block.pred,
            succ: block.succ,
            fallthrough_edge: block.fallthrough_edge,
        });
    }

    if project.statement(&program.entry).is_none() {
        bail!("entry statement {} not found in program", program.entry);
    }

    Ok((project, program.entry))
}
