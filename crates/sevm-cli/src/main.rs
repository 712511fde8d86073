// SPDX-License-Identifier: AGPL-3.0

//! `sevm` - symbolic execution engine for EVM TAC programs.
//!
//! Entry point shape matches the teacher's `cbse::main`: parse a
//! `clap::Parser` config, do the real work in a `_main` that returns a
//! structured result, then translate that into a process exit code.

mod program_file;
mod report;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use report::RunReport;
use sevm_config::CliConfig;
use sevm_manager::SimulationManager;
use sevm_state::{InitCtx, SymState};
use std::rc::Rc;
use std::time::Instant;
use z3::{Config as Z3Config, Context as Z3Context};

fn main() -> Result<()> {
    let report = _main()?;
    print_summary(&report);
    std::process::exit(if report.errored > 0 { 1 } else { 0 })
}

fn _main() -> Result<RunReport> {
    let config = CliConfig::parse();
    sevm_logs::init_tracing();

    let start = Instant::now();

    let (project, entry_pc) = program_file::load(&config.program)?;
    let project = Rc::new(project);

    let z3_config = Z3Config::new();
    let ctx = Z3Context::new(&z3_config);

    let options = config.to_engine_options();
    let mut entry_state = SymState::new(
        0,
        project.clone(),
        &ctx,
        &InitCtx::default(),
        options.clone(),
        None,
        config.partial_concrete_storage,
    );
    entry_state.pc = Some(entry_pc);

    let mut manager = SimulationManager::new(entry_state, project, options);

    let find_pc = config.find_pc.clone();
    let find = move |state: &SymState| match (&find_pc, &state.pc) {
        (Some(target), Some(pc)) => pc == target,
        _ => false,
    };
    let prune = |_: &SymState| false;

    manager.run(find, prune, config.find_all);

    Ok(RunReport {
        active: manager.active().len(),
        deadended: manager.deadended().len(),
        found: manager.found().len(),
        pruned: manager.stashes().pruned.len(),
        unsat: manager.stashes().unsat.len(),
        errored: manager.errored().len(),
        insns_count: manager.insns_count,
        duration: start.elapsed(),
    })
}

fn print_summary(report: &RunReport) {
    println!(
        "{} {} statements explored across {} states",
        "sevm:".cyan(),
        report.insns_count,
        report.total()
    );
    println!(
        "  {} active, {} deadended, {} found, {} pruned, {} unsat, {} errored",
        report.active.to_string().white(),
        report.deadended.to_string().white(),
        report.found.to_string().green(),
        report.pruned.to_string().yellow(),
        report.unsat.to_string().dimmed(),
        report.errored.to_string().red(),
    );
    println!("  finished in {:.3}s", report.duration.as_secs_f64());
}
