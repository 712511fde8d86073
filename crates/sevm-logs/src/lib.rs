// SPDX-License-Identifier: AGPL-3.0

//! Tracing setup and unique-warning diagnostics for the symbolic execution
//! engine.
//!
//! Step-by-step engine traffic (stepping a statement, forking a branch,
//! disposing a solver context) goes through the `tracing` macros directly at
//! the call site in `sevm-manager`/`sevm-state`/`sevm-handlers`; this crate
//! owns subscriber setup plus the "warn once" diagnostics surface used for
//! things a caller should notice but not get flooded by (e.g. repeatedly
//! hitting an unmodeled opcode on the same path family).

use colored::*;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Diagnostic codes surfaced to engine users via [`warn_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCode {
    UnsupportedOpcode,
    IntractablePath,
    InternalError,
}

impl DiagnosticCode {
    pub fn tag(&self) -> &'static str {
        match self {
            DiagnosticCode::UnsupportedOpcode => "unsupported-opcode",
            DiagnosticCode::IntractablePath => "intractable-path",
            DiagnosticCode::InternalError => "internal-error",
        }
    }
}

static UNIQUE_MESSAGES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn is_logged(message: &str) -> bool {
    UNIQUE_MESSAGES.lock().unwrap().contains(message)
}

fn mark_logged(message: &str) {
    UNIQUE_MESSAGES.lock().unwrap().insert(message.to_string());
}

/// Install a `tracing` subscriber reading `RUST_LOG` (or `sevm=debug` when
/// unset), matching the CLI's default verbosity.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sevm=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Print a warning exactly once per distinct message for the lifetime of the
/// process. Used for recoverable surprises (unmodeled opcode hit, loop bound
/// reached) that would otherwise spam every path that touches them.
pub fn warn_unique(text: &str) {
    if !is_logged(text) {
        eprintln!("{}", text.yellow());
        mark_logged(text);
    }
}

/// Like [`warn_unique`] but tagged with a [`DiagnosticCode`] for filtering.
pub fn warn_code(code: DiagnosticCode, msg: &str) {
    warn_unique(&format!("[{}] {}", code.tag(), msg));
}

/// Reset the unique-message dedup set. Exposed for tests.
pub fn clear_logged_messages() {
    UNIQUE_MESSAGES.lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_unique_suppresses_repeats() {
        clear_logged_messages();
        let msg = "hit opcode 0xfc which is not modeled";
        assert!(!is_logged(msg));
        warn_unique(msg);
        assert!(is_logged(msg));
        warn_unique(msg); // must not panic or double-insert
        clear_logged_messages();
        assert!(!is_logged(msg));
    }

    #[test]
    fn diagnostic_code_tags_are_stable() {
        assert_eq!(DiagnosticCode::UnsupportedOpcode.tag(), "unsupported-opcode");
        assert_eq!(DiagnosticCode::IntractablePath.tag(), "intractable-path");
        assert_eq!(DiagnosticCode::InternalError.tag(), "internal-error");
    }
}
