//! Run summary, printed and optionally serialized.
//!
//! Shaped after `cbse`'s `MainResult`/`TestResult`: a small `Serialize`
//! struct the binary can both print and, if asked, hand back as JSON.

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub active: usize,
    pub deadended: usize,
    pub found: usize,
    pub pruned: usize,
    pub unsat: usize,
    pub errored: usize,
    pub insns_count: u64,
    #[serde(with = "humantime_serde_duration")]
    pub duration: Duration,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.active + self.deadended + self.found + self.pruned + self.unsat + self.errored
    }
}

mod humantime_serde_duration {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:.3}s", d.as_secs_f64()))
    }
}
