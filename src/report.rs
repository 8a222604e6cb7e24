// Human-readable transfer results, for the console and the optional log file

use crate::backend::AllocationStrategy;
use crate::scenario::Scenario;
use crate::transfer::Verification;
use anyhow::{Context, Result};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub scenario: Scenario,
    pub device_name: String,
    pub strategy: AllocationStrategy,
    pub verification: Verification,
}

impl TransferReport {
    pub fn passed(&self) -> bool {
        self.verification.is_ok()
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = &self.verification;

        writeln!(
            f,
            "{} {}x{} on {} ({:?} allocation): {}",
            self.scenario.name,
            self.scenario.width,
            self.scenario.height,
            self.device_name,
            self.strategy,
            if self.passed() { "PASS" } else { "FAIL" }
        )?;
        writeln!(f, "  expected {}", v.expected)?;

        for probe in &v.probes {
            match probe.found {
                Some(found) => writeln!(
                    f,
                    "  texel[{}] = {}{}",
                    probe.index,
                    found,
                    if probe.matches { "" } else { "  <-- mismatch" }
                )?,
                None => writeln!(f, "  texel[{}] missing from readback", probe.index)?,
            }
        }

        write!(f, "  {} of {} texels differ", v.mismatches, v.texels_checked)?;
        for m in &v.first_mismatches {
            match m.found {
                Some(found) => write!(f, "\n    #{} ({}, {}): {}", m.index, m.x, m.y, found)?,
                None => write!(f, "\n    #{} ({}, {}): missing", m.index, m.x, m.y)?,
            }
        }
        if v.mismatches > v.first_mismatches.len() {
            write!(f, "\n    ... {} more", v.mismatches - v.first_mismatches.len())?;
        }

        Ok(())
    }
}

/// Append report summaries to the debug log file
pub fn append_to_log<P: AsRef<Path>>(path: P, reports: &[TransferReport]) -> Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {:?}", path))?;

    for report in reports {
        writeln!(file, "{}", report)?;
        writeln!(file)?;
    }

    Ok(())
}
