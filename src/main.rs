// =============================================================================
// IMAGE TRANSFER PROBE - image-to-buffer copy check for Vulkan drivers
// =============================================================================
//
// Clears a device-local R16G16B16_UNORM image to red, copies it into a
// host-visible buffer and checks the bytes that come back. A 5462x2 image
// reads back wrong texels on affected drivers; 256x256 is the control.
//
// FLOW:
// 1. Instance + validation, first (or configured) GPU, one queue
// 2. Per scenario: image + buffer, record clear/transitions/copy
// 3. Submit, wait on fence, map, compare
// 4. Report; non-zero exit if any texel is wrong
//
// =============================================================================

mod backend;
mod config;
mod report;
mod scenario;
mod texel;
mod transfer;

use anyhow::Result;
use backend::VulkanDevice;
use config::Config;
use report::TransferReport;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

const APP_NAME: &str = "image-transfer-probe";

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Logger first, so config load/parse warnings are visible
    init_logger();
    log::info!("Starting {}", APP_NAME);

    // Optional config path as the only argument
    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    if config.debug.log_to_file {
        if let Err(e) = write_log_header(&config.debug.log_file) {
            log::warn!("Failed to create log file {:?}: {}", config.debug.log_file, e);
        }
    }

    let scenarios = config.scenarios()?;
    let strategy = config.allocation_strategy();

    let device = VulkanDevice::new(APP_NAME, &config.device)?;

    let mut reports: Vec<TransferReport> = Vec::with_capacity(scenarios.len());
    for scenario in &scenarios {
        let report = transfer::run_scenario(
            &device,
            scenario,
            strategy,
            config.transfer.max_reported_mismatches,
        )?;

        if report.passed() {
            log::info!("{}", report);
        } else {
            log::error!("{}", report);
        }
        reports.push(report);
    }

    if config.debug.log_to_file {
        if let Err(e) = report::append_to_log(&config.debug.log_file, &reports) {
            log::warn!("{:#}", e);
        }
    }

    let failed: Vec<_> = reports
        .iter()
        .filter(|r| !r.passed())
        .map(|r| r.scenario.name)
        .collect();

    if !failed.is_empty() {
        anyhow::bail!("Transfer readback mismatch in: {}", failed.join(", "));
    }

    log::info!("All {} scenario(s) read back correctly", reports.len());
    Ok(())
}

/// Initialize console logging. `RUST_LOG` overrides the default `info` level.
fn init_logger() {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();
}

/// Create/clear the report log file and write its header
fn write_log_header<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;

    writeln!(file, "=== Image Transfer Probe Log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(())
}
