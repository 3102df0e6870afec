use std::path::PathBuf;

use anyhow::{Context, Result};
use microgd_rs::config::PipelineConfig;
use microgd_rs::solar::map::{MapVariant, run_map};
use microgd_rs::solar::{PipelineError, report_failure};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let data_dir = std::env::current_dir().context("failed to resolve the data directory")?;
    if let Err(err) = run(data_dir) {
        report_failure(&err);
    }

    Ok(())
}

fn run(data_dir: PathBuf) -> Result<(), PipelineError> {
    let config = PipelineConfig::load(data_dir)?;

    println!("🌍 Joining systems per municipality onto the boundaries...");
    let result = run_map(&config, MapVariant::Systems)?;
    let report = &result.joined.report;

    println!("\n=== Join Summary ===\n");
    println!("  Municipal boundaries: {}", report.boundaries);
    println!("  With installed systems data: {}", report.matched);
    println!("  Without data (shown as zero): {}", report.unmatched());
    println!("  Maximum systems in a municipality: {}", report.max_systems);

    if !report.unused_aggregate_keys.is_empty() {
        println!("\n  Aggregate rows that matched no boundary:");
        for name in &report.unused_aggregate_keys {
            println!("    - {name}");
        }
    }

    println!("\n✅ Map layer saved as '{}'", result.output.display());

    Ok(())
}
