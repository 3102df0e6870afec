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

    println!("🏠 Joining systems and household counts onto the boundaries...");
    let result = run_map(&config, MapVariant::Density)?;
    let report = &result.joined.report;

    println!("\n=== Density Summary (systems per 1,000 households) ===\n");
    println!("  Municipal boundaries: {}", report.boundaries);
    println!("  Without systems data (shown as zero): {}", report.unmatched());
    match report.min_positive_density {
        Some(min) => println!("  Minimum density (above zero): {min:.2}"),
        None => println!("  Minimum density (above zero): n/a"),
    }
    println!("  Maximum density: {:.2}", report.max_density);

    if !report.missing_households.is_empty() {
        println!("\n  Municipalities with systems but no household count:");
        for name in &report.missing_households {
            println!("    - {name}");
        }
    }

    println!("\n✅ Density map layer saved as '{}'", result.output.display());

    Ok(())
}
