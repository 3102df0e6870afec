use std::path::PathBuf;

use anyhow::{Context, Result};
use microgd_rs::config::PipelineConfig;
use microgd_rs::solar::aggregate::run_aggregation;
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
    let state = config.state()?;

    println!("=== Residential Micro-Generation Solar Systems in {state} ===\n");

    let result = run_aggregation(&config)?;
    let aggregate = &result.aggregate;

    println!("Columns found: {:?}", result.columns);
    println!("Records read: {}", result.records);
    println!("Records matching the filters: {}", aggregate.matched_records);
    println!("Municipalities: {}", aggregate.rows.len());
    println!("Total systems: {}", aggregate.total_systems());
    if aggregate.unassigned_systems > 0 {
        println!(
            "Systems without a municipality (left out): {}",
            aggregate.unassigned_systems
        );
    }

    println!(
        "\n✅ '{}' is ready for the map.",
        config.aggregate_path().display()
    );

    println!("\n=== Top {} Municipalities by Number of Systems ===\n", config.top_n);
    for (rank, row) in aggregate.rows.iter().take(config.top_n).enumerate() {
        println!("  {:>2}. {:<32} {:>8}", rank + 1, row.municipality, row.systems);
    }

    Ok(())
}
