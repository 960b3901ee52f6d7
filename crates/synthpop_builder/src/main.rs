//! Synthpop CLI
//!
//! YAML pipeline → synthetic agents and households (CSV)
//! One-off IPF fits and snapshot checksum verification

#[cfg(feature = "cli")]
use anyhow::Result;
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "synthpop")]
#[command(about = "Build synthetic populations from census tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Run a YAML pipeline
    Run {
        /// Pipeline YAML file
        #[arg(long)]
        config: PathBuf,
    },

    /// Fit a seed joint to margins with IPF
    Fit {
        /// Seed joint CSV (every non-count column is a dimension)
        #[arg(long)]
        seed: PathBuf,

        /// Margin as `dim1,dim2=path.csv` (repeatable, applied in order)
        #[arg(long = "constraint", required = true)]
        constraints: Vec<String>,

        /// Output CSV for the fitted joint
        #[arg(long)]
        out: PathBuf,

        /// Count column name in every input
        #[arg(long, default_value = "count")]
        count_column: String,
    },

    /// Verify a stored stage snapshot against its checksum
    Verify {
        /// Snapshot directory
        #[arg(long)]
        dir: PathBuf,

        /// Snapshot name prefix
        #[arg(long)]
        prefix: String,

        /// Stage version
        #[arg(long)]
        version: u32,
    },
}

#[cfg(feature = "cli")]
fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let pipeline = synthpop_builder::Pipeline::load(&config)?;
            println!("🔨 Running pipeline '{}'...", pipeline.name());
            println!("   Config: {}", config.display());

            let state = pipeline.run()?;
            let written = pipeline.write_outputs(&state)?;

            println!("\n✅ Population built!");
            println!("   Agents:     {}", state.agents.len());
            println!(
                "   Households: {} ({} agents placed)",
                state.households.len(),
                synthpop_builder::pipeline::placed_agents(&state)
            );
            print_scorecard(&state.scorecard);
            for path in written {
                println!("   📄 {}", path.display());
            }
        }

        Commands::Fit {
            seed,
            constraints,
            out,
            count_column,
        } => {
            println!("🔨 Fitting joint distribution...");
            println!("   Seed:   {}", seed.display());
            println!("   Output: {}", out.display());
            fit_command(&seed, &constraints, &out, &count_column)?;
        }

        Commands::Verify { dir, prefix, version } => {
            println!("\n🔍 Verifying snapshot integrity...");
            let store = synthpop_builder::SnapshotStore::new(&dir, &prefix);
            let path = store.data_path(version);
            if !path.exists() {
                anyhow::bail!("❌ No snapshot at {}", path.display());
            }
            if store.verify(version)? {
                let meta = store.read_metadata(version)?;
                println!("✅ Snapshot verification passed");
                println!("   Stage:   {}", meta.stage);
                println!("   Created: {}", meta.created_at);
                println!("   Size:    {}", synthpop_builder::human_bytes(meta.compressed_size));
            } else {
                anyhow::bail!("❌ Snapshot verification failed - checksum mismatch!")
            }
        }
    }

    Ok(())
}

#[cfg(feature = "cli")]
fn fit_command(seed: &std::path::Path, constraints: &[String], out: &std::path::Path, count_column: &str) -> Result<()> {
    use synthpop_builder::ingest;
    use synthpop_core::{fit, Constraint, FitConfig, FitValidator};

    let seed_source = ingest::TableSource::new(seed, &[]).with_count_column(count_column);
    let (seed_table, _) = ingest::read_table(&seed_source)?;

    let mut parsed = Vec::with_capacity(constraints.len());
    for arg in constraints {
        let source = ingest::parse_constraint_arg(arg)?.with_count_column(count_column);
        let (margin, _) = ingest::read_table(&source)?;
        let (constraint, dropped) = Constraint::from_margin(margin).restricted_to(&seed_table)?;
        if dropped > 0 {
            eprintln!("Warning: {} rows of {} have no seed support, dropped", dropped, source.path.display());
        }
        parsed.push(constraint);
    }

    let outcome = fit(&seed_table, &parsed, &FitConfig::default())?;
    ingest::write_table(out, &outcome.table, count_column)?;

    println!("\n✅ Fit {}", if outcome.converged { "converged" } else { "did not converge" });
    println!("   Iterations:  {}", outcome.iterations);
    println!("   Deviation:   {:.2e}", outcome.max_deviation);
    if outcome.unreachable_cells > 0 {
        println!("   Unreachable: {} margin cells", outcome.unreachable_cells);
    }
    let validator = FitValidator::default();
    for constraint in &parsed {
        let report = validator.validate_fitted(&outcome, constraint, &constraint.dims().join("×"))?;
        println!(
            "   {:<24} Z² {:>8.3} (critical {:.3}) {}",
            report.context,
            report.z_squared,
            report.critical_value,
            if report.passed { "✅" } else { "❌" }
        );
    }
    Ok(())
}

#[cfg(feature = "cli")]
fn print_scorecard(scorecard: &synthpop_core::Scorecard) {
    if scorecard.is_empty() {
        return;
    }
    println!("\n📊 Fit scorecard");
    for row in scorecard.rows() {
        println!(
            "   {:<40} Z² {:>8.3} / {:<8.3} SRMSE {:.4} {}",
            row.context,
            row.report.z_squared,
            row.report.critical_value,
            row.report.srmse,
            if row.report.passed { "✅" } else { "❌" }
        );
    }
    let failures = scorecard.failures().count();
    if failures > 0 {
        println!("   ⚠️  {} of {} comparisons fail", failures, scorecard.len());
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("synthpop CLI is not available. Enable the 'cli' feature to use it.");
    std::process::exit(1);
}
