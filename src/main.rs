use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use bundlepatch::{apply_patch, generate_patch, ApplyOptions, GenerateOptions};

#[derive(Parser)]
#[command(name = "bundlepatch", about = "Bundle-aware patch generator and applier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a patch package by comparing old and new asset trees
    Generate {
        /// Path to the old (base) asset tree
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (target) asset tree
        #[arg(long)]
        new: PathBuf,
        /// Output directory for the patch package
        #[arg(long, short)]
        output: PathBuf,
        /// Version string of the old tree
        #[arg(long, default_value = "0.0.0")]
        base_version: String,
        /// Version string of the new tree
        #[arg(long, default_value = "1.0.0")]
        target_version: String,
        /// Keep the first entry when bundles expose duplicate entry paths
        #[arg(long)]
        ignore_duplicates: bool,
    },
    /// Apply a patch package to a base tree
    Apply {
        /// Path to the base asset tree
        #[arg(long)]
        base: PathBuf,
        /// Path to the patch package directory
        #[arg(long, short)]
        patch: PathBuf,
        /// Output directory for the patched tree
        #[arg(long, short)]
        output: PathBuf,
        /// Fail the whole run on the first operation-group error
        #[arg(long)]
        strict: bool,
        /// Keep the first entry when bundles expose duplicate entry paths
        #[arg(long)]
        ignore_duplicates: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            old,
            new,
            output,
            base_version,
            target_version,
            ignore_duplicates,
        } => {
            println!("Generating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());
            println!("  Version: {base_version} -> {target_version}");

            let options = GenerateOptions {
                base_version,
                target_version,
                ignore_duplicate_entries: ignore_duplicates,
                ..Default::default()
            };

            let start = Instant::now();
            let (manifest, summary) = generate_patch(&old, &new, &output, &options).await?;
            let elapsed = start.elapsed();

            println!("\nPatch package generated!");
            println!("  Bundles added: {}", summary.bundles_added);
            println!("  Bundles deleted: {}", summary.bundles_deleted);
            println!("  Entries added: {}", summary.entries_added);
            println!("  Entries modified: {}", summary.entries_modified);
            println!("  Entries deleted: {}", summary.entries_deleted);
            println!("  Raw files added: {}", summary.raw_added);
            println!("  Raw files modified: {}", summary.raw_modified);
            println!("  Raw files deleted: {}", summary.raw_deleted);
            println!("  Total operations: {}", manifest.operations.len());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            base,
            patch,
            output,
            strict,
            ignore_duplicates,
        } => {
            println!("Applying patch...");
            println!("  Base: {}", base.display());
            println!("  Patch: {}", patch.display());
            println!("  Output: {}", output.display());

            let options = ApplyOptions {
                strict,
                ignore_duplicate_entries: ignore_duplicates,
                ..Default::default()
            };

            let start = Instant::now();
            let summary = apply_patch(&base, &patch, &output, &options).await?;
            let elapsed = start.elapsed();

            println!("\nPatch applied!");
            println!("  Operations applied: {}", summary.operations_applied);
            println!("  Groups failed: {}", summary.groups_failed);
            println!("  Files passed through: {}", summary.files_passed_through);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

            if summary.groups_failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
