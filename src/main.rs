use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gmindex::index::stats;
use gmindex::index::IndexBuilder;
use gmindex::module_file::JsonModuleReader;
use gmindex::utils::{load_config, remove_index};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gmindex")]
#[command(about = "Global module index for precompiled module caches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the app data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or update the index of a module directory
    Build {
        /// Module cache directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Ignore the existing index and rescan every module
        #[arg(short, long)]
        force: bool,
    },
    /// Print the modules declaring each identifier
    Lookup {
        /// Identifiers or selectors
        #[arg(required = true)]
        names: Vec<String>,

        /// Module cache directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// List indexed modules
    Modules {
        /// Module cache directory
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// List the direct dependencies of a module
    Deps {
        /// Module file, relative to the directory or absolute
        module: PathBuf,

        /// Module cache directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Show index statistics
    Stats {
        /// Module cache directory
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Remove the index and any abandoned build lock
    Remove {
        /// Module cache directory
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("GMINDEX_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Build { dir, force } => {
            println!("Indexing: {}", dir.display());
            let report = IndexBuilder::new(&dir, &config, &JsonModuleReader)
                .force(force)
                .build()
                .with_context(|| format!("Failed to build index in {}", dir.display()))?;

            if report.up_to_date {
                println!(
                    "Index is up to date (generation {}, {} modules)",
                    report.generation, report.modules_reused
                );
            } else {
                println!(
                    "Generation {}: {} scanned, {} reused, {} removed, {} identifiers",
                    report.generation,
                    report.modules_scanned,
                    report.modules_reused,
                    report.modules_removed,
                    report.identifier_count
                );
            }
            for failure in &report.scan_failures {
                eprintln!("warning: skipped {}: {}", failure.path.display(), failure.error);
            }
        }
        Commands::Lookup { names, dir } => {
            stats::show_lookups(&dir, &names, &config)?;
        }
        Commands::Modules { dir } => {
            stats::list_modules(&dir, &config)?;
        }
        Commands::Deps { module, dir } => {
            stats::show_dependencies(&dir, &module, &config)?;
        }
        Commands::Stats { dir } => {
            stats::show_stats(&dir, &config)?;
        }
        Commands::Remove { dir } => {
            let removed = remove_index(&dir, &config)?;
            if removed.index {
                println!("Removed index in {}", dir.display());
            } else {
                println!("No index in {}", dir.display());
            }
            if removed.live_lock {
                eprintln!(
                    "warning: a build is running in {}; its lock was left in place",
                    dir.display()
                );
            }
        }
    }

    Ok(())
}
