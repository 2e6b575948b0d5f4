//! dup — reconcile copy archives against an origin archive.
//!
//! # Usage
//!
//! ```text
//! dup <origin> [copy ...]
//! dup --sim
//! ```
//!
//! The first root is the origin; every other root is a copy to reconcile.
//! Missing roots are created. After a run, each copy holds exactly the
//! origin's files at the origin's paths; content a copy had that the origin
//! lacks is moved into a timestamped `~~~…~~~` quarantine directory, never
//! deleted. `--sim` replays a canned in-memory scenario instead of touching
//! disk.

mod sim;

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dup_archive::DirArchive;
use dup_core::{backup_dir_name, nfc, Archive, Lifecycle};
use dup_engine::RunSummary;

const LOG_FILE: &str = "dup.log";

#[derive(Parser, Debug)]
#[command(
    name = "dup",
    version,
    about = "Reconcile copy archives against an origin by content hash",
    long_about = None,
)]
struct Cli {
    /// Archive roots: the origin first, then the copies. Created if missing.
    #[arg(required_unless_present = "sim")]
    roots: Vec<PathBuf>,

    /// Run the canned in-memory scenario instead of scanning real roots.
    #[arg(long, conflicts_with = "roots")]
    sim: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let lifecycle = Lifecycle::new();
    let backup = backup_dir_name(Utc::now());

    let archives: Vec<Arc<dyn Archive>> = if cli.sim {
        sim::archives(&lifecycle)
    } else {
        prepare_roots(&cli.roots, &lifecycle)?
    };

    // Ctrl-C requests a cooperative stop; in-flight writers remove their
    // partial files before the engine returns.
    {
        let lifecycle = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping");
                lifecycle.request_stop();
            }
        });
    }

    let summary = dup_engine::run(archives, lifecycle, backup).await;
    print_summary(&summary);
    Ok(())
}

fn init_logging() -> Result<()> {
    let file = File::create(LOG_FILE)
        .with_context(|| format!("cannot create log file '{LOG_FILE}'"))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn prepare_roots(roots: &[PathBuf], lifecycle: &Arc<Lifecycle>) -> Result<Vec<Arc<dyn Archive>>> {
    let mut archives: Vec<Arc<dyn Archive>> = Vec::with_capacity(roots.len());
    for (idx, root) in roots.iter().enumerate() {
        std::fs::create_dir_all(root)
            .with_context(|| format!("cannot create archive root {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("cannot resolve archive root {}", root.display()))?;
        let root = PathBuf::from(nfc(&root.to_string_lossy()));
        archives.push(Arc::new(DirArchive::new(root, idx, Arc::clone(lifecycle))));
    }
    Ok(archives)
}

fn print_summary(summary: &RunSummary) {
    for (idx, archive) in summary.archives.iter().enumerate() {
        if idx == 0 {
            println!(
                "✓ origin {} — {} files scanned ({} hashed), {} bytes sent",
                archive.root, archive.scanned_files, archive.hashed_files, archive.bytes_copied,
            );
        } else {
            println!(
                "✓ copy   {} — {} files scanned ({} hashed), {} renames",
                archive.root, archive.scanned_files, archive.hashed_files, archive.renames,
            );
        }
    }
}
