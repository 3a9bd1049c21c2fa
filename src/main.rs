//! The main preparation script. See "config.rs" for more information on how to use.
//!
//! Every recording is decoded and transformed once, strictly in metadata order, so a run over a
//! large corpus takes a while. A failed run leaves partial outputs behind; rerun it from scratch.

use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use specbake::{builder::prepare, config::Args};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let start_time = Instant::now();
    let config = Args::parse().into_config()?;
    info!(
        dataset = %config.dataset_dir.display(),
        loader = %config.loader_name,
        val_percent = config.val_percent,
        seed = ?config.seed,
        "preparing spectrograms"
    );

    let summary = prepare(&config)?;

    info!(
        "Done! {} records: {} in train, {} in val, written to '{}'",
        summary.records(),
        summary.train(),
        summary.validation(),
        config.dataset_dir.display()
    );
    info!("Total time elapsed: {:?}", start_time.elapsed());
    Ok(())
}
