//! Checks a prepared dataset: every index appears exactly once across `train.txt` and `val.txt`,
//! the indices have no gaps, and every spectrogram loads with the expected shape.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use ndarray_npy::read_npy;
use tracing::info;
use tracing_subscriber::EnvFilter;

use specbake::{
    builder::{index_stem, IndexEntry},
    config::{DEFAULT_NUM_FFT, DEFAULT_NUM_MELS, LINEAR_DIR, MEL_DIR, TRAIN_INDEX_FILE, VAL_INDEX_FILE},
};

#[derive(Parser, Debug)]
#[command(name = "check_index")]
#[command(about = "Validates the index files and spectrograms of a prepared dataset", long_about = None)]
struct Args {
    #[arg(long, default_value = "my_common_voice")]
    dataset_directory: PathBuf,
    #[arg(long, default_value_t = DEFAULT_NUM_MELS)]
    num_mels: usize,
    #[arg(long, default_value_t = DEFAULT_NUM_FFT)]
    num_fft: usize,
}

fn read_entries(path: &Path) -> Result<Vec<IndexEntry>> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .map(|(i, line)| line.parse::<IndexEntry>().with_context(|| format!("{}:{}", path.display(), i + 1)))
        .collect()
}

fn check_spectrograms(root: &Path, entry: &IndexEntry, num_mels: usize, num_freq_bins: usize) -> Result<()> {
    let stem = index_stem(entry.index);
    let expected_mel = format!("{}/{}.npy", MEL_DIR, stem);
    let expected_linear = format!("{}/{}.npy", LINEAR_DIR, stem);
    ensure!(entry.mel_path == expected_mel, "record {}: mel path is {}, expected {}", stem, entry.mel_path, expected_mel);
    ensure!(
        entry.linear_path == expected_linear,
        "record {}: linear path is {}, expected {}",
        stem,
        entry.linear_path,
        expected_linear
    );

    let mel: Array2<f32> = read_npy(root.join(&entry.mel_path))
        .with_context(|| format!("failed to load {}", entry.mel_path))?;
    let linear: Array2<f32> = read_npy(root.join(&entry.linear_path))
        .with_context(|| format!("failed to load {}", entry.linear_path))?;

    ensure!(mel.nrows() == num_mels, "{} has {} rows, expected {}", entry.mel_path, mel.nrows(), num_mels);
    ensure!(
        linear.nrows() == num_freq_bins,
        "{} has {} rows, expected {}",
        entry.linear_path,
        linear.nrows(),
        num_freq_bins
    );
    ensure!(
        mel.ncols() == linear.ncols(),
        "record {:06}: {} mel frames but {} linear frames",
        entry.index,
        mel.ncols(),
        linear.ncols()
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
    let args = Args::parse();
    let root = &args.dataset_directory;

    let train = read_entries(&root.join(TRAIN_INDEX_FILE))?;
    let val = read_entries(&root.join(VAL_INDEX_FILE))?;
    info!("Found {} train and {} val entries.", train.len(), val.len());

    let total = train.len() + val.len();
    let mut seen = vec![false; total];
    for entry in train.iter().chain(&val) {
        if entry.index >= total {
            bail!("index {:06} is out of range, there are only {} entries", entry.index, total);
        }
        if seen[entry.index] {
            bail!("index {:06} appears more than once", entry.index);
        }
        seen[entry.index] = true;
    }

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Checking spectrograms [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );
    for entry in train.iter().chain(&val) {
        check_spectrograms(root, entry, args.num_mels, args.num_fft / 2 + 1)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!("All {} entries are consistent.", total);
    Ok(())
}
