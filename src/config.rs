//! Configuration for how to prepare the dataset.
//!
//! The dataset directory is expected to hold one subdirectory per language, each with a
//! `meta.csv` file in a format understood by the selected loader (see "loaders.rs").
//!
//! Every recording gets a mel spectrogram and a linear spectrogram, saved as `.npy` files
//! under `spectrograms/` and `linear_spectrograms/`. The recordings are then split into
//! `train.txt` and `val.txt` per speaker: each speaker contributes roughly
//! `--percent-val-per-speaker` percent of its recordings to validation, and never fewer than one.
//!
//! The audio defaults match a 22.05kHz Tacotron-style setup: a 50ms window with a 12.5ms
//! shift, 80 mel bins and preemphasis of 0.97.

use std::path::PathBuf;

use anyhow::{bail, ensure, Result};
use clap::Parser;

use crate::loaders::{get_loader_by_name, LoaderFn};

pub const DEFAULT_SAMPLE_RATE: u32 = 22050;
pub const DEFAULT_NUM_FFT: usize = 1102;
pub const DEFAULT_NUM_MELS: usize = 80;

// Magnitudes below this are clipped before the dB conversion, i.e. the floor sits at -100dB.
pub const AMPLITUDE_FLOOR: f32 = 1e-5;

// Output layout, all relative to the dataset directory.
pub const TRAIN_INDEX_FILE: &str = "train.txt";
pub const VAL_INDEX_FILE: &str = "val.txt";
pub const MEL_DIR: &str = "spectrograms";
pub const LINEAR_DIR: &str = "linear_spectrograms";
pub const METADATA_GLOB: &str = "*/meta.csv";

#[derive(Parser, Debug, Clone)]
#[command(name = "specbake")]
#[command(about = "Computes spectrograms for a multi-lingual speech corpus and splits it per speaker", long_about = None)]
pub struct Args {
    /// Base directory of the dataset.
    #[arg(long, default_value = "my_common_voice")]
    pub dataset_directory: PathBuf,
    /// Name of the loader (for the type of the dataset).
    #[arg(long, default_value = "my_common_voice")]
    pub loader_name: String,
    /// Percentage of the samples for validation per speaker.
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub percent_val_per_speaker: u32,
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,
    /// Number of FFT frequencies.
    #[arg(long, default_value_t = DEFAULT_NUM_FFT)]
    pub num_fft: usize,
    /// Number of mel bins.
    #[arg(long, default_value_t = DEFAULT_NUM_MELS)]
    pub num_mels: usize,
    /// STFT window size in milliseconds.
    #[arg(long, default_value_t = 50.0)]
    pub stft_window_ms: f32,
    /// STFT window shift in milliseconds.
    #[arg(long, default_value_t = 12.5)]
    pub stft_shift_ms: f32,
    /// Do not use preemphasis.
    #[arg(long)]
    pub no_preemphasis: bool,
    /// Strength of preemphasis.
    #[arg(long, default_value_t = 0.97)]
    pub preemphasis: f32,
    /// Seed for the validation split. Without it every run draws a different split.
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Parameters of the audio pipeline, shared by loading and the STFT.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub num_fft: usize,
    pub num_mels: usize,
    pub stft_window_ms: f32,
    pub stft_shift_ms: f32,
    pub use_preemphasis: bool,
    pub preemphasis: f32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            num_fft: DEFAULT_NUM_FFT,
            num_mels: DEFAULT_NUM_MELS,
            stft_window_ms: 50.0,
            stft_shift_ms: 12.5,
            use_preemphasis: true,
            preemphasis: 0.97,
        }
    }
}

impl AudioParams {
    /// STFT window length in samples.
    pub fn window_length(&self) -> usize {
        ms_to_samples(self.stft_window_ms, self.sample_rate)
    }

    /// STFT hop length in samples.
    pub fn hop_length(&self) -> usize {
        ms_to_samples(self.stft_shift_ms, self.sample_rate)
    }

    /// Number of rows of a linear spectrogram.
    pub fn num_freq_bins(&self) -> usize {
        self.num_fft / 2 + 1
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.sample_rate > 0, "sample rate must be positive");
        ensure!(self.num_fft >= 2, "num_fft must be at least 2, got {}", self.num_fft);
        ensure!(self.num_mels > 0, "num_mels must be positive");
        let (win, hop) = (self.window_length(), self.hop_length());
        ensure!(win > 0, "STFT window of {}ms is shorter than one sample", self.stft_window_ms);
        ensure!(hop > 0, "STFT shift of {}ms is shorter than one sample", self.stft_shift_ms);
        if win > self.num_fft {
            bail!("STFT window of {} samples does not fit into num_fft = {}", win, self.num_fft);
        }
        Ok(())
    }
}

fn ms_to_samples(ms: f32, sample_rate: u32) -> usize {
    (ms as f64 * sample_rate as f64 / 1000.0).floor().max(0.0) as usize
}

/// A validated configuration for one preparation run.
#[derive(Debug, Clone)]
pub struct PrepareConfig {
    pub dataset_dir: PathBuf,
    pub loader_name: String,
    pub loader: LoaderFn,
    pub val_percent: u32,
    pub audio: AudioParams,
    pub seed: Option<u64>,
}

impl Args {
    /// Validates the arguments. Nothing is written to disk before this succeeds.
    pub fn into_config(self) -> Result<PrepareConfig> {
        if !self.dataset_directory.is_dir() {
            bail!("dataset directory '{}' does not exist", self.dataset_directory.display());
        }
        let loader = get_loader_by_name(&self.loader_name)?;
        let audio = AudioParams {
            sample_rate: self.sample_rate,
            num_fft: self.num_fft,
            num_mels: self.num_mels,
            stft_window_ms: self.stft_window_ms,
            stft_shift_ms: self.stft_shift_ms,
            use_preemphasis: !self.no_preemphasis,
            preemphasis: self.preemphasis,
        };
        audio.validate()?;

        Ok(PrepareConfig {
            dataset_dir: self.dataset_directory,
            loader_name: self.loader_name,
            loader,
            val_percent: self.percent_val_per_speaker,
            audio,
            seed: self.seed,
        })
    }
}
