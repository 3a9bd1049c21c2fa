//! The preparation loop.
//!
//! Languages are processed one after another in path order. Every record gets the next global
//! index, its two spectrograms are saved as `<index>.npy` and a line describing it is appended to
//! either the training or the validation index.

use std::{
    fmt,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray_npy::write_npy;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{
    audio::{AudioTransform, StftTransform},
    config::{PrepareConfig, LINEAR_DIR, MEL_DIR, METADATA_GLOB, TRAIN_INDEX_FILE, VAL_INDEX_FILE},
    loaders::{LoaderFn, Record},
    split::{SpeakerAllocationTracker, Split},
};

/// State that lives for a whole run, across languages.
#[derive(Debug, Default)]
pub struct RunState {
    next_index: usize,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The index the next record will get.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    fn advance(&mut self) {
        self.next_index += 1;
    }
}

/// One line of `train.txt` or `val.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub index: usize,
    pub speaker_id: String,
    pub language: String,
    pub audio_path: String,
    pub mel_path: String,
    pub linear_path: String,
    pub text: String,
    // Always empty, phonemes are not used so far.
    pub phonemes: String,
}

impl IndexEntry {
    pub fn new(index: usize, record: &Record) -> Self {
        let stem = index_stem(index);
        Self {
            index,
            speaker_id: record.speaker_id.clone(),
            language: record.language.clone(),
            audio_path: record.audio_path.clone(),
            mel_path: format!("{}/{}.npy", MEL_DIR, stem),
            linear_path: format!("{}/{}.npy", LINEAR_DIR, stem),
            text: record.text.clone(),
            phonemes: String::new(),
        }
    }
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}|{}",
            index_stem(self.index),
            self.speaker_id,
            self.language,
            self.audio_path,
            self.mel_path,
            self.linear_path,
            self.text,
            self.phonemes
        )
    }
}

impl FromStr for IndexEntry {
    type Err = anyhow::Error;

    /// The text is the only field that may itself contain `|`.
    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.splitn(7, '|').collect();
        if fields.len() != 7 {
            bail!("expected 8 '|'-separated fields, got {}", fields.len());
        }
        let (text, phonemes) = fields[6].rsplit_once('|').context("missing phoneme field")?;
        let index = fields[0].parse().with_context(|| format!("invalid index '{}'", fields[0]))?;
        Ok(Self {
            index,
            speaker_id: fields[1].to_string(),
            language: fields[2].to_string(),
            audio_path: fields[3].to_string(),
            mel_path: fields[4].to_string(),
            linear_path: fields[5].to_string(),
            text: text.to_string(),
            phonemes: phonemes.to_string(),
        })
    }
}

/// Zero padded to 6 digits, used for the spectrogram file names.
pub fn index_stem(index: usize) -> String {
    format!("{:06}", index)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LanguageSummary {
    pub language: String,
    pub first_index: usize,
    pub records: usize,
    pub speakers: usize,
    pub train: usize,
    pub validation: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub languages: Vec<LanguageSummary>,
}

impl Summary {
    pub fn records(&self) -> usize {
        self.languages.iter().map(|l| l.records).sum()
    }

    pub fn train(&self) -> usize {
        self.languages.iter().map(|l| l.train).sum()
    }

    pub fn validation(&self) -> usize {
        self.languages.iter().map(|l| l.validation).sum()
    }
}

pub struct DatasetBuilder<T, R> {
    dataset_dir: PathBuf,
    loader: LoaderFn,
    val_percent: u32,
    transform: T,
    rng: R,
}

impl<T: AudioTransform, R: Rng> DatasetBuilder<T, R> {
    pub fn new(dataset_dir: impl Into<PathBuf>, loader: LoaderFn, val_percent: u32, transform: T, rng: R) -> Self {
        Self { dataset_dir: dataset_dir.into(), loader, val_percent, transform, rng }
    }

    /// Processes every metadata file in order. The spectrogram directories must exist.
    pub fn run<W: Write, V: Write>(
        &mut self,
        meta_files: &[PathBuf],
        state: &mut RunState,
        train: &mut W,
        val: &mut V,
    ) -> Result<Summary> {
        let mut summary = Summary::default();
        for meta_path in meta_files {
            let language = self.build_language(meta_path, state, train, val)?;
            info!(
                language = %language.language,
                records = language.records,
                speakers = language.speakers,
                train = language.train,
                val = language.validation,
                "language done"
            );
            summary.languages.push(language);
        }
        Ok(summary)
    }

    /// Processes the records of a single metadata file.
    pub fn build_language<W: Write, V: Write>(
        &mut self,
        meta_path: &Path,
        state: &mut RunState,
        train: &mut W,
        val: &mut V,
    ) -> Result<LanguageSummary> {
        let records = (self.loader)(&self.dataset_dir, &[meta_path.to_path_buf()])
            .with_context(|| format!("failed to load metadata from {}", meta_path.display()))?;
        let mut tracker = SpeakerAllocationTracker::from_records(&records, self.val_percent);

        let mut summary = LanguageSummary {
            language: language_of(meta_path),
            first_index: state.next_index(),
            records: records.len(),
            speakers: tracker.num_speakers(),
            ..Default::default()
        };

        let pb = ProgressBar::new(records.len() as u64);
        pb.set_style(ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:15.bold.dim} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"));
        pb.set_prefix(summary.language.clone());

        for record in &records {
            let entry = IndexEntry::new(state.next_index(), record);
            self.save_spectrograms(record, &entry)?;

            let split = tracker.decide(&record.speaker_id, &mut self.rng)?;
            debug!(index = entry.index, speaker = %record.speaker_id, ?split, "allocated");
            match split {
                Split::Train => {
                    writeln!(train, "{}", entry)?;
                    summary.train += 1;
                }
                Split::Validation => {
                    writeln!(val, "{}", entry)?;
                    summary.validation += 1;
                }
            }

            state.advance();
            pb.inc(1);
        }
        pb.finish_and_clear();

        debug_assert!(tracker.is_exhausted());
        Ok(summary)
    }

    fn save_spectrograms(&self, record: &Record, entry: &IndexEntry) -> Result<()> {
        let audio_path = self.dataset_dir.join(&record.audio_path);
        let samples = self
            .transform
            .load(&audio_path)
            .with_context(|| format!("record {}: cannot load {}", index_stem(entry.index), audio_path.display()))?;
        let spectrograms = self.transform.spectrograms(&samples);

        for (relative, matrix) in [(&entry.mel_path, &spectrograms.mel), (&entry.linear_path, &spectrograms.linear)] {
            let path = self.dataset_dir.join(relative);
            write_npy(&path, matrix).with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

fn language_of(meta_path: &Path) -> String {
    meta_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// All `<language>/meta.csv` files of the dataset, sorted by path.
pub fn discover_metadata(dataset_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = dataset_dir.to_str().context("dataset directory is not valid UTF-8")?;
    let pattern = format!("{}/{}", glob::Pattern::escape(dir), METADATA_GLOB);
    let mut paths = glob::glob(&pattern)?.collect::<Result<Vec<PathBuf>, _>>()?;
    if paths.is_empty() {
        bail!("No metadata files found for glob: {}", pattern);
    }
    paths.sort();
    Ok(paths)
}

/// Runs the whole preparation described by `config`.
pub fn prepare(config: &PrepareConfig) -> Result<Summary> {
    let meta_files = discover_metadata(&config.dataset_dir)?;
    let languages: Vec<String> = meta_files.iter().map(|p| language_of(p)).collect();
    info!("Languages: {:?}", languages);

    let transform = StftTransform::new(config.audio.clone())?;
    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    for dir in [MEL_DIR, LINEAR_DIR] {
        let path = config.dataset_dir.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("failed to create {}", path.display()))?;
    }
    let train_path = config.dataset_dir.join(TRAIN_INDEX_FILE);
    let val_path = config.dataset_dir.join(VAL_INDEX_FILE);
    let mut train = BufWriter::new(
        File::create(&train_path).with_context(|| format!("failed to create {}", train_path.display()))?,
    );
    let mut val =
        BufWriter::new(File::create(&val_path).with_context(|| format!("failed to create {}", val_path.display()))?);

    info!("Please wait, this may take a very long time.");
    let mut builder = DatasetBuilder::new(&config.dataset_dir, config.loader, config.val_percent, transform, rng);
    let mut state = RunState::new();
    let summary = builder.run(&meta_files, &mut state, &mut train, &mut val)?;

    train.flush()?;
    val.flush()?;
    Ok(summary)
}
