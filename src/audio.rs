//! Audio loading and spectrogram computation.
//!
//! Audio is decoded to mono `f32` in `[-1, 1]` and resampled to the configured sample rate. Both
//! spectrograms come from the same centered STFT (reflect padding, periodic Hann window) and are
//! stored in dB, frequency along the rows and time along the columns.

use std::{fs::File, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader};
use mel_filter::{mel, NormalizationFactor};
use ndarray::Array2;
use rayon::prelude::*;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, warn};

use crate::config::{AudioParams, AMPLITUDE_FLOOR};

/// Mel and linear spectrograms of one recording, `(num_mels, frames)` and `(num_fft/2 + 1, frames)`.
#[derive(Debug, Clone)]
pub struct Spectrograms {
    pub mel: Array2<f32>,
    pub linear: Array2<f32>,
}

/// Turns recordings into spectrograms.
pub trait AudioTransform {
    /// Loads a recording as mono samples at the sample rate the transform works at.
    fn load(&self, path: &Path) -> Result<Vec<f32>>;

    fn spectrograms(&self, samples: &[f32]) -> Spectrograms;
}

pub struct StftTransform {
    params: AudioParams,
    // Hann window of the configured length, zero padded to `num_fft`.
    window: Vec<f32>,
    mel_basis: Array2<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl StftTransform {
    pub fn new(params: AudioParams) -> Result<Self> {
        params.validate()?;
        let n_fft = params.num_fft;
        let bins = params.num_freq_bins();

        let filters = mel::<f32>(
            params.sample_rate as usize,
            n_fft,
            Some(params.num_mels),
            None,
            None,
            false,
            NormalizationFactor::One,
        );
        let mut mel_basis = Array2::<f32>::zeros((params.num_mels, bins));
        for (m, filter) in filters.iter().take(params.num_mels).enumerate() {
            for (k, &w) in filter.iter().take(bins).enumerate() {
                mel_basis[[m, k]] = w;
            }
        }

        let window = padded_hann_window(params.window_length(), n_fft);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(n_fft);

        Ok(Self { params, window, mel_basis, fft })
    }

    /// STFT magnitudes, shape `(num_fft/2 + 1, frames)`.
    pub fn magnitudes(&self, samples: &[f32]) -> Array2<f32> {
        let n_fft = self.params.num_fft;
        let hop = self.params.hop_length();
        let bins = self.params.num_freq_bins();
        let pad = n_fft / 2;
        let num_frames = 1 + (samples.len() + 2 * pad).saturating_sub(n_fft) / hop;

        let columns: Vec<Vec<f32>> = (0..num_frames)
            .into_par_iter()
            .map(|frame| {
                let start = frame * hop;
                let mut buffer: Vec<Complex<f32>> = (0..n_fft)
                    .map(|i| Complex::new(padded_sample(samples, start + i, pad) * self.window[i], 0.0))
                    .collect();
                self.fft.process(&mut buffer);
                buffer[..bins].iter().map(|c| c.norm()).collect()
            })
            .collect();

        Array2::from_shape_fn((bins, num_frames), |(k, t)| columns[t][k])
    }
}

impl AudioTransform for StftTransform {
    fn load(&self, path: &Path) -> Result<Vec<f32>> {
        load_audio(path, self.params.sample_rate)
    }

    fn spectrograms(&self, samples: &[f32]) -> Spectrograms {
        let magnitudes = if self.params.use_preemphasis {
            self.magnitudes(&preemphasis(samples, self.params.preemphasis))
        } else {
            self.magnitudes(samples)
        };
        let mel = self.mel_basis.dot(&magnitudes).mapv(amplitude_to_db);
        let linear = magnitudes.mapv(amplitude_to_db);
        Spectrograms { mel, linear }
    }
}

/// `y[n] = x[n] - coef * x[n - 1]`
pub fn preemphasis(samples: &[f32], coef: f32) -> Vec<f32> {
    let mut prev = 0.0f32;
    samples
        .iter()
        .map(|&x| {
            let y = x - coef * prev;
            prev = x;
            y
        })
        .collect()
}

pub fn amplitude_to_db(x: f32) -> f32 {
    20.0 * x.max(AMPLITUDE_FLOOR).log10()
}

/// Periodic Hann window of `win_length` centered in a zero buffer of `n_fft`.
fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f32> {
    let mut window = vec![0.0f32; n_fft];
    let offset = (n_fft - win_length) / 2;
    for n in 0..win_length {
        let phase = 2.0 * std::f64::consts::PI * n as f64 / win_length as f64;
        window[offset + n] = (0.5 - 0.5 * phase.cos()) as f32;
    }
    window
}

/// Sample `i` of the signal reflect-padded by `pad` on both sides.
fn padded_sample(samples: &[f32], i: usize, pad: usize) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples[reflect_index(i as isize - pad as isize, samples.len())]
}

// Mirrors around the first and last sample without repeating them, like numpy's "reflect".
fn reflect_index(pos: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let p = pos.rem_euclid(period);
    if p < len as isize { p as usize } else { (period - p) as usize }
}

/// Loads a recording as mono samples at `target_sr`.
pub fn load_audio(path: &Path, target_sr: u32) -> Result<Vec<f32>> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    let (samples, original_sr) = if is_wav { decode_wav(path)? } else { decode_with_symphonia(path)? };

    if samples.is_empty() {
        bail!("decoded audio was empty: {}", path.display());
    }
    if original_sr != target_sr {
        debug!(path = %path.display(), from = original_sr, to = target_sr, "resampling");
    }
    resample_audio_to_target(samples, original_sr, target_sr)
        .with_context(|| format!("failed to resample {}", path.display()))
}

fn decode_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("failed to open audio file: {}", path.display()))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<f32>, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<f32>, _>>()?
        }
    };
    Ok((downmix(interleaved, spec.channels as usize), spec.sample_rate))
}

fn decode_with_symphonia(path: &Path) -> Result<(Vec<f32>, u32)> {
    let file = File::open(path).with_context(|| format!("failed to open audio file: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("unsupported format: {}", path.display()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No supported audio track!")?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions { verify: true })?;

    let mut pcm_f32 = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(e) if is_end_of_stream(&e) => break,
            Err(e) => bail!("Error during decoding {}: {}", path.display(), e),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(path = %path.display(), error = e, "skipping undecodable packet");
                continue;
            }
            Err(e) => bail!("Error during decoding {}: {}", path.display(), e),
        };
        sample_rate.get_or_insert(decoded.spec().rate);
        let channel_count = decoded.spec().channels.count();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);
        pcm_f32.extend(downmix(sample_buf.samples().to_vec(), channel_count));
    }

    let sample_rate = sample_rate.context("Missing sample rate!")?;
    Ok((pcm_f32, sample_rate))
}

/// Symphonia reports the end of a stream as an `UnexpectedEof` I/O error. Any other I/O error means
/// the file could not be read completely.
fn is_end_of_stream(err: &SymphoniaError) -> bool {
    matches!(err, SymphoniaError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

/// Averages interleaved channels into one.
fn downmix(interleaved: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved;
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resamples a single audio array to the target sample rate.
fn resample_audio_to_target(audio_array: Vec<f32>, original_sr: u32, target_sr: u32) -> Result<Vec<f32>> {
    if original_sr == target_sr {
        return Ok(audio_array);
    }

    // Highest-quality settings.
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: rubato::SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: rubato::WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        target_sr as f64 / original_sr as f64,
        2.0,
        params,
        audio_array.len(),
        1, // Number of channels.
    )?;

    let waves_in = vec![audio_array];
    let waves_out = resampler.process(&waves_in, None)?;
    waves_out.into_iter().next().context("resampler produced no output channel")
}
