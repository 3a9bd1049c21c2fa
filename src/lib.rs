//! Spectrogram preparation for multi-lingual, multi-speaker TTS corpora.
//!
//! See "config.rs" for the options and "builder.rs" for the preparation loop.

pub mod audio;
pub mod builder;
pub mod config;
pub mod loaders;
pub mod split;
