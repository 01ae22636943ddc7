//! Codec and generation settings, loadable from a TOML file.
//!
//! Every section has defaults, so a config file only needs the keys it
//! changes:
//!
//! ```toml
//! [codec]
//! n_bar = 4
//! seed = 7
//!
//! [generation]
//! max_retries = 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::midi::ExportSettings;
use crate::tokens::{Instrument, ReverseMode};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Quantization and layout settings shared by the encoder and decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Beats in one bar.
    pub beats_per_bar: u32,
    /// Bars per encoded section.
    pub n_bar: usize,
    /// Text ticks per beat for drum tracks.
    pub drum_ticks_per_beat: u32,
    /// Text ticks per beat for every other track.
    pub melodic_ticks_per_beat: u32,
    /// Velocity given to every decoded note.
    pub velocity: u8,
    /// Tempo of exported MIDI files, in BPM.
    pub tempo_bpm: u32,
    pub reverse_mode: ReverseMode,
    /// Seed for the decoder's family choice. Random when unset.
    pub seed: Option<u64>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            beats_per_bar: 4,
            n_bar: 8,
            drum_ticks_per_beat: 4,
            melodic_ticks_per_beat: 8,
            velocity: 99,
            tempo_bpm: 120,
            reverse_mode: ReverseMode::Canonical,
            seed: None,
        }
    }
}

impl CodecConfig {
    /// Quantization grid for an instrument.
    pub fn ticks_per_beat(&self, instrument: Instrument) -> u32 {
        if instrument.is_drums() {
            self.drum_ticks_per_beat.max(1)
        } else {
            self.melodic_ticks_per_beat.max(1)
        }
    }

    /// Text ticks in one full bar for an instrument.
    pub fn bar_ticks(&self, instrument: Instrument) -> u32 {
        self.ticks_per_beat(instrument) * self.beats_per_bar
    }

    /// Conductor-track settings for exported files.
    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            tempo_bpm: self.tempo_bpm,
            beats_per_bar: u8::try_from(self.beats_per_bar).unwrap_or(u8::MAX),
        }
    }
}

/// Settings for the generation orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Bars generated for a new track.
    pub n_bars: usize,
    /// Enforce the exact bar count with truncation and retries.
    pub force_sequence_length: bool,
    /// No-repeat n-gram size forwarded to the oracle. 0 disables it.
    pub improvisation_level: usize,
    /// Token budget for the side-track part of a next-bar prompt.
    pub max_prompt_length: usize,
    pub generate_until_token: String,
    pub max_retries: usize,
    /// Context window forwarded to the oracle, in tokens.
    pub context_window: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            n_bars: 8,
            force_sequence_length: true,
            improvisation_level: 0,
            max_prompt_length: 1500,
            generate_until_token: crate::tokens::vocab::TRACK_END.to_string(),
            max_retries: 2,
            context_window: 2048,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub codec: CodecConfig,
    pub generation: GenerationConfig,
}

impl Config {
    /// Loads a config from a TOML file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML for
    /// this schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
