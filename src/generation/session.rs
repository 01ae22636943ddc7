//! Persisted generation sessions.
//!
//! A session file holds the full piece text next to the per-track settings
//! and bars that produced it, so a piece can be decoded later or reloaded
//! to keep generating.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::piece::{Piece, TrackState};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid session file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// The on-disk form of a generation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Full piece text.
    pub generated_midi: String,
    pub hyperparameters_and_bars: Vec<TrackState>,
}

impl SessionRecord {
    /// Captures the current state of a piece.
    pub fn from_piece(piece: &Piece) -> Self {
        Self {
            generated_midi: piece.build_piece_text(),
            hyperparameters_and_bars: piece.tracks().to_vec(),
        }
    }

    /// Rebuilds the piece this record was taken from.
    pub fn to_piece(&self) -> Piece {
        Piece::from_tracks(self.hyperparameters_and_bars.clone())
    }

    /// Writes the record to `<dir>/<YYYYMMDD_HHMMSS>.json`, creating `dir`
    /// if needed, and returns the file path.
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be written
    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf, SessionError> {
        fs::create_dir_all(dir).map_err(|source| SessionError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{stamp}.json"));
        self.save_to_file(&path)?;
        Ok(path)
    }

    /// Writes the record as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file writing fails
    pub fn save_to_file(&self, path: &Path) -> Result<(), SessionError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| SessionError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "saved session");
        Ok(())
    }

    /// Loads a record from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if file reading or parsing fails
    pub fn load_from_file(path: &Path) -> Result<Self, SessionError> {
        let json = fs::read_to_string(path).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| SessionError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}
