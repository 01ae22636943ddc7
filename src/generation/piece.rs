//! The in-progress composition.
//!
//! A [`Piece`] is an ordered list of tracks, each an ordered list of bar
//! texts. Track order is insertion order and defines both the serialized
//! piece and the cross-track prompt context. Tracks are addressed by
//! position; `-1` means the most recently added track.

use serde::{Deserialize, Serialize};

use super::track_text::strip_track_ends;
use crate::tokens::vocab::{BAR_START, DENSITY, INST, PIECE_START, TRACK_END, TRACK_START};
use crate::tokens::Instrument;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PieceError {
    #[error("track {index} out of range (piece has {count} tracks)")]
    TrackOutOfRange { index: isize, count: usize },
}

/// One track of a piece with its generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    /// Auto-generated label, `track_<n>`.
    pub label: String,
    pub instrument: Instrument,
    pub density: u8,
    /// Sampling temperature used for this track.
    pub temperature: f32,
    /// `TRACK_START INST=<i> DENSITY=<d> ` and anything the model put
    /// before the first bar.
    pub header: String,
    /// Bar texts, each `BAR_START ... BAR_END `.
    pub bars: Vec<String>,
}

impl TrackState {
    fn new(label: String, instrument: Instrument, density: u8, temperature: f32) -> Self {
        Self {
            label,
            instrument,
            density,
            temperature,
            header: track_header(instrument, density),
            bars: Vec::new(),
        }
    }

    /// Number of bars, not counting the header.
    pub fn bar_count(&self) -> usize {
        self.bars.len()
    }

    /// Header plus bars plus `TRACK_END`.
    pub fn text(&self) -> String {
        let mut text = self.header.clone();
        for bar in &self.bars {
            text.push_str(bar);
        }
        text.push_str(TRACK_END);
        text.push(' ');
        text
    }
}

/// Builds the header token text for a new track.
pub fn track_header(instrument: Instrument, density: u8) -> String {
    format!("{TRACK_START} {INST}={instrument} {DENSITY}={density} ")
}

/// Per-track bar state for one generation session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    tracks: Vec<TrackState>,
    /// Labels are never reused, even after a deletion.
    #[serde(default)]
    next_label: usize,
}

impl Piece {
    /// Creates an empty piece.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a piece from saved track states.
    ///
    /// New labels continue after the highest saved `track_<n>`.
    pub fn from_tracks(tracks: Vec<TrackState>) -> Self {
        let next_label = tracks
            .iter()
            .filter_map(|track| track.label.strip_prefix("track_")?.parse::<usize>().ok())
            .map(|n| n + 1)
            .max()
            .unwrap_or(0)
            .max(tracks.len());
        Self { tracks, next_label }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[TrackState] {
        &self.tracks
    }

    /// Resolves a track index, where negative values count from the end.
    ///
    /// # Errors
    ///
    /// Returns `PieceError::TrackOutOfRange` if no track sits at `index`
    pub fn resolve(&self, index: isize) -> Result<usize, PieceError> {
        let count = self.tracks.len();
        let resolved = if index < 0 {
            count.checked_sub(index.unsigned_abs())
        } else {
            Some(index.unsigned_abs()).filter(|i| *i < count)
        };
        resolved.ok_or(PieceError::TrackOutOfRange { index, count })
    }

    pub fn track(&self, index: isize) -> Result<&TrackState, PieceError> {
        let index = self.resolve(index)?;
        Ok(&self.tracks[index])
    }

    fn track_mut(&mut self, index: isize) -> Result<&mut TrackState, PieceError> {
        let index = self.resolve(index)?;
        Ok(&mut self.tracks[index])
    }

    /// Appends an empty track and returns its position.
    pub fn init_track(&mut self, instrument: Instrument, density: u8, temperature: f32) -> usize {
        let label = format!("track_{}", self.next_label);
        self.next_label += 1;
        self.tracks
            .push(TrackState::new(label, instrument, density, temperature));
        self.tracks.len() - 1
    }

    /// Appends the bars found in `bar_text` to a track.
    ///
    /// Trailing `TRACK_END` tokens are stripped and the text is split on
    /// `BAR_START`. A fragment carrying `TRACK_START` replaces the track
    /// header; every other non-empty fragment becomes a bar.
    ///
    /// Returns the number of bars added.
    ///
    /// # Errors
    ///
    /// Returns `PieceError::TrackOutOfRange` for an unknown track
    pub fn add_bars_to_track(&mut self, index: isize, bar_text: &str) -> Result<usize, PieceError> {
        let track = self.track_mut(index)?;
        let stripped = strip_track_ends(bar_text);
        let marker = format!("{BAR_START} ");
        let mut added = 0;

        for fragment in stripped.split(marker.as_str()) {
            if fragment.trim().is_empty() {
                continue;
            }
            if let Some(at) = fragment.find(TRACK_START) {
                track.header = fragment[at..].to_string();
            } else {
                track.bars.push(format!("{marker}{fragment}"));
                added += 1;
            }
        }
        Ok(added)
    }

    /// Removes a track by position and returns it.
    ///
    /// # Errors
    ///
    /// Returns `PieceError::TrackOutOfRange` for an unknown track
    pub fn delete_track(&mut self, index: isize) -> Result<TrackState, PieceError> {
        let index = self.resolve(index)?;
        Ok(self.tracks.remove(index))
    }

    pub fn set_track_temperature(
        &mut self,
        index: isize,
        temperature: f32,
    ) -> Result<(), PieceError> {
        self.track_mut(index)?.temperature = temperature;
        Ok(())
    }

    /// Returns one track's text, ending in `TRACK_END`.
    ///
    /// # Errors
    ///
    /// Returns `PieceError::TrackOutOfRange` for an unknown track
    pub fn build_track_text(&self, index: isize) -> Result<String, PieceError> {
        Ok(self.track(index)?.text())
    }

    /// Returns `PIECE_START` followed by every track in order.
    pub fn build_piece_text(&self) -> String {
        let mut text = format!("{PIECE_START} ");
        for track in &self.tracks {
            text.push_str(&track.text());
        }
        text
    }
}
