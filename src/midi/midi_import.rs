//! Standard MIDI File (SMF) import.
//!
//! Reads .mid and .midi files into per-channel [`Track`]s at the internal
//! resolution. Supports SMF Format 0 (single track) and Format 1
//! (multi-track) files.
//!
//! # Limitations
//!
//! - Only note on/off and program change events are read
//! - Tempo and time signature are ignored; the encoder works in beats
//! - Other MIDI events (controllers, pitch bend, aftertouch, etc.) are ignored

use super::{Note, Track, TICKS_PER_BEAT};
use midly::{Format, Smf, Timing, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Errors that can occur during MIDI import.
#[derive(Debug, thiserror::Error)]
pub enum MidiImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MIDI parse error: {0}")]
    Parse(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Notes waiting for their note-off. Key is pitch, value is (start_tick, velocity).
type ActiveNotes = HashMap<u8, (u32, u8)>;

/// Imports a MIDI file.
///
/// # Arguments
///
/// * `path` - Path to the .mid or .midi file
///
/// # Returns
///
/// One track per (SMF track, channel) that carries at least one note, in
/// file order
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed, or uses an
/// unsupported format
pub fn import_from_midi<P: AsRef<Path>>(path: P) -> Result<Vec<Track>, MidiImportError> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let tracks = import_from_bytes(&data)?;
    debug!(path = %path.display(), tracks = tracks.len(), "imported MIDI file");
    Ok(tracks)
}

/// Imports an in-memory Standard MIDI File.
///
/// # Errors
///
/// Returns error if the data cannot be parsed or uses an unsupported format
pub fn import_from_bytes(data: &[u8]) -> Result<Vec<Track>, MidiImportError> {
    let smf = Smf::parse(data).map_err(|e| MidiImportError::Parse(e.to_string()))?;

    let source_ticks_per_beat = match smf.header.timing {
        Timing::Metrical(tpb) => u32::from(tpb.as_int()).max(1),
        Timing::Timecode(_, _) => {
            return Err(MidiImportError::UnsupportedFormat(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };

    if smf.header.format == Format::Sequential {
        return Err(MidiImportError::UnsupportedFormat(
            "Format 2 (sequential) MIDI files not supported".to_string(),
        ));
    }

    let mut tracks = Vec::new();
    for (track_idx, track) in smf.tracks.iter().enumerate() {
        tracks.extend(parse_track(track, track_idx, source_ticks_per_beat));
    }
    Ok(tracks)
}

/// Splits one SMF track into per-channel tracks that contain notes.
fn parse_track(
    track: &[midly::TrackEvent],
    track_idx: usize,
    source_ticks_per_beat: u32,
) -> Vec<Track> {
    let mut channel_tracks: HashMap<u8, Track> = HashMap::new();
    let mut active_notes: HashMap<u8, ActiveNotes> = HashMap::new();
    let mut track_name: Option<String> = None;

    // Absolute position, accumulated in source ticks so rescaling never drifts.
    let mut source_tick: u64 = 0;

    for event in track {
        source_tick += u64::from(event.delta.as_int());
        let current_tick = scale_ticks(source_tick, source_ticks_per_beat);

        match event.kind {
            TrackEventKind::Meta(midly::MetaMessage::TrackName(name_bytes)) => {
                if let Ok(name) = std::str::from_utf8(name_bytes) {
                    track_name = Some(name.trim().to_string());
                }
            }
            TrackEventKind::Midi { channel, message } => {
                let ch = channel.as_int();
                let track = channel_tracks.entry(ch).or_insert_with(|| {
                    let name = track_name
                        .clone()
                        .filter(|name| !name.is_empty())
                        .unwrap_or_else(|| format!("Track {}", track_idx + 1));
                    Track::new(name, ch)
                });
                let active = active_notes.entry(ch).or_default();

                match message {
                    midly::MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        active.insert(key.as_int(), (current_tick, vel.as_int()));
                    }
                    // Note on with velocity 0 = note off
                    midly::MidiMessage::NoteOn { key, .. }
                    | midly::MidiMessage::NoteOff { key, .. } => {
                        let pitch = key.as_int();
                        if let Some((start_tick, velocity)) = active.remove(&pitch) {
                            let duration = current_tick.saturating_sub(start_tick).max(1);
                            track.add_note(Note::new(pitch, velocity, start_tick, duration));
                        }
                    }
                    midly::MidiMessage::ProgramChange { program } => {
                        track.program = program.as_int();
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    // Close any remaining active notes (in case MIDI file is incomplete)
    for (ch, notes) in active_notes {
        if let Some(track) = channel_tracks.get_mut(&ch) {
            for (pitch, (start_tick, velocity)) in notes {
                track.add_note(Note::new(pitch, velocity, start_tick, TICKS_PER_BEAT));
            }
        }
    }

    let mut tracks: Vec<Track> = channel_tracks
        .into_values()
        .filter(|t| !t.notes().is_empty())
        .collect();
    tracks.sort_by_key(|t| t.channel);
    tracks
}

/// Scales ticks from source resolution to our internal resolution (TICKS_PER_BEAT).
fn scale_ticks(source_ticks: u64, source_tpb: u32) -> u32 {
    let scaled = source_ticks * u64::from(TICKS_PER_BEAT) / u64::from(source_tpb.max(1));
    u32::try_from(scaled).unwrap_or(u32::MAX)
}
