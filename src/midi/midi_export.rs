//! Standard MIDI File (SMF) export.
//!
//! Writes SMF Format 1 with:
//! - Track 0: tempo and time signature meta events
//! - Tracks 1-N: one track per decoded instrument, with a program change
//!   (melodic tracks only) followed by the notes
//!
//! Velocity, track volume and pan are not carried by the token grammar, so
//! exported notes use whatever velocity the decoder synthesized.

use super::{Track, TICKS_PER_BEAT};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Global settings written to the conductor track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSettings {
    pub tempo_bpm: u32,
    pub beats_per_bar: u8,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            tempo_bpm: super::DEFAULT_TEMPO,
            beats_per_bar: 4,
        }
    }
}

/// Writes a variable-length quantity (VLQ) used for delta times and lengths.
///
/// Seven bits per byte, most significant group first; every byte but the
/// last has its high bit set.
fn write_vlq(value: u32, buffer: &mut Vec<u8>) {
    let mut groups = [0u8; 5];
    let mut count = 0;
    let mut rest = value;
    loop {
        groups[count] = (rest & 0x7F) as u8;
        count += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        let continuation = if i > 0 { 0x80 } else { 0x00 };
        buffer.push(groups[i] | continuation);
    }
}

/// Channel and meta messages emitted by the exporter.
enum MidiEvent {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// Microseconds per quarter note
    SetTempo(u32),
    /// Numerator over a quarter-note denominator
    TimeSignature(u8),
    TrackName(String),
    EndOfTrack,
}

impl MidiEvent {
    /// Appends the message bytes (without delta time).
    fn write(&self, buffer: &mut Vec<u8>) {
        match self {
            MidiEvent::NoteOn {
                channel,
                pitch,
                velocity,
            } => buffer.extend_from_slice(&[0x90 | (channel & 0x0F), *pitch, *velocity]),
            MidiEvent::NoteOff { channel, pitch } => {
                buffer.extend_from_slice(&[0x80 | (channel & 0x0F), *pitch, 0])
            }
            MidiEvent::ProgramChange { channel, program } => {
                buffer.extend_from_slice(&[0xC0 | (channel & 0x0F), *program])
            }
            MidiEvent::SetTempo(microseconds) => {
                let [_, a, b, c] = microseconds.to_be_bytes();
                buffer.extend_from_slice(&[0xFF, 0x51, 0x03, a, b, c]);
            }
            // FF 58 04 nn dd cc bb: denominator as a power of two (2 = quarter),
            // 24 MIDI clocks per click, 8 32nd-notes per quarter.
            MidiEvent::TimeSignature(numerator) => {
                buffer.extend_from_slice(&[0xFF, 0x58, 0x04, *numerator, 2, 24, 8])
            }
            MidiEvent::TrackName(name) => {
                buffer.extend_from_slice(&[0xFF, 0x03]);
                write_vlq(name.len() as u32, buffer);
                buffer.extend_from_slice(name.as_bytes());
            }
            MidiEvent::EndOfTrack => buffer.extend_from_slice(&[0xFF, 0x2F, 0x00]),
        }
    }
}

/// A message at an absolute tick. `priority` orders messages sharing a tick
/// (lower first).
struct TimedEvent {
    tick: u32,
    priority: u8,
    event: MidiEvent,
}

const PRIORITY_SETUP: u8 = 0;
const PRIORITY_NOTE_OFF: u8 = 10;
const PRIORITY_NOTE_ON: u8 = 11;
const PRIORITY_END: u8 = 255;

/// Sorts events and serializes them as an `MTrk` chunk.
fn write_track_chunk<W: Write>(writer: &mut W, mut events: Vec<TimedEvent>) -> std::io::Result<()> {
    events.sort_by_key(|e| (e.tick, e.priority));

    let mut data = Vec::new();
    let mut last_tick = 0u32;
    for timed in &events {
        write_vlq(timed.tick.saturating_sub(last_tick), &mut data);
        timed.event.write(&mut data);
        last_tick = timed.tick;
    }

    writer.write_all(b"MTrk")?;
    writer.write_all(&(data.len() as u32).to_be_bytes())?;
    writer.write_all(&data)
}

fn conductor_events(settings: ExportSettings, end_tick: u32) -> Vec<TimedEvent> {
    let tempo = settings.tempo_bpm.max(1);
    vec![
        TimedEvent {
            tick: 0,
            priority: PRIORITY_SETUP,
            event: MidiEvent::TimeSignature(settings.beats_per_bar.max(1)),
        },
        TimedEvent {
            tick: 0,
            priority: PRIORITY_SETUP + 1,
            event: MidiEvent::SetTempo(60_000_000 / tempo),
        },
        TimedEvent {
            tick: end_tick,
            priority: PRIORITY_END,
            event: MidiEvent::EndOfTrack,
        },
    ]
}

fn track_events(track: &Track) -> Vec<TimedEvent> {
    let channel = track.channel;
    let mut events = vec![TimedEvent {
        tick: 0,
        priority: PRIORITY_SETUP,
        event: MidiEvent::TrackName(track.name.clone()),
    }];
    if !track.is_drum() {
        events.push(TimedEvent {
            tick: 0,
            priority: PRIORITY_SETUP + 1,
            event: MidiEvent::ProgramChange {
                channel,
                program: track.program,
            },
        });
    }
    for note in track.notes() {
        events.push(TimedEvent {
            tick: note.start_tick,
            priority: PRIORITY_NOTE_ON,
            event: MidiEvent::NoteOn {
                channel,
                pitch: note.pitch,
                velocity: note.velocity,
            },
        });
        events.push(TimedEvent {
            tick: note.end_tick(),
            priority: PRIORITY_NOTE_OFF,
            event: MidiEvent::NoteOff {
                channel,
                pitch: note.pitch,
            },
        });
    }
    events.push(TimedEvent {
        tick: track.duration_ticks(),
        priority: PRIORITY_END,
        event: MidiEvent::EndOfTrack,
    });
    events
}

/// Writes tracks as a Format 1 Standard MIDI File.
///
/// # Arguments
///
/// * `tracks` - Tracks with channels and programs already assigned
/// * `settings` - Tempo and meter for the conductor track
/// * `writer` - Destination
///
/// # Errors
///
/// Returns any error from the writer
pub fn write_smf<W: Write>(
    tracks: &[Track],
    settings: ExportSettings,
    writer: &mut W,
) -> std::io::Result<()> {
    let num_tracks = (1 + tracks.len()).min(u16::MAX as usize) as u16;

    writer.write_all(b"MThd")?;
    writer.write_all(&6u32.to_be_bytes())?;
    writer.write_all(&1u16.to_be_bytes())?;
    writer.write_all(&num_tracks.to_be_bytes())?;
    writer.write_all(&(TICKS_PER_BEAT as u16).to_be_bytes())?;

    let end_tick = tracks.iter().map(Track::duration_ticks).max().unwrap_or(0);
    write_track_chunk(writer, conductor_events(settings, end_tick))?;
    for track in tracks {
        write_track_chunk(writer, track_events(track))?;
    }
    Ok(())
}

/// Exports tracks to a .mid file.
///
/// # Errors
///
/// Returns error if file creation or writing fails
pub fn export_to_midi<P: AsRef<Path>>(
    tracks: &[Track],
    settings: ExportSettings,
    path: P,
) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_smf(tracks, settings, &mut writer)?;
    writer.flush()
}
