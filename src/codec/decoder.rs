//! Text to MIDI decoding.
//!
//! Token text from the model is noisy: bars can be short, overfull, or hold
//! stray tokens. Decoding never fails on content. Unknown words are skipped,
//! time beyond a bar's budget is dropped, and short bars are padded, all
//! with a log line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::CodecConfig;
use crate::midi::{
    melodic_channel, write_smf, ExportSettings, Note, Track, DRUM_CHANNEL, TICKS_PER_BEAT,
};
use crate::tokens::family::FAMILIES;
use crate::tokens::{parse_token, Duration, Event, FamilyError, FamilyMapper, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid session file {path}: {source}")]
    Session {
        path: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Family(#[from] FamilyError),

    #[error("failed to write MIDI: {0}")]
    Write(#[from] std::io::Error),
}

/// One decoded instrument track, ready for MIDI emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTrack {
    pub instrument: Instrument,
    /// Concrete General MIDI program. Always 0 for drums.
    pub program: u8,
    pub is_drum: bool,
    /// Grid of the `TimeShift` events below.
    pub ticks_per_beat: u32,
    /// Note, velocity and time-shift events only.
    pub events: Vec<Event>,
}

impl DecodedTrack {
    /// Replays the events into timed notes at the internal MIDI resolution.
    ///
    /// A `NoteOn` takes the velocity of the `Velocity` event that follows it.
    /// Notes still sounding at the end are closed there, or one grid step
    /// after they start if no time has passed.
    pub fn to_midi_track(&self, name: impl Into<String>, channel: u8) -> Track {
        let mut track = Track::new(name, channel);
        track.program = self.program;

        let step = TICKS_PER_BEAT / self.ticks_per_beat.max(1);
        let mut now = 0u32;
        let mut active: HashMap<u8, (u32, u8)> = HashMap::new();
        let mut last_on: Option<u8> = None;

        for event in &self.events {
            match *event {
                Event::TimeShift(duration) => {
                    now = now.saturating_add(duration.rescaled_ticks(TICKS_PER_BEAT));
                    last_on = None;
                }
                Event::NoteOn(pitch) => {
                    // A retrigger closes the previous note of the same pitch.
                    if let Some((start, velocity)) = active.remove(&pitch) {
                        if now > start {
                            track.add_note(Note::new(pitch, velocity, start, now - start));
                        }
                    }
                    active.insert(pitch, (now, 0));
                    last_on = Some(pitch);
                }
                Event::Velocity(velocity) => {
                    if let Some(entry) = last_on.and_then(|pitch| active.get_mut(&pitch)) {
                        entry.1 = velocity;
                    }
                }
                Event::NoteOff(pitch) => {
                    if let Some((start, velocity)) = active.remove(&pitch) {
                        track.add_note(Note::new(pitch, velocity, start, (now - start).max(step)));
                    }
                }
                _ => {}
            }
        }
        let mut remaining: Vec<_> = active.into_iter().collect();
        remaining.sort_unstable();
        for (pitch, (start, velocity)) in remaining {
            track.add_note(Note::new(pitch, velocity, start, (now - start).max(step)));
        }
        track
    }
}

/// The decoder's output: one entry per `TRACK_START ... TRACK_END` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedPiece {
    pub tracks: Vec<DecodedTrack>,
}

impl DecodedPiece {
    /// `(program, is_drum)` per track, in order.
    pub fn instruments(&self) -> Vec<(u8, bool)> {
        self.tracks.iter().map(|t| (t.program, t.is_drum)).collect()
    }

    /// Builds MIDI tracks: drums on the percussion channel, melodic tracks on
    /// successive other channels.
    pub fn to_midi_tracks(&self) -> Vec<Track> {
        let mut melodic = 0;
        self.tracks
            .iter()
            .enumerate()
            .map(|(index, decoded)| {
                let channel = if decoded.is_drum {
                    DRUM_CHANNEL
                } else {
                    melodic += 1;
                    melodic_channel(melodic - 1)
                };
                let family_name = match decoded.instrument {
                    Instrument::Drums => "Drums",
                    Instrument::Family(family) => FAMILIES
                        .get(usize::from(family))
                        .map_or("Instrument", |f| f.name),
                };
                decoded.to_midi_track(format!("{} {}", family_name, index + 1), channel)
            })
            .collect()
    }

    /// Writes the piece as a Standard MIDI File to any writer.
    pub fn write_smf<W: Write>(
        &self,
        settings: ExportSettings,
        writer: &mut W,
    ) -> Result<(), DecodeError> {
        write_smf(&self.to_midi_tracks(), settings, writer)?;
        Ok(())
    }

    /// Writes the piece as a .mid file.
    ///
    /// # Errors
    ///
    /// Returns error if file creation or writing fails
    pub fn write_midi<P: AsRef<Path>>(
        &self,
        settings: ExportSettings,
        path: P,
    ) -> Result<(), DecodeError> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_smf(settings, &mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), tracks = self.tracks.len(), "midi file written");
        Ok(())
    }
}

/// Events of one track between grouping and instrument resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentTrack {
    pub instrument: Option<Instrument>,
    pub events: Vec<Event>,
}

/// Session files carry the piece text under `generated_midi`.
#[derive(Deserialize)]
struct SessionText {
    generated_midi: String,
}

/// Turns token text back into per-instrument events and MIDI.
#[derive(Debug, Clone)]
pub struct TextDecoder {
    config: CodecConfig,
    rng: ChaCha8Rng,
}

impl TextDecoder {
    /// Creates a decoder seeded from `config.seed`, or from entropy when unset.
    pub fn new(config: CodecConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Creates a decoder with a fixed seed for the family choice.
    pub fn with_seed(config: CodecConfig, seed: u64) -> Self {
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Runs the full decode pipeline.
    ///
    /// The family to program table is drawn once per call, so every track
    /// of a family gets the same program within one piece.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::Family` if a family has no program in the table
    pub fn decode(&mut self, text: &str) -> Result<DecodedPiece, DecodeError> {
        let mut events = text_to_events(text, &self.config);
        assign_track_ids(&mut events);
        check_for_duplicated_events(&events);

        let mapper = FamilyMapper::new(self.config.reverse_mode, &mut self.rng);
        debug!(mode = ?mapper.mode(), "family programs chosen");
        let mut tracks = Vec::new();
        for (index, group) in piece_to_inst_events(events).into_iter().enumerate() {
            let instrument = group.instrument.unwrap_or_else(|| {
                warn!(track = index, "track has no valid instrument, using family 0");
                Instrument::Family(0)
            });
            let ticks_per_beat = self.config.ticks_per_beat(instrument);

            let mut events = group.events;
            set_bar_ids(&mut events);
            let events = add_missing_timeshifts(events, &self.config, instrument, index);
            let events = remove_unwanted_tokens(events);
            let events = aggregate_timeshifts(events, ticks_per_beat);
            let events = add_velocity(events, self.config.velocity);

            let (program, is_drum) = match instrument {
                Instrument::Drums => (0, true),
                Instrument::Family(family) => (mapper.program_of(family)?, false),
            };
            tracks.push(DecodedTrack {
                instrument,
                program,
                is_drum,
                ticks_per_beat,
                events,
            });
        }
        info!(tracks = tracks.len(), "decoded piece");
        Ok(DecodedPiece { tracks })
    }

    /// Decodes a file holding either raw token text or a session JSON.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or the JSON is malformed
    pub fn decode_file<P: AsRef<Path>>(&mut self, path: P) -> Result<DecodedPiece, DecodeError> {
        let text = read_piece_text(path.as_ref())?;
        self.decode(&text)
    }
}

/// Reads piece text from a raw token file or a session JSON file.
pub fn read_piece_text(path: &Path) -> Result<String, DecodeError> {
    let display = path.display().to_string();
    let contents = std::fs::read_to_string(path).map_err(|source| DecodeError::Read {
        path: display.clone(),
        source,
    })?;
    if contents.trim_start().starts_with('{') {
        let session: SessionText =
            serde_json::from_str(&contents).map_err(|source| DecodeError::Session {
                path: display,
                source,
            })?;
        Ok(session.generated_midi)
    } else {
        Ok(contents)
    }
}

/// Scans words left to right into events.
///
/// Tracks the current instrument so `TIME_DELTA` is read on its grid, and
/// the time used in the current bar. A `TIME_DELTA` that would push the bar
/// past one full bar is dropped, as is a `NOTE_ON` once the bar is full.
/// Before the first `INST=` the budget is zero.
pub fn text_to_events(text: &str, config: &CodecConfig) -> Vec<Event> {
    let mut events = Vec::new();
    let mut instrument = Instrument::Drums;
    let mut track_index: i64 = -1;
    let mut bar = 0u32;
    let mut used = 0u32;
    let mut budget = 0u32;

    for word in text.split_whitespace() {
        let Some(event) = parse_token(word, config.ticks_per_beat(instrument)) else {
            debug!(word, "skipping unknown token");
            continue;
        };
        let mut over_budget = false;
        match event {
            Event::Instrument(inst) => {
                instrument = inst;
                track_index += 1;
                bar = 0;
                budget = config.bar_ticks(inst);
            }
            Event::BarStart(_) => {
                bar += 1;
                used = 0;
            }
            Event::TimeShift(duration) => {
                let ticks = duration.to_ticks();
                match used.checked_add(ticks).filter(|&total| total <= budget) {
                    Some(total) => used = total,
                    None => over_budget = true,
                }
            }
            Event::NoteOn(_) => over_budget = used >= budget,
            Event::BarEnd(_) => {
                debug!(track = track_index, %instrument, bar, used, "bar closed");
                used = 0;
            }
            _ => {}
        }
        if over_budget {
            warn!(
                track = track_index,
                %instrument,
                bar,
                word,
                "skipping event beyond the bar's quantization budget"
            );
            continue;
        }
        let event = match event {
            Event::BarStart(_) => Event::BarStart(bar),
            other => other,
        };
        events.push(event);
    }
    events
}

/// Numbers `TrackStart`/`TrackEnd` pairs sequentially.
///
/// A `TrackEnd` shares the id of the open track and closes it.
pub fn assign_track_ids(events: &mut [Event]) {
    let mut track_id = 0;
    for event in events.iter_mut() {
        match event {
            Event::TrackStart(id) => *id = track_id,
            Event::TrackEnd(id) => {
                *id = track_id;
                track_id += 1;
            }
            _ => {}
        }
    }
}

/// Logs every pair of consecutive identical events and returns how many
/// there were. Duplicates are kept.
pub fn check_for_duplicated_events(events: &[Event]) -> usize {
    let mut count = 0;
    for (index, pair) in events.windows(2).enumerate() {
        if pair[0] == pair[1] {
            warn!(index, event = ?pair[0], "duplicate event");
            count += 1;
        }
    }
    count
}

/// Groups the event stream by track.
///
/// Each `TrackStart` with a new id opens a group; every following event
/// lands in it until the next one. Events before the first `TrackStart` are
/// dropped.
pub fn piece_to_inst_events(events: Vec<Event>) -> Vec<InstrumentTrack> {
    let mut tracks: Vec<InstrumentTrack> = Vec::new();
    let mut current: Option<usize> = None;
    for event in events {
        if let Event::TrackStart(id) = event {
            let id = id as usize;
            if id == tracks.len() {
                tracks.push(InstrumentTrack {
                    instrument: None,
                    events: Vec::new(),
                });
            }
            current = tracks.len().checked_sub(1).map(|last| id.min(last));
        }
        let Some(index) = current else {
            continue;
        };
        let track = &mut tracks[index];
        if let Event::Instrument(instrument) = event {
            track.instrument = Some(instrument);
        }
        track.events.push(event);
    }
    tracks
}

/// Numbers bars within a track from 0.
pub fn set_bar_ids(events: &mut [Event]) {
    let mut bar = 0;
    for event in events.iter_mut() {
        match event {
            Event::BarStart(id) => *id = bar,
            Event::BarEnd(id) => {
                *id = bar;
                bar += 1;
            }
            _ => {}
        }
    }
}

/// Pads every short bar with a rest up to one full bar.
///
/// The rest is inserted just before `BarEnd`. Overfull bars are logged and
/// left alone.
pub fn add_missing_timeshifts(
    events: Vec<Event>,
    config: &CodecConfig,
    instrument: Instrument,
    track: usize,
) -> Vec<Event> {
    let ticks_per_beat = config.ticks_per_beat(instrument);
    let bar_ticks = config.bar_ticks(instrument);
    let mut out = Vec::with_capacity(events.len() + 8);
    let mut used: u32 = 0;

    for event in events {
        match event {
            Event::BarStart(_) => used = 0,
            Event::TimeShift(duration) => {
                used = used.saturating_add(duration.rescaled_ticks(ticks_per_beat));
            }
            Event::BarEnd(bar) => {
                if used < bar_ticks {
                    let deficit = bar_ticks - used;
                    out.push(Event::TimeShift(Duration::from_ticks(deficit, ticks_per_beat)));
                    used += deficit;
                }
                debug!(track, %instrument, bar, used, "bar length");
                if used > bar_ticks {
                    let beats = Duration::from_ticks(used, ticks_per_beat).as_beats();
                    warn!(track, %instrument, bar, beats, "beat count exceeded");
                }
            }
            _ => {}
        }
        out.push(event);
    }
    out
}

/// Drops every event with no MIDI meaning.
pub fn remove_unwanted_tokens(events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                Event::TimeShift(_) | Event::NoteOn(_) | Event::NoteOff(_) | Event::Velocity(_)
            )
        })
        .collect()
}

/// Merges consecutive time shifts. The result may span several bars.
pub fn aggregate_timeshifts(events: Vec<Event>, ticks_per_beat: u32) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::with_capacity(events.len());
    for event in events {
        if let (Event::TimeShift(next), Some(Event::TimeShift(previous))) = (event, out.last_mut())
        {
            let total = previous
                .rescaled_ticks(ticks_per_beat)
                .saturating_add(next.rescaled_ticks(ticks_per_beat));
            *previous = Duration::from_ticks(total, ticks_per_beat);
            continue;
        }
        out.push(event);
    }
    out
}

/// Follows every `NoteOn` with a fixed `Velocity`.
pub fn add_velocity(events: Vec<Event>, velocity: u8) -> Vec<Event> {
    let mut out = Vec::with_capacity(events.len() + events.len() / 2);
    for event in events {
        out.push(event);
        if let Event::NoteOn(_) = event {
            out.push(Event::Velocity(velocity));
        }
    }
    out
}
