//! The text token grammar.
//!
//! Tokens are space-delimited words, each written with a trailing space:
//!
//! ```text
//! PIECE_START TRACK_START INST=3 DENSITY=2 BAR_START NOTE_ON=64 TIME_DELTA=8 NOTE_OFF=64 BAR_END TRACK_END
//! ```
//!
//! Parsing never fails as a whole: a word that is not a legal token maps to
//! `None` and is skipped by callers.

use super::event::{Duration, Event, Instrument, FAMILY_COUNT, MAX_DENSITY, MAX_PITCH};
use crate::config::CodecConfig;
use std::collections::BTreeSet;

pub const PIECE_START: &str = "PIECE_START";
pub const TRACK_START: &str = "TRACK_START";
pub const TRACK_END: &str = "TRACK_END";
pub const BAR_START: &str = "BAR_START";
pub const BAR_END: &str = "BAR_END";
pub const INST: &str = "INST";
pub const DENSITY: &str = "DENSITY";
pub const TIME_DELTA: &str = "TIME_DELTA";
pub const NOTE_ON: &str = "NOTE_ON";
pub const NOTE_OFF: &str = "NOTE_OFF";

/// Splits a word into its kind and optional `=value` part.
pub fn split_token(word: &str) -> (&str, Option<&str>) {
    match word.split_once('=') {
        Some((kind, value)) => (kind, Some(value)),
        None => (word, None),
    }
}

/// Parses one word into an event.
///
/// `ticks_per_beat` is the quantization grid of the instrument currently in
/// scope; it is only used to turn `TIME_DELTA` ticks into a [`Duration`].
/// Structural ids are left at zero for the caller to assign.
///
/// # Returns
///
/// `None` for unknown kinds, missing or malformed values, and values outside
/// the kind's domain.
pub fn parse_token(word: &str, ticks_per_beat: u32) -> Option<Event> {
    let (kind, value) = split_token(word);
    match (kind, value) {
        (PIECE_START, None) => Some(Event::PieceStart),
        (TRACK_START, None) => Some(Event::TrackStart(0)),
        (TRACK_END, None) => Some(Event::TrackEnd(0)),
        (BAR_START, None) => Some(Event::BarStart(0)),
        (BAR_END, None) => Some(Event::BarEnd(0)),
        (INST, Some(value)) => value.parse::<Instrument>().ok().map(Event::Instrument),
        (DENSITY, Some(value)) => value
            .parse::<u8>()
            .ok()
            .filter(|density| *density <= MAX_DENSITY)
            .map(Event::Density),
        (TIME_DELTA, Some(value)) => value
            .parse::<u32>()
            .ok()
            .map(|ticks| Event::TimeShift(Duration::from_ticks(ticks, ticks_per_beat))),
        (NOTE_ON, Some(value)) => parse_pitch(value).map(Event::NoteOn),
        (NOTE_OFF, Some(value)) => parse_pitch(value).map(Event::NoteOff),
        _ => None,
    }
}

fn parse_pitch(value: &str) -> Option<u8> {
    value.parse::<u8>().ok().filter(|pitch| *pitch <= MAX_PITCH)
}

/// Returns the literal token for an event, without the trailing space.
///
/// Encoder-internal markers (`BarDensity`) and `Velocity` have no text form.
pub fn token_text(event: &Event) -> Option<String> {
    let text = match event {
        Event::PieceStart => PIECE_START.to_string(),
        Event::TrackStart(_) => TRACK_START.to_string(),
        Event::TrackEnd(_) => TRACK_END.to_string(),
        Event::Instrument(instrument) => format!("{}={}", INST, instrument),
        Event::Density(density) => format!("{}={}", DENSITY, density),
        Event::BarStart(_) => BAR_START.to_string(),
        Event::BarEnd(_) => BAR_END.to_string(),
        Event::TimeShift(duration) => format!("{}={}", TIME_DELTA, duration.to_ticks()),
        Event::NoteOn(pitch) => format!("{}={}", NOTE_ON, pitch),
        Event::NoteOff(pitch) => format!("{}={}", NOTE_OFF, pitch),
        Event::BarDensity(_) | Event::Velocity(_) => return None,
    };
    Some(text)
}

/// Serializes events to token text, one trailing space per token.
pub fn events_to_text(events: &[Event]) -> String {
    let mut text = String::new();
    for event in events {
        if let Some(token) = token_text(event) {
            text.push_str(&token);
            text.push(' ');
        }
    }
    text
}

/// Number of tokens in a text.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Enumerates every token the grammar can produce under `config`.
///
/// `TIME_DELTA` values run from 1 to one bar on the finest grid in use.
pub fn full_vocabulary(config: &CodecConfig) -> BTreeSet<String> {
    let mut vocab: BTreeSet<String> = [PIECE_START, TRACK_START, TRACK_END, BAR_START, BAR_END]
        .iter()
        .map(|token| token.to_string())
        .collect();

    vocab.insert(format!("{}={}", INST, Instrument::Drums));
    for family in 0..FAMILY_COUNT {
        vocab.insert(format!("{}={}", INST, family));
    }
    for density in 0..=MAX_DENSITY {
        vocab.insert(format!("{}={}", DENSITY, density));
    }
    for pitch in 0..=MAX_PITCH {
        vocab.insert(format!("{}={}", NOTE_ON, pitch));
        vocab.insert(format!("{}={}", NOTE_OFF, pitch));
    }
    let finest = config
        .drum_ticks_per_beat
        .max(config.melodic_ticks_per_beat);
    for ticks in 1..=finest * config.beats_per_bar {
        vocab.insert(format!("{}={}", TIME_DELTA, ticks));
    }
    vocab
}
