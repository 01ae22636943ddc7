//! Event and duration types shared by the encoder, decoder and generator.
//!
//! An [`Event`] is a closed tagged variant: every kind fixes the shape of its
//! value at compile time. Structural ids (track, bar) are assigned by the
//! pipeline stage that owns them and are ignored when serializing to text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of coarse instrument families.
pub const FAMILY_COUNT: u8 = 16;

/// Highest density value the token grammar can express.
pub const MAX_DENSITY: u8 = 3;

/// Highest MIDI pitch.
pub const MAX_PITCH: u8 = 127;

/// Instrument carried by an `INST=` token.
///
/// Melodic instruments are always expressed as a family (0-15); drums are a
/// separate sentinel because they are routed to the percussion channel and
/// use their own quantization grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Instrument {
    /// Percussion track.
    Drums,
    /// Melodic instrument family number (0-15).
    Family(u8),
}

impl Instrument {
    /// Returns true for the percussion sentinel.
    pub fn is_drums(&self) -> bool {
        matches!(self, Instrument::Drums)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrument::Drums => write!(f, "DRUMS"),
            Instrument::Family(family) => write!(f, "{}", family),
        }
    }
}

/// Error returned when an instrument string is neither `DRUMS` nor a family.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid instrument '{0}': expected DRUMS or a family number 0-15")]
pub struct InvalidInstrument(pub String);

impl FromStr for Instrument {
    type Err = InvalidInstrument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("drums") {
            return Ok(Instrument::Drums);
        }
        match s.parse::<u8>() {
            Ok(family) if family < FAMILY_COUNT => Ok(Instrument::Family(family)),
            _ => Err(InvalidInstrument(s.to_string())),
        }
    }
}

impl TryFrom<String> for Instrument {
    type Error = InvalidInstrument;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Instrument> for String {
    fn from(instrument: Instrument) -> Self {
        instrument.to_string()
    }
}

/// A quantized beat length.
///
/// The triple `(beats, numerator, denominator)` reads as
/// `beats + numerator / denominator` beats, where the denominator is the
/// quantization grid of the owning instrument (ticks per beat). The tick
/// encoding is `beats * denominator + numerator`, so the two encodings
/// interconvert exactly as long as `numerator < denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Duration {
    /// Whole beats.
    pub beats: u32,
    /// Fractional part, in grid steps.
    pub numerator: u32,
    /// Grid steps per beat.
    pub denominator: u32,
}

impl Duration {
    /// Builds a duration from a tick count on a `ticks_per_beat` grid.
    pub fn from_ticks(ticks: u32, ticks_per_beat: u32) -> Self {
        let ticks_per_beat = ticks_per_beat.max(1);
        Self {
            beats: ticks / ticks_per_beat,
            numerator: ticks % ticks_per_beat,
            denominator: ticks_per_beat,
        }
    }

    /// The smallest representable duration: one grid step.
    pub fn unit(ticks_per_beat: u32) -> Self {
        Self::from_ticks(1, ticks_per_beat)
    }

    /// Returns the tick count on this duration's grid.
    pub fn to_ticks(&self) -> u32 {
        self.beats
            .saturating_mul(self.denominator)
            .saturating_add(self.numerator)
    }

    /// Returns the length in steps of another grid, rounding the fractional
    /// part down.
    pub fn rescaled_ticks(&self, ticks_per_beat: u32) -> u32 {
        if self.denominator == ticks_per_beat {
            return self.to_ticks();
        }
        let fraction = u64::from(self.numerator) * u64::from(ticks_per_beat)
            / u64::from(self.denominator.max(1));
        self.beats
            .saturating_mul(ticks_per_beat)
            .saturating_add(fraction as u32)
    }

    /// Returns the length in beats, for display and logging.
    pub fn as_beats(&self) -> f64 {
        self.beats as f64 + self.numerator as f64 / self.denominator.max(1) as f64
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.beats, self.numerator, self.denominator)
    }
}

/// A single musical or structural event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    PieceStart,
    TrackStart(u32),
    TrackEnd(u32),
    Instrument(Instrument),
    /// Section density (0-3).
    Density(u8),
    BarStart(u32),
    BarEnd(u32),
    /// Per-bar density marker. Only lives inside the encoder pipeline; it has
    /// no token form.
    BarDensity(u32),
    TimeShift(Duration),
    NoteOn(u8),
    NoteOff(u8),
    /// Note amplitude. Stripped by the encoder and synthesized by the decoder;
    /// it has no token form.
    Velocity(u8),
}

impl Event {
    pub fn is_time_shift(&self) -> bool {
        matches!(self, Event::TimeShift(_))
    }

    pub fn is_note_off(&self) -> bool {
        matches!(self, Event::NoteOff(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_round_trip() {
        for ticks_per_beat in [4, 8] {
            for beats in 0..6 {
                for numerator in 0..ticks_per_beat {
                    let duration = Duration {
                        beats,
                        numerator,
                        denominator: ticks_per_beat,
                    };
                    let ticks = duration.to_ticks();
                    assert_eq!(Duration::from_ticks(ticks, ticks_per_beat), duration);
                }
            }
        }
    }

    #[test]
    fn test_duration_from_ticks() {
        let duration = Duration::from_ticks(13, 8);
        assert_eq!(duration.beats, 1);
        assert_eq!(duration.numerator, 5);
        assert_eq!(duration.denominator, 8);
        assert!((duration.as_beats() - 1.625).abs() < f64::EPSILON);
        assert_eq!(duration.to_string(), "1.5.8");
    }

    #[test]
    fn test_rescaled_ticks() {
        let drums = Duration::from_ticks(6, 4);
        assert_eq!(drums.rescaled_ticks(4), 6);
        assert_eq!(drums.rescaled_ticks(8), 12);
        assert_eq!(drums.rescaled_ticks(480), 720);
        assert_eq!(Duration::from_ticks(3, 8).rescaled_ticks(4), 1);
    }

    #[test]
    fn test_instrument_parsing() {
        assert_eq!("DRUMS".parse::<Instrument>(), Ok(Instrument::Drums));
        assert_eq!("Drums".parse::<Instrument>(), Ok(Instrument::Drums));
        assert_eq!("15".parse::<Instrument>(), Ok(Instrument::Family(15)));
        assert!("16".parse::<Instrument>().is_err());
        assert!("piano".parse::<Instrument>().is_err());
    }

    #[test]
    fn test_instrument_serde_as_string() {
        let json = serde_json::to_string(&Instrument::Family(4)).unwrap();
        assert_eq!(json, "\"4\"");
        let drums: Instrument = serde_json::from_str("\"DRUMS\"").unwrap();
        assert_eq!(drums, Instrument::Drums);
    }
}
