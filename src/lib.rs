//! jamtext - MIDI to text-token codec and bar-exact generation orchestrator.
//!
//! The library converts Standard MIDI Files into a line of whitespace
//! separated tokens a sequence model can learn from, turns generated token
//! text back into MIDI, and drives such a model track by track and bar by
//! bar while keeping every track's bar count exact.

pub mod batch;
pub mod codec;
pub mod config;
pub mod generation;
pub mod midi;
pub mod tokens;

// Re-export commonly used types
pub use codec::{DecodedPiece, MidiEncoder, TextDecoder};
pub use config::{CodecConfig, Config, GenerationConfig};
pub use generation::{CompletionOracle, Generator, Piece, TrackConfig};
pub use tokens::{Event, Instrument};
