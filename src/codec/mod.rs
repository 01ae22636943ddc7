//! The MIDI to text codec.

pub mod decoder;
pub mod encoder;

pub use decoder::{read_piece_text, DecodeError, DecodedPiece, DecodedTrack, TextDecoder};
pub use encoder::MidiEncoder;
