//! Standard MIDI File import and export.
//!
//! Imported files are split into per-channel [`Track`]s at a fixed internal
//! resolution; the encoder quantizes them further onto instrument grids.
//! Export writes decoded tracks back as a Format 1 file.

mod midi_export;
mod midi_import;
mod note;
mod track;

pub use midi_export::{export_to_midi, write_smf, ExportSettings};
pub use midi_import::{import_from_bytes, import_from_midi, MidiImportError};
pub use note::Note;
pub use track::Track;

/// Ticks per beat (quarter note) of imported and exported files.
pub const TICKS_PER_BEAT: u32 = 480;

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: u32 = 120;

/// General MIDI percussion channel (channel 10, zero-based).
pub const DRUM_CHANNEL: u8 = 9;

/// Picks a melodic channel for the `index`-th melodic track, skipping the
/// percussion channel and wrapping after 15 channels.
pub fn melodic_channel(index: usize) -> u8 {
    let slot = (index % 15) as u8;
    if slot >= DRUM_CHANNEL {
        slot + 1
    } else {
        slot
    }
}
