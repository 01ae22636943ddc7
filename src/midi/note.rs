//! A single imported note.

/// One note-on/note-off pair, timed in internal MIDI ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    /// Key number, 60 is middle C.
    pub pitch: u8,

    pub velocity: u8,

    /// Onset, in ticks from the start of the file.
    pub start_tick: u32,

    /// Length in ticks.
    pub duration_ticks: u32,
}

impl Note {
    /// Creates a note, clamping pitch and velocity into the MIDI range.
    pub fn new(pitch: u8, velocity: u8, start_tick: u32, duration_ticks: u32) -> Self {
        Self {
            pitch: pitch.min(127),
            velocity: velocity.min(127),
            start_tick,
            duration_ticks,
        }
    }

    /// Tick at which the note is released.
    pub fn end_tick(&self) -> u32 {
        self.start_tick.saturating_add(self.duration_ticks)
    }
}
