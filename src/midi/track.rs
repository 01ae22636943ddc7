//! Imported MIDI track representation.
//!
//! A track holds the notes of one (SMF track, channel) pair together with the
//! program that was active on that channel. It is the raw input of the
//! encoder: [`Track::quantized_events`] turns it into a time-ordered event
//! stream on an instrument grid.

use super::note::Note;
use super::{DRUM_CHANNEL, TICKS_PER_BEAT};
use crate::tokens::{family_of, Duration, Event, Instrument};

/// Notes of one channel, kept sorted by onset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Track name from the file, or a generated one.
    pub name: String,

    /// Zero-based MIDI channel; 9 means percussion.
    pub channel: u8,

    /// MIDI program number (0-127).
    pub program: u8,

    /// Sorted by `start_tick`.
    notes: Vec<Note>,
}

impl Track {
    /// Creates an empty track on a channel with the default program (piano).
    ///
    /// # Arguments
    ///
    /// * `name` - Display name for the track
    /// * `channel` - MIDI channel (0-15)
    pub fn new(name: impl Into<String>, channel: u8) -> Self {
        Self {
            name: name.into(),
            channel: channel.min(15),
            program: 0,
            notes: Vec::new(),
        }
    }

    /// True for tracks on the General MIDI percussion channel.
    pub fn is_drum(&self) -> bool {
        self.channel == DRUM_CHANNEL
    }

    /// The token-level instrument of this track.
    ///
    /// Drums are a sentinel. Every other track is reduced to the family of
    /// its program.
    pub fn instrument(&self) -> Instrument {
        if self.is_drum() {
            Instrument::Drums
        } else {
            Instrument::Family(family_of(self.program).unwrap_or(0))
        }
    }

    /// Inserts a note after every note with an earlier or equal onset.
    pub fn add_note(&mut self, note: Note) {
        let pos = self
            .notes
            .partition_point(|n| n.start_tick <= note.start_tick);
        self.notes.insert(pos, note);
    }

    /// Notes in onset order.
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// Returns the end tick of the last sounding note.
    pub fn duration_ticks(&self) -> u32 {
        self.notes.iter().map(Note::end_tick).max().unwrap_or(0)
    }

    /// Converts the notes into a raw event stream on a `ticks_per_beat` grid.
    ///
    /// Note boundaries are rounded to the nearest grid step and every note is
    /// at least one step long. Events are ordered by time; at equal time,
    /// note-offs come before note-ons. Each `NoteOn` is followed by its
    /// `Velocity`, and a `TimeShift` separates distinct time points, starting
    /// from tick 0.
    ///
    /// # Arguments
    ///
    /// * `ticks_per_beat` - Grid steps per beat for this track's instrument
    pub fn quantized_events(&self, ticks_per_beat: u32) -> Vec<Event> {
        let ticks_per_beat = ticks_per_beat.max(1);
        let step = (TICKS_PER_BEAT / ticks_per_beat).max(1);

        // (grid time, note-off first, pitch, velocity)
        let mut points: Vec<(u32, bool, u8, u8)> = Vec::with_capacity(self.notes.len() * 2);
        for note in &self.notes {
            let start = snap(note.start_tick, step);
            let end = snap(note.end_tick(), step).max(start + 1);
            points.push((start, false, note.pitch, note.velocity));
            points.push((end, true, note.pitch, note.velocity));
        }
        points.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut events = Vec::with_capacity(points.len() * 2);
        let mut current = 0;
        for (time, is_off, pitch, velocity) in points {
            if time > current {
                events.push(Event::TimeShift(Duration::from_ticks(
                    time - current,
                    ticks_per_beat,
                )));
                current = time;
            }
            if is_off {
                events.push(Event::NoteOff(pitch));
            } else {
                events.push(Event::NoteOn(pitch));
                events.push(Event::Velocity(velocity));
            }
        }
        events
    }
}

/// Rounds a MIDI tick to the nearest grid index.
fn snap(tick: u32, step: u32) -> u32 {
    let remainder = tick % step;
    if remainder > step / 2 {
        tick / step + 1
    } else {
        tick / step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_notes_sorted() {
        let mut track = Track::new("Test", 0);
        track.add_note(Note::new(60, 100, 480, 240));
        track.add_note(Note::new(62, 100, 0, 240));
        track.add_note(Note::new(64, 100, 960, 240));

        let notes = track.notes();
        assert_eq!(notes[0].start_tick, 0);
        assert_eq!(notes[1].start_tick, 480);
        assert_eq!(notes[2].start_tick, 960);
        assert_eq!(track.duration_ticks(), 1200);
    }

    #[test]
    fn test_instrument() {
        let mut track = Track::new("Bass", 2);
        track.program = 33;
        assert_eq!(track.instrument(), Instrument::Family(4));

        let drums = Track::new("Kit", DRUM_CHANNEL);
        assert!(drums.is_drum());
        assert_eq!(drums.instrument(), Instrument::Drums);
    }

    #[test]
    fn test_quantized_events_order() {
        let mut track = Track::new("Test", 0);
        // Two back-to-back eighth notes at 480 PPQ, starting on beat 2.
        track.add_note(Note::new(60, 90, 480, 240));
        track.add_note(Note::new(62, 80, 720, 240));

        let events = track.quantized_events(8);
        assert_eq!(
            events,
            vec![
                Event::TimeShift(Duration::from_ticks(8, 8)),
                Event::NoteOn(60),
                Event::Velocity(90),
                Event::TimeShift(Duration::from_ticks(4, 8)),
                Event::NoteOff(60),
                Event::NoteOn(62),
                Event::Velocity(80),
                Event::TimeShift(Duration::from_ticks(4, 8)),
                Event::NoteOff(62),
            ]
        );
    }

    #[test]
    fn test_quantized_events_min_length() {
        let mut track = Track::new("Kit", DRUM_CHANNEL);
        // A 10-tick hit is shorter than half a drum grid step (120 ticks).
        track.add_note(Note::new(36, 100, 0, 10));
        let events = track.quantized_events(4);
        assert_eq!(
            events,
            vec![
                Event::NoteOn(36),
                Event::Velocity(100),
                Event::TimeShift(Duration::unit(4)),
                Event::NoteOff(36),
            ]
        );
    }

    #[test]
    fn test_snap() {
        assert_eq!(snap(0, 60), 0);
        assert_eq!(snap(30, 60), 0);
        assert_eq!(snap(31, 60), 1);
        assert_eq!(snap(119, 60), 2);
    }
}
