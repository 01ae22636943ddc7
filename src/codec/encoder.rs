//! MIDI to text encoding.
//!
//! Each instrument track runs through a fixed pipeline:
//!
//! 1. strip velocities
//! 2. split time shifts into one-step units
//! 3. insert bar boundaries
//! 4. merge unit shifts back together inside each bar
//! 5. drop the rest that precedes a bar end
//! 6. mark each bar with its density
//! 7. cut the bar stream into sections of `n_bar` bars
//! 8. give each section the mode of its bar densities
//!
//! Sections are then interleaved across tracks and serialized.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use crate::config::CodecConfig;
use crate::midi::{import_from_midi, MidiImportError, Track};
use crate::tokens::event::MAX_DENSITY;
use crate::tokens::{events_to_text, Duration, Event, Instrument};

/// One instrument's event stream, with the grid it was quantized on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentEvents {
    pub instrument: Instrument,
    pub ticks_per_beat: u32,
    pub events: Vec<Event>,
}

/// Turns imported MIDI tracks into token text.
#[derive(Debug, Clone, Default)]
pub struct MidiEncoder {
    config: CodecConfig,
}

impl MidiEncoder {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Reads a MIDI file and encodes it as one piece text.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn encode_file<P: AsRef<Path>>(&self, path: P) -> Result<String, MidiImportError> {
        let tracks = import_from_midi(path)?;
        Ok(self.encode_tracks(&tracks))
    }

    /// Encodes tracks as one piece text: every section group, each prefixed
    /// with `PIECE_START`.
    pub fn encode_tracks(&self, tracks: &[Track]) -> String {
        let sections = self.piece_sections(tracks);
        events_to_text(&sections_to_piece(&sections))
    }

    /// Encodes tracks as one text per section group.
    ///
    /// Group `i` holds section `i` of every track long enough to have one.
    pub fn encode_by_section(&self, tracks: &[Track]) -> Vec<String> {
        let sections = self.piece_sections(tracks);
        let group_count = sections.iter().map(Vec::len).max().unwrap_or(0);
        (0..group_count)
            .map(|index| {
                let mut group = vec![Event::PieceStart];
                for track_sections in &sections {
                    if let Some(section) = track_sections.get(index) {
                        group.extend_from_slice(section);
                    }
                }
                events_to_text(&group)
            })
            .collect()
    }

    /// Runs the per-track pipeline and returns, per track, its sections.
    pub fn piece_sections(&self, tracks: &[Track]) -> Vec<Vec<Vec<Event>>> {
        let sections: Vec<Vec<Vec<Event>>> = tracks
            .iter()
            .map(|track| self.track_sections(&self.raw_events(track)))
            .collect();
        info!(
            tracks = tracks.len(),
            sections = sections.iter().map(Vec::len).sum::<usize>(),
            "encoded piece"
        );
        sections
    }

    /// Raw quantized events for one track.
    ///
    /// A track without notes becomes a single rest spanning one full section,
    /// so it still yields `n_bar` empty bars.
    pub fn raw_events(&self, track: &Track) -> InstrumentEvents {
        let instrument = track.instrument();
        let ticks_per_beat = self.config.ticks_per_beat(instrument);
        let mut events = track.quantized_events(ticks_per_beat);
        if events.is_empty() {
            let rest = self.config.bar_ticks(instrument) * self.config.n_bar.max(1) as u32;
            events.push(Event::TimeShift(Duration::from_ticks(rest, ticks_per_beat)));
        }
        InstrumentEvents {
            instrument,
            ticks_per_beat,
            events,
        }
    }

    /// Steps 1-8 for one instrument.
    pub fn track_sections(&self, raw: &InstrumentEvents) -> Vec<Vec<Event>> {
        let bar_ticks = raw.ticks_per_beat * self.config.beats_per_bar;
        let events = remove_velocity(raw.events.clone());
        let events = set_timeshifts_to_min_length(events, raw.ticks_per_beat);
        let events = add_bars(events, bar_ticks, raw.ticks_per_beat);
        let events = combine_timeshifts_in_bar(events, raw.ticks_per_beat);
        let events = remove_timeshifts_preceding_bar_end(events);
        let events = add_density_to_bar(events, self.config.beats_per_bar);
        debug!(
            instrument = %raw.instrument,
            events = events.len(),
            "normalized instrument events"
        );
        make_sections(&events, raw.instrument, self.config.n_bar)
            .into_iter()
            .map(add_density_to_section)
            .collect()
    }
}

/// Removes `Velocity` events.
pub fn remove_velocity(events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .filter(|event| !matches!(event, Event::Velocity(_)))
        .collect()
}

/// Replaces every time shift with the equivalent run of one-step shifts.
pub fn set_timeshifts_to_min_length(events: Vec<Event>, ticks_per_beat: u32) -> Vec<Event> {
    let unit = Event::TimeShift(Duration::unit(ticks_per_beat));
    let mut out = Vec::with_capacity(events.len());
    for event in events {
        match event {
            Event::TimeShift(duration) => {
                for _ in 0..duration.to_ticks() {
                    out.push(unit);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Inserts `BarStart`/`BarEnd` pairs every `bar_ticks` ticks.
///
/// Expects one-step shifts. Note-offs that arrive right after a bar fills up
/// still belong to that bar; the next bar opens on the first other event.
/// The final bar is padded with unit shifts up to a full bar.
pub fn add_bars(events: Vec<Event>, bar_ticks: u32, ticks_per_beat: u32) -> Vec<Event> {
    let unit = Event::TimeShift(Duration::unit(ticks_per_beat));
    let mut out = Vec::with_capacity(events.len() + 8);
    let mut bar = 0;
    let mut ticks = 0;
    let mut bar_full = false;

    out.push(Event::BarStart(bar));
    for event in events {
        if bar_full && !event.is_note_off() {
            out.push(Event::BarEnd(bar));
            bar += 1;
            out.push(Event::BarStart(bar));
            bar_full = false;
        }
        if let Event::TimeShift(duration) = event {
            ticks += duration.to_ticks();
            if ticks >= bar_ticks {
                ticks = 0;
                bar_full = true;
            }
        }
        out.push(event);
    }
    if !bar_full {
        for _ in ticks..bar_ticks {
            out.push(unit);
        }
    }
    out.push(Event::BarEnd(bar));
    out
}

/// Merges runs of adjacent time shifts into one shift each.
pub fn combine_timeshifts_in_bar(events: Vec<Event>, ticks_per_beat: u32) -> Vec<Event> {
    let mut out = Vec::with_capacity(events.len());
    let mut pending = 0;
    for event in events {
        if let Event::TimeShift(duration) = event {
            pending += duration.to_ticks();
            continue;
        }
        if pending > 0 {
            out.push(Event::TimeShift(Duration::from_ticks(pending, ticks_per_beat)));
            pending = 0;
        }
        out.push(event);
    }
    if pending > 0 {
        out.push(Event::TimeShift(Duration::from_ticks(pending, ticks_per_beat)));
    }
    out
}

/// Drops any time shift directly followed by `BarEnd`.
pub fn remove_timeshifts_preceding_bar_end(events: Vec<Event>) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::with_capacity(events.len());
    for event in events {
        if matches!(event, Event::BarEnd(_)) && out.last().is_some_and(Event::is_time_shift) {
            out.pop();
        }
        out.push(event);
    }
    out
}

/// Inserts a `BarDensity` marker after every `BarStart`.
///
/// The density is the bar's note-on count divided by `beats_per_bar`,
/// rounded half to even.
pub fn add_density_to_bar(events: Vec<Event>, beats_per_bar: u32) -> Vec<Event> {
    let mut out = Vec::with_capacity(events.len() + events.len() / 4);
    let mut bar: Vec<Event> = Vec::new();
    let mut in_bar = false;

    for event in events {
        match event {
            Event::BarStart(_) => {
                out.extend(bar.drain(..));
                out.push(event);
                in_bar = true;
            }
            Event::BarEnd(_) if in_bar => {
                let onsets = bar.iter().filter(|e| matches!(e, Event::NoteOn(_))).count() as u32;
                out.push(Event::BarDensity(round_half_even(onsets, beats_per_bar)));
                out.extend(bar.drain(..));
                out.push(event);
                in_bar = false;
            }
            _ if in_bar => bar.push(event),
            _ => out.push(event),
        }
    }
    out.extend(bar);
    out
}

/// `numerator / denominator` rounded to the nearest integer, ties to even.
fn round_half_even(numerator: u32, denominator: u32) -> u32 {
    let denominator = denominator.max(1);
    let quotient = numerator / denominator;
    let twice_remainder = 2 * (numerator % denominator);
    if twice_remainder > denominator || (twice_remainder == denominator && quotient % 2 == 1) {
        quotient + 1
    } else {
        quotient
    }
}

/// Cuts a bar stream into sections of `n_bar` bars.
///
/// Each section is wrapped in `TrackStart(i)`, `Instrument` ... `TrackEnd(i)`
/// with `i` counting sections of this track. A trailing partial section is
/// kept.
pub fn make_sections(events: &[Event], instrument: Instrument, n_bar: usize) -> Vec<Vec<Event>> {
    let n_bar = n_bar.max(1) as u32;
    let mut sections = Vec::new();
    let mut index = 0;
    let mut section = vec![Event::TrackStart(index), Event::Instrument(instrument)];

    for (position, event) in events.iter().enumerate() {
        section.push(*event);
        let is_last = position + 1 == events.len();
        let closes = matches!(event, Event::BarEnd(bar) if (bar + 1) % n_bar == 0);
        if is_last || closes {
            section.push(Event::TrackEnd(index));
            sections.push(std::mem::take(&mut section));
            index += 1;
            if !is_last {
                section = vec![Event::TrackStart(index), Event::Instrument(instrument)];
            }
        }
    }
    sections
}

/// Inserts the section `Density` right after the `Instrument` event.
///
/// The density is the most frequent bar density, ties going to the smaller
/// value, capped at the grammar maximum.
pub fn add_density_to_section(mut section: Vec<Event>) -> Vec<Event> {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for event in &section {
        if let Event::BarDensity(density) = event {
            *counts.entry(*density).or_default() += 1;
        }
    }
    let mode = counts
        .iter()
        .fold(None, |best: Option<(u32, usize)>, (&density, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((density, count)),
        })
        .map(|(density, _)| density)
        .unwrap_or(0);
    let density = mode.min(u32::from(MAX_DENSITY)) as u8;

    let at = section
        .iter()
        .position(|e| matches!(e, Event::Instrument(_)))
        .map(|i| i + 1)
        .unwrap_or(0);
    section.insert(at, Event::Density(density));
    section
}

/// Interleaves sections round-robin across tracks.
///
/// Each group `i` is `PieceStart` followed by section `i` of every track that
/// has one, in track order.
pub fn sections_to_piece(sections: &[Vec<Vec<Event>>]) -> Vec<Event> {
    let group_count = sections.iter().map(Vec::len).max().unwrap_or(0);
    let mut piece = Vec::new();
    for index in 0..group_count {
        piece.push(Event::PieceStart);
        for track_sections in sections {
            if let Some(section) = track_sections.get(index) {
                piece.extend_from_slice(section);
            }
        }
    }
    piece
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{Note, DRUM_CHANNEL, TICKS_PER_BEAT};

    const BEAT: u32 = TICKS_PER_BEAT;

    fn shift(ticks: u32, tpb: u32) -> Event {
        Event::TimeShift(Duration::from_ticks(ticks, tpb))
    }

    /// Sums the shifts inside each BarStart..BarEnd, in text ticks.
    fn bar_sums(events: &[Event]) -> Vec<u32> {
        let mut sums = Vec::new();
        let mut current = 0;
        for event in events {
            match event {
                Event::BarStart(_) => current = 0,
                Event::BarEnd(_) => sums.push(current),
                Event::TimeShift(d) => current += d.to_ticks(),
                _ => {}
            }
        }
        sums
    }

    fn piano(notes: &[(u8, u32, u32)]) -> Track {
        let mut track = Track::new("piano", 0);
        for &(pitch, start, duration) in notes {
            track.add_note(Note::new(pitch, 90, start, duration));
        }
        track
    }

    #[test]
    fn test_min_length_split() {
        let events = vec![Event::NoteOn(60), shift(3, 8), Event::NoteOff(60)];
        let split = set_timeshifts_to_min_length(events, 8);
        assert_eq!(split.len(), 5);
        assert!(split[1..4].iter().all(|e| *e == shift(1, 8)));
    }

    #[test]
    fn test_bars_sum_to_full_bar() {
        let tpb = 8;
        let bar_ticks = 32;
        // A note from beat 1 to beat 6 and another crossing no boundary.
        let events = vec![
            shift(8, tpb),
            Event::NoteOn(60),
            shift(40, tpb),
            Event::NoteOff(60),
            Event::NoteOn(62),
            shift(4, tpb),
            Event::NoteOff(62),
        ];
        let events = set_timeshifts_to_min_length(events, tpb);
        let barred = add_bars(events, bar_ticks, tpb);
        assert_eq!(bar_sums(&barred), vec![32, 32]);

        let combined = combine_timeshifts_in_bar(barred, tpb);
        assert_eq!(bar_sums(&combined), vec![32, 32]);
        assert_eq!(
            combined,
            vec![
                Event::BarStart(0),
                shift(8, tpb),
                Event::NoteOn(60),
                shift(24, tpb),
                Event::BarEnd(0),
                Event::BarStart(1),
                shift(16, tpb),
                Event::NoteOff(60),
                Event::NoteOn(62),
                shift(4, tpb),
                Event::NoteOff(62),
                shift(12, tpb),
                Event::BarEnd(1),
            ]
        );
    }

    #[test]
    fn test_note_off_on_barline_stays_in_bar() {
        let tpb = 4;
        let events = vec![
            Event::NoteOn(36),
            shift(16, tpb),
            Event::NoteOff(36),
            Event::NoteOn(38),
            shift(1, tpb),
            Event::NoteOff(38),
        ];
        let events = set_timeshifts_to_min_length(events, tpb);
        let barred = combine_timeshifts_in_bar(add_bars(events, 16, tpb), tpb);
        assert_eq!(
            &barred[..5],
            &[
                Event::BarStart(0),
                Event::NoteOn(36),
                shift(16, tpb),
                Event::NoteOff(36),
                Event::BarEnd(0),
            ]
        );
        assert_eq!(barred[5], Event::BarStart(1));
        assert_eq!(barred[6], Event::NoteOn(38));
    }

    #[test]
    fn test_remove_rest_before_bar_end() {
        let events = vec![
            Event::BarStart(0),
            Event::NoteOn(60),
            shift(4, 8),
            Event::NoteOff(60),
            shift(28, 8),
            Event::BarEnd(0),
            Event::BarStart(1),
            shift(32, 8),
            Event::BarEnd(1),
        ];
        let trimmed = remove_timeshifts_preceding_bar_end(events);
        assert_eq!(
            trimmed,
            vec![
                Event::BarStart(0),
                Event::NoteOn(60),
                shift(4, 8),
                Event::NoteOff(60),
                Event::BarEnd(0),
                Event::BarStart(1),
                Event::BarEnd(1),
            ]
        );
    }

    #[test]
    fn test_bar_density() {
        let mut events = vec![Event::BarStart(0)];
        for pitch in 0..6 {
            events.push(Event::NoteOn(60 + pitch));
        }
        events.push(Event::BarEnd(0));
        events.push(Event::BarStart(1));
        for pitch in 0..10 {
            events.push(Event::NoteOn(60 + pitch));
        }
        events.push(Event::BarEnd(1));

        let marked = add_density_to_bar(events, 4);
        assert_eq!(marked[1], Event::BarDensity(2)); // 6 / 4 = 1.5 -> 2
        assert_eq!(marked[10], Event::BarDensity(2)); // 10 / 4 = 2.5 -> 2
        assert_eq!(marked.len(), 22);
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_half_even(0, 4), 0);
        assert_eq!(round_half_even(2, 4), 0);
        assert_eq!(round_half_even(3, 4), 1);
        assert_eq!(round_half_even(6, 4), 2);
        assert_eq!(round_half_even(7, 4), 2);
        assert_eq!(round_half_even(14, 4), 4);
    }

    #[test]
    fn test_make_sections() {
        let mut events = Vec::new();
        for bar in 0..5 {
            events.push(Event::BarStart(bar));
            events.push(Event::BarDensity(1));
            events.push(Event::BarEnd(bar));
        }
        let sections = make_sections(&events, Instrument::Family(2), 2);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0][0], Event::TrackStart(0));
        assert_eq!(sections[0][1], Event::Instrument(Instrument::Family(2)));
        assert_eq!(*sections[0].last().unwrap(), Event::TrackEnd(0));
        assert_eq!(*sections[2].last().unwrap(), Event::TrackEnd(2));
        // Final partial section holds one bar.
        let bars = sections[2].iter().filter(|e| matches!(e, Event::BarEnd(_))).count();
        assert_eq!(bars, 1);
    }

    #[test]
    fn test_section_density_is_mode() {
        let section = vec![
            Event::TrackStart(0),
            Event::Instrument(Instrument::Drums),
            Event::BarStart(0),
            Event::BarDensity(3),
            Event::BarEnd(0),
            Event::BarStart(1),
            Event::BarDensity(1),
            Event::BarEnd(1),
            Event::BarStart(2),
            Event::BarDensity(3),
            Event::BarEnd(2),
            Event::TrackEnd(0),
        ];
        let section = add_density_to_section(section);
        assert_eq!(section[2], Event::Density(3));

        let tie = vec![
            Event::Instrument(Instrument::Family(0)),
            Event::BarDensity(2),
            Event::BarDensity(1),
        ];
        assert_eq!(add_density_to_section(tie)[1], Event::Density(1));

        let dense = vec![Event::Instrument(Instrument::Family(0)), Event::BarDensity(6)];
        assert_eq!(add_density_to_section(dense)[1], Event::Density(3));
    }

    #[test]
    fn test_round_robin() {
        let a = vec![vec![Event::TrackStart(0)], vec![Event::TrackStart(1)]];
        let b = vec![vec![Event::NoteOn(1)]];
        let piece = sections_to_piece(&[a, b]);
        assert_eq!(
            piece,
            vec![
                Event::PieceStart,
                Event::TrackStart(0),
                Event::NoteOn(1),
                Event::PieceStart,
                Event::TrackStart(1),
            ]
        );
    }

    #[test]
    fn test_encode_single_note() {
        let mut config = CodecConfig::default();
        config.n_bar = 2;
        let encoder = MidiEncoder::new(config);
        // A whole note fills exactly one bar.
        let tracks = [piano(&[(64, 0, 4 * BEAT)])];
        let text = encoder.encode_tracks(&tracks);
        assert_eq!(
            text,
            "PIECE_START TRACK_START INST=0 DENSITY=0 BAR_START NOTE_ON=64 TIME_DELTA=32 NOTE_OFF=64 BAR_END TRACK_END "
        );
    }

    #[test]
    fn test_encode_empty_track() {
        let mut config = CodecConfig::default();
        config.n_bar = 3;
        let encoder = MidiEncoder::new(config);
        let text = encoder.encode_tracks(&[Track::new("silent", DRUM_CHANNEL)]);
        assert_eq!(
            text,
            "PIECE_START TRACK_START INST=DRUMS DENSITY=0 BAR_START BAR_END BAR_START BAR_END BAR_START BAR_END TRACK_END "
        );
    }

    #[test]
    fn test_encode_interleaves_sections() {
        let mut config = CodecConfig::default();
        config.n_bar = 1;
        let encoder = MidiEncoder::new(config);
        let bass = {
            let mut t = piano(&[(40, 0, BEAT), (40, 4 * BEAT, BEAT)]);
            t.program = 33;
            t
        };
        let lead = piano(&[(72, 0, BEAT)]);
        let groups = encoder.encode_by_section(&[bass.clone(), lead.clone()]);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].starts_with("PIECE_START TRACK_START INST=4 "));
        assert!(groups[0].contains("INST=0"));
        assert!(!groups[1].contains("INST=0"));
        assert_eq!(encoder.encode_tracks(&[bass, lead]), groups.concat());
    }
}
