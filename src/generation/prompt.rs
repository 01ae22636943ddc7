//! Next-bar prompts under a token budget.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use super::piece::{Piece, PieceError};
use super::track_text::{combine_tracks, extract_tracks};
use crate::tokens::vocab::{count_tokens, BAR_START, PIECE_START, TRACK_END};

/// Builds prompts that ask the model for one more bar of a track.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    n_bars: usize,
    max_length: usize,
    rng: ChaCha8Rng,
}

impl PromptBuilder {
    /// Creates a builder with a window of `n_bars` bars and a side-context
    /// budget of `max_length` tokens.
    pub fn new(n_bars: usize, max_length: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            n_bars: n_bars.max(1),
            max_length,
            rng,
        }
    }

    /// Builds the prompt for the next bar of track `index`.
    ///
    /// Every other track that already has more bars than the target
    /// contributes its header and the bars lined up with the target's
    /// window, ending at the bar concurrent with the one being generated.
    /// The target contributes its header and its last `n_bars - 1` bars,
    /// and the prompt ends with the `BAR_START` cue. Only the side-track
    /// part is subject to the token budget.
    ///
    /// # Errors
    ///
    /// Returns `PieceError::TrackOutOfRange` for an unknown track
    pub fn build_next_bar_prompt(
        &mut self,
        piece: &Piece,
        index: isize,
    ) -> Result<String, PieceError> {
        let target_index = piece.resolve(index)?;
        let target = &piece.tracks()[target_index];
        let target_bars = target.bar_count();
        let window_start = (target_bars + 1).saturating_sub(self.n_bars);

        let mut side = format!("{PIECE_START} ");
        for (i, track) in piece.tracks().iter().enumerate() {
            if i == target_index || track.bar_count() <= target_bars {
                continue;
            }
            side.push_str(&track.header);
            for bar in &track.bars[window_start..=target_bars] {
                side.push_str(bar);
            }
            side.push_str(TRACK_END);
            side.push(' ');
        }

        let mut own = target.header.clone();
        let keep = self.n_bars - 1;
        for bar in &target.bars[target_bars.saturating_sub(keep)..] {
            own.push_str(bar);
        }
        own.push_str(BAR_START);
        own.push(' ');

        let prompt = self.enforce_length_limit(&side) + &own;
        info!(
            track = target_index,
            tokens = count_tokens(&prompt),
            "built next-bar prompt"
        );
        Ok(prompt)
    }

    /// Drops one random track segment when `text` is over budget.
    ///
    /// The check runs once: if the text is still too long after one drop it
    /// is returned as is. Text with fewer than two segments is never
    /// shortened.
    pub fn enforce_length_limit(&mut self, text: &str) -> String {
        let length = count_tokens(text);
        if length < self.max_length {
            return text.to_string();
        }
        let mut segments = extract_tracks(text);
        if segments.len() <= 1 {
            return text.to_string();
        }
        let dropped = self.rng.gen_range(0..segments.len());
        segments.remove(dropped);
        debug!(
            tokens = length,
            limit = self.max_length,
            dropped,
            "prompt over budget, dropped one track"
        );
        format!("{PIECE_START} {}", combine_tracks(&segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::Instrument;

    fn bars(n: usize, pitch: u8) -> String {
        (0..n)
            .map(|i| format!("BAR_START NOTE_ON={} BAR_END ", pitch + i as u8))
            .collect()
    }

    fn three_track_piece() -> Piece {
        let mut piece = Piece::new();
        piece.init_track(Instrument::Family(0), 1, 0.5);
        piece.add_bars_to_track(0, &bars(3, 40)).unwrap();
        piece.init_track(Instrument::Family(1), 1, 0.5);
        piece.add_bars_to_track(1, &bars(5, 60)).unwrap();
        piece.init_track(Instrument::Family(2), 1, 0.5);
        piece.add_bars_to_track(2, &bars(3, 80)).unwrap();
        piece
    }

    #[test]
    fn test_prompt_includes_tracks_ahead_only() {
        let piece = three_track_piece();
        let mut builder = PromptBuilder::new(8, 1500, Some(1));
        let prompt = builder.build_next_bar_prompt(&piece, 0).unwrap();

        assert!(prompt.starts_with("PIECE_START "));
        assert!(prompt.contains("TRACK_START INST=1 DENSITY=1 "));
        assert!(!prompt.contains("INST=2"));
        assert!(prompt.ends_with("BAR_START "));
        // Track B up to the bar concurrent with A's fourth bar.
        assert!(prompt.contains("NOTE_ON=63 BAR_END TRACK_END "));
        assert!(!prompt.contains("NOTE_ON=64"));
        // Track A with all of its bars.
        assert!(prompt.ends_with(
            "TRACK_START INST=0 DENSITY=1 BAR_START NOTE_ON=40 BAR_END BAR_START NOTE_ON=41 \
             BAR_END BAR_START NOTE_ON=42 BAR_END BAR_START "
        ));
    }

    #[test]
    fn test_prompt_window() {
        let piece = three_track_piece();
        let mut builder = PromptBuilder::new(2, 1500, Some(1));
        let prompt = builder.build_next_bar_prompt(&piece, 0).unwrap();
        assert_eq!(
            prompt,
            "PIECE_START TRACK_START INST=1 DENSITY=1 BAR_START NOTE_ON=62 BAR_END \
             BAR_START NOTE_ON=63 BAR_END TRACK_END \
             TRACK_START INST=0 DENSITY=1 BAR_START NOTE_ON=42 BAR_END BAR_START "
        );
    }

    #[test]
    fn test_prompt_for_leading_track_has_no_side_context() {
        let piece = three_track_piece();
        let mut builder = PromptBuilder::new(8, 1500, Some(1));
        let prompt = builder.build_next_bar_prompt(&piece, 1).unwrap();
        assert!(prompt.starts_with("PIECE_START TRACK_START INST=1 "));
        assert_eq!(prompt.matches("TRACK_START").count(), 1);
    }

    #[test]
    fn test_enforce_length_limit_two_segments() {
        let text = "PIECE_START TRACK_START INST=0 BAR_START BAR_END TRACK_END \
                    TRACK_START INST=1 BAR_START BAR_END TRACK_END ";
        let mut builder = PromptBuilder::new(8, 4, Some(3));
        let limited = builder.enforce_length_limit(text);
        assert!(limited.starts_with("PIECE_START TRACK_START "));
        assert_eq!(extract_tracks(&limited).len(), 1);
    }

    #[test]
    fn test_enforce_length_limit_keeps_order() {
        let text = "PIECE_START TRACK_START INST=0 TRACK_END TRACK_START INST=1 TRACK_END \
                    TRACK_START INST=2 TRACK_END ";
        let mut builder = PromptBuilder::new(8, 2, Some(9));
        let limited = builder.enforce_length_limit(text);
        let kept: Vec<String> = extract_tracks(&limited);
        assert_eq!(kept.len(), 2);
        let inst: Vec<&str> = kept
            .iter()
            .filter_map(|t| t.split_whitespace().nth(1))
            .collect();
        let mut sorted = inst.clone();
        sorted.sort();
        assert_eq!(inst, sorted);
    }

    #[test]
    fn test_enforce_length_limit_one_segment_unchanged() {
        let text = "PIECE_START TRACK_START INST=0 BAR_START BAR_END TRACK_END ";
        let mut builder = PromptBuilder::new(8, 2, Some(3));
        assert_eq!(builder.enforce_length_limit(text), text);
    }

    #[test]
    fn test_enforce_length_limit_under_budget() {
        let text = "PIECE_START TRACK_START INST=0 TRACK_END TRACK_START INST=1 TRACK_END ";
        let mut builder = PromptBuilder::new(8, 100, Some(3));
        assert_eq!(builder.enforce_length_limit(text), text);
    }
}
