//! The generation orchestrator.
//!
//! A [`Generator`] owns the piece being composed and drives an external
//! [`CompletionOracle`]. Each request to the oracle is checked for its bar
//! count: too many bars are truncated, too few are retried a bounded number
//! of times and then accepted as they are.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::piece::{track_header, Piece, PieceError, TrackState};
use super::prompt::PromptBuilder;
use super::session::{SessionError, SessionRecord};
use super::track_text::{
    count_bars, extract_new_bar, get_last_track, get_new_content, truncate_to_bars,
};
use crate::config::GenerationConfig;
use crate::tokens::vocab::{DENSITY, INST};
use crate::tokens::Instrument;

/// Token the vocabulary sweep always reports.
const UNKNOWN_TOKEN: &str = "UNK";

/// Tokens of context logged on each side of an unknown token.
const ERROR_CONTEXT: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("token '{token}' is not in the model vocabulary (available instruments: {available})")]
    Vocabulary { token: String, available: String },

    #[error(transparent)]
    Piece(#[from] PieceError),

    #[error(transparent)]
    Oracle(#[from] anyhow::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// One call to the completion oracle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionRequest<'a> {
    /// Text the completion must start with.
    pub prompt: &'a str,
    pub temperature: f32,
    /// Maximum total length of the completion, in tokens.
    pub context_window: usize,
    /// Generation stops after this token.
    pub stop_token: &'a str,
    /// No-repeat n-gram size. 0 disables it.
    pub no_repeat_ngram_size: usize,
}

/// An external sequence-completion model.
///
/// Implementations return the prompt followed by the continuation, up to
/// and including the stop token or until the context window is full.
pub trait CompletionOracle {
    fn complete(&mut self, request: &CompletionRequest<'_>) -> anyhow::Result<String>;

    /// Every token the model knows.
    fn vocabulary(&self) -> &HashSet<String>;
}

/// Settings for one track to generate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    pub instrument: Instrument,
    pub density: u8,
    pub temperature: f32,
}

impl TrackConfig {
    pub fn new(instrument: Instrument, density: u8, temperature: f32) -> Self {
        Self {
            instrument,
            density,
            temperature,
        }
    }
}

/// What to do with one oracle completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// The bar count is right, or it is not being enforced.
    Accept,
    /// Too many bars: cut the surplus and accept.
    TruncateAndAccept,
    /// Too few bars: ask again with the same prompt.
    Retry,
    /// Too few bars and no retries left: accept the short result.
    GiveUp,
}

/// Decides the outcome of an attempt that produced `actual` bars.
///
/// `failures` is the number of failed attempts before this one.
pub fn judge_attempt(
    actual: usize,
    expected: usize,
    force: bool,
    failures: usize,
    max_retries: usize,
) -> AttemptVerdict {
    if !force || actual == expected {
        AttemptVerdict::Accept
    } else if actual > expected {
        AttemptVerdict::TruncateAndAccept
    } else if failures + 1 > max_retries {
        AttemptVerdict::GiveUp
    } else {
        AttemptVerdict::Retry
    }
}

/// Composes a piece track by track and bar by bar.
pub struct Generator<O> {
    oracle: O,
    config: GenerationConfig,
    piece: Piece,
    prompts: PromptBuilder,
}

impl<O: CompletionOracle> Generator<O> {
    /// Creates a generator with an empty piece.
    ///
    /// `seed` drives the prompt builder's choice of which track to drop
    /// when a prompt is over budget.
    pub fn new(oracle: O, config: GenerationConfig, seed: Option<u64>) -> Self {
        Self::with_piece(oracle, config, Piece::new(), seed)
    }

    /// Creates a generator that continues an existing piece.
    pub fn with_piece(
        oracle: O,
        config: GenerationConfig,
        piece: Piece,
        seed: Option<u64>,
    ) -> Self {
        let prompts = PromptBuilder::new(config.n_bars, config.max_prompt_length, seed);
        Self {
            oracle,
            config,
            piece,
            prompts,
        }
    }

    /// Creates a generator from a saved session.
    pub fn from_session(
        oracle: O,
        config: GenerationConfig,
        record: &SessionRecord,
        seed: Option<u64>,
    ) -> Self {
        Self::with_piece(oracle, config, record.to_piece(), seed)
    }

    pub fn piece(&self) -> &Piece {
        &self.piece
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Checks that the instrument and density tokens of a track exist in
    /// the oracle vocabulary.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Vocabulary` naming the missing token and
    /// the instruments the oracle does know
    pub fn validate_track(&self, track: &TrackConfig) -> Result<(), GenerationError> {
        let vocabulary = self.oracle.vocabulary();
        for token in [
            format!("{INST}={}", track.instrument),
            format!("{DENSITY}={}", track.density),
        ] {
            if !vocabulary.contains(&token) {
                return Err(GenerationError::Vocabulary {
                    token,
                    available: self.available_instruments().join(", "),
                });
            }
        }
        Ok(())
    }

    fn available_instruments(&self) -> Vec<String> {
        let prefix = format!("{INST}=");
        let mut instruments: Vec<String> = self
            .oracle
            .vocabulary()
            .iter()
            .filter_map(|token| token.strip_prefix(&prefix))
            .map(str::to_string)
            .collect();
        instruments.sort();
        instruments
    }

    /// Generates one new track per entry of `tracks`, each conditioned on
    /// the piece so far, then sweeps the result for unknown tokens.
    ///
    /// Every track is validated before the first oracle call.
    ///
    /// # Errors
    ///
    /// Returns error if a track fails validation or the oracle fails
    pub fn generate_piece(&mut self, tracks: &[TrackConfig]) -> Result<String, GenerationError> {
        for track in tracks {
            self.validate_track(track)?;
        }
        for (i, track) in tracks.iter().enumerate() {
            info!(
                track = i,
                instrument = %track.instrument,
                density = track.density,
                "generating track"
            );
            let prompt = self.piece.build_piece_text();
            self.generate_one_new_track(track, &prompt)?;
        }
        let text = self.piece.build_piece_text();
        self.check_for_errors(&text);
        Ok(text)
    }

    /// Appends a new track generated from `prompt` and returns the piece
    /// text.
    ///
    /// The track header is appended to `prompt` before the first attempt.
    /// If the oracle fails the new track is removed again.
    ///
    /// # Errors
    ///
    /// Returns error if the track fails validation or the oracle fails
    pub fn generate_one_new_track(
        &mut self,
        track: &TrackConfig,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        self.validate_track(track)?;
        let index = self
            .piece
            .init_track(track.instrument, track.density, track.temperature);

        let prompt = format!("{prompt}{}", track_header(track.instrument, track.density));
        let expected = self.config.n_bars;
        let full = match self.generate_until_track_end(&prompt, track.temperature, expected) {
            Ok(full) => full,
            Err(e) => {
                self.piece.delete_track(-1)?;
                return Err(e);
            }
        };

        match get_last_track(&full) {
            Some(generated) => {
                let bars = self.piece.add_bars_to_track(-1, &generated)?;
                debug!(track = index, bars, "added generated track");
            }
            None => warn!(track = index, "completion holds no track, keeping it empty"),
        }
        Ok(self.piece.build_piece_text())
    }

    /// Generates one more bar for a track and returns the bar text.
    ///
    /// # Errors
    ///
    /// Returns error if the track does not exist or the oracle fails
    pub fn generate_one_more_bar(&mut self, index: isize) -> Result<String, GenerationError> {
        let index = self.piece.resolve(index)? as isize;
        let temperature = self.piece.track(index)?.temperature;
        let prompt = self.prompts.build_next_bar_prompt(&self.piece, index)?;

        let full = self.generate_until_track_end(&prompt, temperature, 1)?;
        let bar = extract_new_bar(&full);
        if self.piece.add_bars_to_track(index, &bar)? == 0 {
            warn!(track = index, "completion held no bar");
        }
        Ok(bar)
    }

    /// Extends the piece by `n` bars, round-robin over the tracks, or only
    /// the track `only` when given. Returns the piece text.
    ///
    /// # Errors
    ///
    /// Returns error if `only` names no track or the oracle fails
    pub fn generate_n_more_bars(
        &mut self,
        n: usize,
        only: Option<isize>,
    ) -> Result<String, GenerationError> {
        let only = only.map(|index| self.piece.resolve(index)).transpose()?;
        for bar in 0..n {
            for index in 0..self.piece.track_count() {
                if only.is_some_and(|only| only != index) {
                    continue;
                }
                debug!(bar, track = index, "generating bar");
                self.generate_one_more_bar(index as isize)?;
            }
        }
        let text = self.piece.build_piece_text();
        self.check_for_errors(&text);
        Ok(text)
    }

    /// Calls the oracle until the completion holds `expected` bars or the
    /// retries run out. Returns the prompt plus the accepted continuation.
    fn generate_until_track_end(
        &mut self,
        prompt: &str,
        temperature: f32,
        expected: usize,
    ) -> Result<String, GenerationError> {
        let request = CompletionRequest {
            prompt,
            temperature,
            context_window: self.config.context_window,
            stop_token: &self.config.generate_until_token,
            no_repeat_ngram_size: self.config.improvisation_level,
        };
        let mut failures = 0;
        loop {
            let full = self.oracle.complete(&request)?;
            let generated = get_new_content(&full, prompt);
            let bars = count_bars(generated);
            let verdict = judge_attempt(
                bars,
                expected,
                self.config.force_sequence_length,
                failures,
                self.config.max_retries,
            );
            debug!(bars, expected, ?verdict, "checked completion");

            match verdict {
                AttemptVerdict::Accept => return Ok(full),
                AttemptVerdict::TruncateAndAccept => {
                    info!(bars, expected, "truncating completion");
                    return Ok(format!("{prompt}{}", truncate_to_bars(generated, expected)));
                }
                AttemptVerdict::Retry => {
                    failures += 1;
                    warn!(bars, expected, attempt = failures, "completion too short, retrying");
                }
                AttemptVerdict::GiveUp => {
                    warn!(bars, expected, "completion still too short, keeping it");
                    return Ok(full);
                }
            }
        }
    }

    /// Logs every token of `text` the oracle does not know, with five
    /// tokens of context on each side. Returns how many were found.
    pub fn check_for_errors(&self, text: &str) -> usize {
        let vocabulary = self.oracle.vocabulary();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut unknown = 0;
        for (i, token) in tokens.iter().enumerate() {
            if *token != UNKNOWN_TOKEN && vocabulary.contains(*token) {
                continue;
            }
            warn!(token, context = %error_context(&tokens, i), "token not in vocabulary");
            unknown += 1;
        }
        unknown
    }

    pub fn delete_track(&mut self, index: isize) -> Result<TrackState, GenerationError> {
        Ok(self.piece.delete_track(index)?)
    }

    pub fn reset_temperature(
        &mut self,
        index: isize,
        temperature: f32,
    ) -> Result<(), GenerationError> {
        Ok(self.piece.set_track_temperature(index, temperature)?)
    }

    pub fn piece_text(&self) -> String {
        self.piece.build_piece_text()
    }

    pub fn track_text(&self, index: isize) -> Result<String, GenerationError> {
        Ok(self.piece.build_track_text(index)?)
    }

    /// Saves the session to a timestamped JSON file under `dir`.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save_session(&self, dir: &Path) -> Result<PathBuf, GenerationError> {
        Ok(SessionRecord::from_piece(&self.piece).save_to_dir(dir)?)
    }
}

/// The tokens around `tokens[i]`, `ERROR_CONTEXT` on each side where present.
fn error_context(tokens: &[&str], i: usize) -> String {
    let from = i.saturating_sub(ERROR_CONTEXT);
    let to = (i + ERROR_CONTEXT + 1).min(tokens.len());
    tokens[from..to].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecConfig;
    use crate::tokens::vocab::full_vocabulary;

    /// Replays canned continuations, repeating the last one.
    struct ScriptedOracle {
        replies: Vec<String>,
        prompts: Vec<String>,
        vocabulary: HashSet<String>,
        fail: bool,
    }

    impl ScriptedOracle {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_string()).collect(),
                prompts: Vec::new(),
                vocabulary: full_vocabulary(&CodecConfig::default()).into_iter().collect(),
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.prompts.len()
        }
    }

    impl CompletionOracle for ScriptedOracle {
        fn complete(&mut self, request: &CompletionRequest<'_>) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("model offline");
            }
            let reply = self
                .replies
                .get(self.prompts.len())
                .or(self.replies.last())
                .cloned()
                .unwrap_or_default();
            self.prompts.push(request.prompt.to_string());
            Ok(format!("{}{}", request.prompt, reply))
        }

        fn vocabulary(&self) -> &HashSet<String> {
            &self.vocabulary
        }
    }

    fn bars(n: usize) -> String {
        "BAR_START NOTE_ON=60 TIME_DELTA=32 NOTE_OFF=60 BAR_END ".repeat(n)
    }

    fn config(n_bars: usize) -> GenerationConfig {
        GenerationConfig {
            n_bars,
            ..GenerationConfig::default()
        }
    }

    fn piano() -> TrackConfig {
        TrackConfig::new(Instrument::Family(0), 2, 0.75)
    }

    #[test]
    fn test_judge_attempt() {
        assert_eq!(judge_attempt(4, 4, true, 0, 2), AttemptVerdict::Accept);
        assert_eq!(judge_attempt(1, 4, false, 0, 2), AttemptVerdict::Accept);
        assert_eq!(judge_attempt(6, 4, true, 0, 2), AttemptVerdict::TruncateAndAccept);
        assert_eq!(judge_attempt(1, 4, true, 0, 2), AttemptVerdict::Retry);
        assert_eq!(judge_attempt(1, 4, true, 1, 2), AttemptVerdict::Retry);
        assert_eq!(judge_attempt(1, 4, true, 2, 2), AttemptVerdict::GiveUp);
        assert_eq!(judge_attempt(1, 4, true, 0, 0), AttemptVerdict::GiveUp);
    }

    #[test]
    fn test_exact_track_accepted_in_one_call() {
        let reply = format!("{}TRACK_END ", bars(4));
        let mut generator = Generator::new(ScriptedOracle::new(&[&reply]), config(4), Some(1));
        let text = generator.generate_piece(&[piano()]).unwrap();

        assert_eq!(generator.oracle().calls(), 1);
        assert_eq!(generator.oracle().prompts[0], "PIECE_START TRACK_START INST=0 DENSITY=2 ");
        assert_eq!(generator.piece().track(0).unwrap().bar_count(), 4);
        assert_eq!(text, format!("PIECE_START TRACK_START INST=0 DENSITY=2 {reply}"));
    }

    #[test]
    fn test_short_output_terminates_after_retries() {
        let reply = format!("{}TRACK_END ", bars(1));
        let mut generator = Generator::new(ScriptedOracle::new(&[&reply]), config(8), Some(1));
        generator.generate_piece(&[piano()]).unwrap();

        assert_eq!(generator.oracle().calls(), generator.config().max_retries + 1);
        assert!(generator.oracle().prompts.iter().all(|p| p == &generator.oracle().prompts[0]));
        assert_eq!(generator.piece().track(0).unwrap().bar_count(), 1);
    }

    #[test]
    fn test_retry_then_accept() {
        let short = format!("{}TRACK_END ", bars(2));
        let exact = format!("{}TRACK_END ", bars(4));
        let oracle = ScriptedOracle::new(&[&short, &exact]);
        let mut generator = Generator::new(oracle, config(4), Some(1));
        generator.generate_piece(&[piano()]).unwrap();
        assert_eq!(generator.oracle().calls(), 2);
        assert_eq!(generator.piece().track(0).unwrap().bar_count(), 4);
    }

    #[test]
    fn test_long_output_truncated() {
        let reply = format!("{}TRACK_END ", bars(11));
        let mut generator = Generator::new(ScriptedOracle::new(&[&reply]), config(8), Some(1));
        generator.generate_piece(&[piano()]).unwrap();

        assert_eq!(generator.oracle().calls(), 1);
        let track_text = generator.track_text(0).unwrap();
        assert_eq!(count_bars(&track_text), 8);
        assert_eq!(track_text.matches("TRACK_END").count(), 1);
        assert!(track_text.ends_with("BAR_END TRACK_END "));
    }

    #[test]
    fn test_unforced_short_output_accepted() {
        let reply = format!("{}TRACK_END ", bars(1));
        let config = GenerationConfig {
            force_sequence_length: false,
            ..config(8)
        };
        let mut generator = Generator::new(ScriptedOracle::new(&[&reply]), config, Some(1));
        generator.generate_piece(&[piano()]).unwrap();
        assert_eq!(generator.oracle().calls(), 1);
    }

    #[test]
    fn test_second_track_conditioned_on_first() {
        let reply = format!("{}TRACK_END ", bars(2));
        let mut generator = Generator::new(ScriptedOracle::new(&[&reply]), config(2), Some(1));
        let drums = TrackConfig::new(Instrument::Drums, 1, 0.5);
        generator.generate_piece(&[piano(), drums]).unwrap();

        let prompts = &generator.oracle().prompts;
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].starts_with("PIECE_START TRACK_START INST=0 DENSITY=2 BAR_START"));
        assert!(prompts[1].ends_with("TRACK_END TRACK_START INST=DRUMS DENSITY=1 "));
        assert_eq!(generator.piece().track_count(), 2);
    }

    #[test]
    fn test_unknown_instrument_fails_before_generation() {
        let mut oracle = ScriptedOracle::new(&["TRACK_END "]);
        oracle.vocabulary.remove("INST=5");
        let mut generator = Generator::new(oracle, config(4), Some(1));
        let tracks = [piano(), TrackConfig::new(Instrument::Family(5), 1, 0.5)];

        let err = generator.generate_piece(&tracks).unwrap_err();
        assert_eq!(generator.oracle().calls(), 0);
        assert!(generator.piece().is_empty());
        let message = err.to_string();
        assert!(message.contains("INST=5"));
        assert!(message.contains("DRUMS"));
    }

    #[test]
    fn test_unknown_density_rejected() {
        let mut oracle = ScriptedOracle::new(&["TRACK_END "]);
        oracle.vocabulary.remove("DENSITY=3");
        let generator = Generator::new(oracle, config(4), Some(1));
        let err = generator
            .validate_track(&TrackConfig::new(Instrument::Family(0), 3, 0.5))
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Vocabulary { ref token, .. } if token == "DENSITY=3"
        ));
    }

    #[test]
    fn test_oracle_failure_removes_new_track() {
        let mut oracle = ScriptedOracle::new(&["TRACK_END "]);
        oracle.fail = true;
        let mut generator = Generator::new(oracle, config(4), Some(1));
        let err = generator.generate_one_new_track(&piano(), "PIECE_START ").unwrap_err();
        assert!(matches!(err, GenerationError::Oracle(_)));
        assert!(generator.piece().is_empty());
    }

    #[test]
    fn test_one_more_bar() {
        let track_reply = format!("{}TRACK_END ", bars(2));
        let bar_reply = "NOTE_ON=67 TIME_DELTA=32 NOTE_OFF=67 BAR_END TRACK_END ";
        let oracle = ScriptedOracle::new(&[&track_reply, bar_reply]);
        let mut generator = Generator::new(oracle, config(2), Some(1));
        generator.generate_piece(&[piano()]).unwrap();

        let bar = generator.generate_one_more_bar(-1).unwrap();
        assert_eq!(bar, "BAR_START NOTE_ON=67 TIME_DELTA=32 NOTE_OFF=67 BAR_END ");
        assert!(generator.oracle().prompts[1].ends_with("BAR_START "));
        let track = generator.piece().track(0).unwrap();
        assert_eq!(track.bar_count(), 3);
        assert_eq!(track.bars[2], bar);
    }

    #[test]
    fn test_n_more_bars_only_one_track() {
        let track_reply = format!("{}TRACK_END ", bars(2));
        let bar_reply = "NOTE_ON=67 BAR_END TRACK_END ";
        let oracle = ScriptedOracle::new(&[&track_reply, &track_reply, bar_reply]);
        let mut generator = Generator::new(oracle, config(2), Some(1));
        let drums = TrackConfig::new(Instrument::Drums, 1, 0.5);
        generator.generate_piece(&[piano(), drums]).unwrap();

        generator.generate_n_more_bars(3, Some(-1)).unwrap();
        assert_eq!(generator.piece().track(0).unwrap().bar_count(), 2);
        assert_eq!(generator.piece().track(1).unwrap().bar_count(), 5);

        generator.generate_n_more_bars(1, None).unwrap();
        assert_eq!(generator.piece().track(0).unwrap().bar_count(), 3);
        assert_eq!(generator.piece().track(1).unwrap().bar_count(), 6);
    }

    #[test]
    fn test_check_for_errors() {
        let generator = Generator::new(ScriptedOracle::new(&[]), config(2), Some(1));
        assert_eq!(
            generator.check_for_errors("PIECE_START TRACK_START INST=0 BAR_START BAR_END"),
            0
        );
        assert_eq!(
            generator.check_for_errors("PIECE_START UNK TRACK_START NOTE_ON=999 TRACK_END"),
            2
        );
    }

    #[test]
    fn test_error_context_is_symmetric() {
        let tokens: Vec<&str> = "a b c d e f X g h i j k l".split_whitespace().collect();
        assert_eq!(error_context(&tokens, 6), "b c d e f X g h i j k");
        assert_eq!(error_context(&tokens, 0), "a b c d e f");
        assert_eq!(error_context(&tokens, 12), "g h i j k l");
    }

    #[test]
    fn test_track_management() {
        let reply = format!("{}TRACK_END ", bars(2));
        let mut generator = Generator::new(ScriptedOracle::new(&[&reply]), config(2), Some(1));
        generator.generate_piece(&[piano(), piano()]).unwrap();

        generator.reset_temperature(0, 1.2).unwrap();
        assert!((generator.piece().track(0).unwrap().temperature - 1.2).abs() < f32::EPSILON);

        let removed = generator.delete_track(-1).unwrap();
        assert_eq!(removed.label, "track_1");
        assert_eq!(generator.piece().track_count(), 1);
        assert!(generator.delete_track(3).is_err());
    }

    #[test]
    fn test_save_and_resume_session() {
        let reply = format!("{}TRACK_END ", bars(2));
        let mut generator = Generator::new(ScriptedOracle::new(&[&reply]), config(2), Some(1));
        generator.generate_piece(&[piano()]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = generator.save_session(dir.path()).unwrap();
        let record = SessionRecord::load_from_file(&path).unwrap();
        assert_eq!(record.generated_midi, generator.piece_text());

        let resumed =
            Generator::from_session(ScriptedOracle::new(&[]), config(2), &record, Some(1));
        assert_eq!(resumed.piece_text(), generator.piece_text());
    }
}
