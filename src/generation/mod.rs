//! Multi-track, multi-bar generation on top of the token grammar.
//!
//! The [`Generator`] keeps the piece state, builds prompts and enforces the
//! bar count of every completion it receives from a [`CompletionOracle`].

pub mod generate;
pub mod piece;
pub mod prompt;
pub mod session;
pub mod track_text;

pub use generate::{
    judge_attempt, AttemptVerdict, CompletionOracle, CompletionRequest, GenerationError,
    Generator, TrackConfig,
};
pub use piece::{Piece, PieceError, TrackState};
pub use prompt::PromptBuilder;
pub use session::{SessionError, SessionRecord};
