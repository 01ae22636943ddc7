//! Token vocabulary and instrument families.

pub mod event;
pub mod family;
pub mod vocab;

pub use event::{Duration, Event, Instrument, InvalidInstrument};
pub use family::{family_of, FamilyError, FamilyMapper, ReverseMode};
pub use vocab::{events_to_text, parse_token, token_text};
