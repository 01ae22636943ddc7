//! String helpers over generated track text.
//!
//! All of these work on whitespace-separated tokens and return text in the
//! canonical form the rest of the crate emits: every token followed by a
//! single space.

use crate::tokens::vocab::{BAR_END, BAR_START, TRACK_END, TRACK_START};

/// Removes every trailing `TRACK_END` token.
///
/// The result keeps a trailing space when anything is left.
pub fn strip_track_ends(text: &str) -> String {
    let mut rest = text.trim_end();
    while let Some(head) = rest.strip_suffix(TRACK_END) {
        if !(head.is_empty() || head.ends_with(char::is_whitespace)) {
            break;
        }
        rest = head.trim_end();
    }
    if rest.is_empty() {
        String::new()
    } else {
        format!("{rest} ")
    }
}

/// Splits a piece into `TRACK_START ... TRACK_END ` segments.
///
/// Tokens outside a track are ignored. A track left open at the end of the
/// text is closed.
pub fn extract_tracks(piece: &str) -> Vec<String> {
    let mut tracks = Vec::new();
    let mut current: Option<String> = None;

    for token in piece.split_whitespace() {
        if token == TRACK_START {
            if let Some(open) = current.take() {
                tracks.push(close_track(open));
            }
            current = Some(format!("{TRACK_START} "));
            continue;
        }
        let Some(open) = current.as_mut() else {
            continue;
        };
        open.push_str(token);
        open.push(' ');
        if token == TRACK_END {
            if let Some(done) = current.take() {
                tracks.push(done);
            }
        }
    }
    if let Some(open) = current {
        tracks.push(close_track(open));
    }
    tracks
}

fn close_track(mut open: String) -> String {
    open.push_str(TRACK_END);
    open.push(' ');
    open
}

/// Returns the last track segment of a piece.
pub fn get_last_track(piece: &str) -> Option<String> {
    extract_tracks(piece).pop()
}

/// Joins track segments into one string.
pub fn combine_tracks(tracks: &[String]) -> String {
    tracks.concat()
}

/// Returns what the oracle appended after the prompt.
///
/// Oracle output is expected to start with the prompt; when it doesn't, the
/// first `prompt.len()` bytes are still treated as the echoed prompt.
pub fn get_new_content<'a>(full: &'a str, prompt: &str) -> &'a str {
    match full.strip_prefix(prompt) {
        Some(rest) => rest,
        None => full.get(prompt.len()..).unwrap_or(""),
    }
}

/// Pulls the last bar out of a prompt plus continuation.
///
/// The text after the final `BAR_START` is the new bar; any trailing
/// `TRACK_END` is dropped and the `BAR_START` prefix restored.
pub fn extract_new_bar(text: &str) -> String {
    let marker = format!("{BAR_START} ");
    let last = match text.rfind(&marker) {
        Some(at) => &text[at + marker.len()..],
        None => text,
    };
    format!("{marker}{}", strip_track_ends(last))
}

/// Counts `BAR_END` tokens.
pub fn count_bars(text: &str) -> usize {
    text.split_whitespace().filter(|token| *token == BAR_END).count()
}

/// Cuts generated text after its `bars`-th `BAR_END` and closes the track.
///
/// The returned text holds exactly `bars` `BAR_END` tokens followed by one
/// `TRACK_END`.
pub fn truncate_to_bars(generated: &str, bars: usize) -> String {
    let mut out = String::new();
    let mut seen = 0;
    for token in generated.split_whitespace() {
        if seen == bars {
            break;
        }
        if token == TRACK_END {
            continue;
        }
        out.push_str(token);
        out.push(' ');
        if token == BAR_END {
            seen += 1;
        }
    }
    out.push_str(TRACK_END);
    out.push(' ');
    out
}
