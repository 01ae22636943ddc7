//! Parallel encoding of a directory of MIDI files.
//!
//! Every file is encoded on its own; a file that fails is reported and
//! skipped. Output mirrors the input layout with a `.txt` extension.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::codec::MidiEncoder;
use crate::config::CodecConfig;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Worker threads. 0 uses every core.
    pub jobs: usize,
    /// Descend into subdirectories.
    pub recursive: bool,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Text files written.
    pub encoded: Vec<PathBuf>,
    /// Input files that could not be encoded, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

/// Lists the MIDI files under `dir`, sorted.
///
/// # Errors
///
/// Returns `BatchError::ReadDir` if a directory cannot be listed
pub fn collect_midi_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, BatchError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|source| BatchError::ReadDir {
            path: current.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if is_midi(&path) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn is_midi(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            ext == "mid" || ext == "midi"
        })
        .unwrap_or(false)
}

/// Encodes every MIDI file under `input` into `output`.
///
/// # Arguments
///
/// * `input` - Directory to scan
/// * `output` - Directory for the `.txt` files, created as needed
/// * `config` - Codec settings shared by every worker
/// * `options` - Thread count and recursion
///
/// # Errors
///
/// Returns error only if the input cannot be listed or the pool cannot
/// start. Per-file failures land in the report.
pub fn encode_directory(
    input: &Path,
    output: &Path,
    config: &CodecConfig,
    options: BatchOptions,
) -> Result<BatchReport, BatchError> {
    let files = collect_midi_files(input, options.recursive)?;
    info!(files = files.len(), input = %input.display(), "encoding directory");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs)
        .build()?;
    let encoder = MidiEncoder::new(config.clone());

    let results: Vec<Result<PathBuf, (PathBuf, String)>> = pool.install(|| {
        files
            .par_iter()
            .map(|path| encode_one(&encoder, input, output, path).map_err(|e| (path.clone(), e)))
            .collect()
    });

    let mut report = BatchReport::default();
    for result in results {
        match result {
            Ok(path) => report.encoded.push(path),
            Err((path, message)) => {
                warn!(path = %path.display(), error = %message, "failed to encode");
                report.failed.push((path, message));
            }
        }
    }
    info!(
        encoded = report.encoded.len(),
        failed = report.failed.len(),
        "batch finished"
    );
    Ok(report)
}

fn encode_one(
    encoder: &MidiEncoder,
    input: &Path,
    output: &Path,
    path: &Path,
) -> Result<PathBuf, String> {
    let text = encoder.encode_file(path).map_err(|e| e.to_string())?;
    let relative = path.strip_prefix(input).unwrap_or(path);
    let target = output.join(relative).with_extension("txt");
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs::write(&target, text).map_err(|e| e.to_string())?;
    Ok(target)
}
