//! jamtext - command-line front end for the MIDI/text codec.
//!
//! # Usage
//!
//! ```bash
//! jamtext encode song.mid -o song.txt        # MIDI to token text
//! jamtext encode song.mid --by-section       # one line per section group
//! jamtext decode song.txt -o song.mid        # token text or session JSON to MIDI
//! jamtext batch midi/ text/ --jobs 8 -r      # encode a whole directory
//! jamtext vocab                              # list every grammar token
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use jamtext::batch::{encode_directory, BatchOptions};
use jamtext::tokens::vocab::full_vocabulary;
use jamtext::tokens::ReverseMode;
use jamtext::{Config, MidiEncoder, TextDecoder};

#[derive(Parser)]
#[command(name = "jamtext")]
#[command(about = "Convert MIDI files to text tokens and back")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a MIDI file as token text
    Encode {
        /// Input .mid file
        input: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Bars per section
        #[arg(long)]
        n_bar: Option<usize>,

        /// Write one line per section group instead of one piece
        #[arg(long)]
        by_section: bool,
    },

    /// Decode token text or a session file into a MIDI file
    Decode {
        /// Input .txt or session .json
        input: PathBuf,

        /// Output .mid file
        #[arg(short, long)]
        output: PathBuf,

        /// Seed for the family to program choice
        #[arg(long)]
        seed: Option<u64>,

        /// Pick programs from each family's full range
        #[arg(long)]
        full_range: bool,
    },

    /// Encode every MIDI file in a directory
    Batch {
        /// Directory of MIDI files
        input: PathBuf,

        /// Directory for the text files
        output: PathBuf,

        /// Worker threads (0 = all cores)
        #[arg(short, long, default_value = "0")]
        jobs: usize,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Print the token vocabulary, one token per line
    Vocab,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Encode {
            input,
            output,
            n_bar,
            by_section,
        } => {
            if let Some(n_bar) = n_bar {
                config.codec.n_bar = n_bar;
            }
            let encoder = MidiEncoder::new(config.codec);
            let text = if by_section {
                let tracks = jamtext::midi::import_from_midi(&input)
                    .with_context(|| format!("Failed to import {}", input.display()))?;
                encoder.encode_by_section(&tracks).join("\n")
            } else {
                encoder
                    .encode_file(&input)
                    .with_context(|| format!("Failed to encode {}", input.display()))?
            };
            match output {
                Some(path) => fs::write(&path, text)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{}", text),
            }
        }
        Commands::Decode {
            input,
            output,
            seed,
            full_range,
        } => {
            if seed.is_some() {
                config.codec.seed = seed;
            }
            if full_range {
                config.codec.reverse_mode = ReverseMode::FullRange;
            }
            let settings = config.codec.export_settings();
            let mut decoder = TextDecoder::new(config.codec);
            let piece = decoder
                .decode_file(&input)
                .with_context(|| format!("Failed to decode {}", input.display()))?;
            piece.write_midi(settings, &output)?;
            eprintln!(
                "Wrote {} track(s) to {}",
                piece.tracks.len(),
                output.display()
            );
        }
        Commands::Batch {
            input,
            output,
            jobs,
            recursive,
        } => {
            let options = BatchOptions { jobs, recursive };
            let report = encode_directory(&input, &output, &config.codec, options)?;
            eprintln!(
                "Encoded {} file(s), {} failed",
                report.encoded.len(),
                report.failed.len()
            );
            for (path, error) in &report.failed {
                eprintln!("  {}: {}", path.display(), error);
            }
        }
        Commands::Vocab => {
            for token in full_vocabulary(&config.codec) {
                println!("{}", token);
            }
        }
    }

    Ok(())
}
