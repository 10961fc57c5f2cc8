// Copyright 2025 Runtrace Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtrace CLI
//!
//! Command-line interface for inspecting trace outputs: decode raw
//! `.robolog` segments, extract traces embedded in report artifacts,
//! and re-embed raw traces as artifact chunks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runtrace_sink::JsonStreamer;
use runtrace_wire::{embed_chunks, extract_from_artifact, iter_decoded, DEFAULT_CHUNK_SIZE};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(name = "runtrace")]
#[command(about = "Runtrace - execution trace inspection", long_about = None)]
struct Cli {
    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a raw trace segment to JSON lines
    Decode {
        /// Path to the .robolog file (`-` for stdin)
        path: PathBuf,
    },

    /// Extract the trace embedded in a report artifact
    Extract {
        /// Path to the artifact (e.g. log.html)
        path: PathBuf,

        /// Print raw trace lines instead of decoded JSON
        #[arg(long)]
        raw: bool,
    },

    /// Compress a raw trace into embeddable artifact chunks
    Embed {
        /// Path to the .robolog file
        path: PathBuf,

        /// Uncompressed chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Decode trace lines from stdin to JSON as they arrive
    Stream,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Decode { path } => {
            if path.as_os_str() == "-" {
                decode_stream(BufReader::new(std::io::stdin().lock()))?;
            } else {
                let file = File::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                decode_stream(BufReader::new(file))?;
            }
        }

        Commands::Extract { path, raw } => {
            let trace = extract_from_artifact(&path)
                .with_context(|| format!("no embedded trace in {}", path.display()))?;
            if raw {
                print!("{trace}");
            } else {
                decode_stream(BufReader::new(trace.as_bytes()))?;
            }
        }

        Commands::Embed { path, chunk_size } => {
            let trace = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let embedded = embed_chunks(&trace, chunk_size)?;
            println!("{embedded}");
        }

        Commands::Stream => {
            let mut streamer = JsonStreamer::spawn(std::io::stdout());
            for line in BufReader::new(std::io::stdin().lock()).lines() {
                streamer.push_line(&line?);
            }
            streamer.shutdown();
        }
    }

    Ok(())
}

fn decode_stream<R: BufRead>(reader: R) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for decoded in iter_decoded(reader) {
        let decoded = decoded?;
        let mut map = Map::new();
        map.insert("message_type".into(), Value::String(decoded.message_type));
        for (name, value) in decoded.fields {
            map.insert(name, value);
        }
        if let Some(error) = decoded.error {
            map.insert("error".into(), Value::String(error));
        }
        writeln!(out, "{}", Value::Object(map))?;
    }
    Ok(())
}
