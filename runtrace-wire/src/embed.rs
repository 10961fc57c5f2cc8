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

//! Embedded trace extraction and embedding
//!
//! A report artifact carries the raw trace as a JS array literal of
//! zlib-compressed, base64-encoded chunks, introduced by a fixed
//! marker. Extraction scans for the marker, decodes every quoted chunk,
//! and concatenates the decompressed text back into the line stream.
//!
//! When the artifact itself lacks the marker (dev builds keep the data
//! in the script bundle next to it), a sibling `bundle.js` is tried
//! before giving up.

use crate::decode::{decode_all, Decoded};
use crate::error::{Result, WireError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::Path;

/// Marker introducing the embedded chunk array.
pub const CHUNK_MARKER: &str = "let chunks = [";

const CHUNK_END: &str = "];";

/// Default uncompressed size of one embedded chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Compress `trace` into the embeddable JS array literal, marker and
/// terminator included.
pub fn embed_chunks(trace: &str, chunk_size: usize) -> Result<String> {
    let mut out = String::from(CHUNK_MARKER);
    let bytes = trace.as_bytes();
    let mut first = true;
    for chunk in bytes.chunks(chunk_size.max(1)) {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(chunk)?;
        let compressed = encoder.finish()?;
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str("\n\"");
        out.push_str(&BASE64.encode(compressed));
        out.push('"');
    }
    out.push('\n');
    out.push_str(CHUNK_END);
    Ok(out)
}

/// Recover the raw trace text from artifact text containing the chunk
/// array.
pub fn extract_from_text(text: &str) -> Result<String> {
    let start = text
        .find(CHUNK_MARKER)
        .ok_or_else(|| WireError::MarkerNotFound("<text>".into()))?;
    let body_start = start + CHUNK_MARKER.len();
    let end = text[body_start..]
        .find(CHUNK_END)
        .ok_or_else(|| WireError::MarkerNotFound("<text>".into()))?;
    let body = &text[body_start..body_start + end];

    let mut trace = String::new();
    for chunk in quoted_strings(body) {
        let compressed = BASE64.decode(chunk.as_bytes())?;
        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        let mut piece = Vec::new();
        decoder.read_to_end(&mut piece)?;
        trace.push_str(&String::from_utf8(piece)?);
    }
    Ok(trace)
}

/// Read the trace embedded in a report artifact, falling back to a
/// sibling `bundle.js` when the artifact carries no chunk array.
pub fn extract_from_artifact(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)?;
    if text.contains(CHUNK_MARKER) {
        return extract_from_text(&text);
    }
    if let Some(parent) = path.parent() {
        let bundle = parent.join("bundle.js");
        if bundle.exists() {
            let text = std::fs::read_to_string(&bundle)?;
            if text.contains(CHUNK_MARKER) {
                return extract_from_text(&text);
            }
        }
    }
    Err(WireError::MarkerNotFound(path.display().to_string()))
}

/// Fully decode the trace embedded in a report artifact.
pub fn iter_decoded_from_artifact(path: &Path) -> Result<Vec<Decoded>> {
    let trace = extract_from_artifact(path)?;
    decode_all(&trace)
}

/// Quoted string literals inside the array body, in order. Base64
/// payloads never contain escapes, so no escape handling is needed.
fn quoted_strings(body: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let Some(open) = rest.find(|c| c == '"' || c == '\'') else {
            return out;
        };
        let quote = rest.as_bytes()[open] as char;
        let after = &rest[open + 1..];
        let Some(close) = after.find(quote) else {
            return out;
        };
        out.push(&after[..close]);
        rest = &after[close + 1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "V 0.0.1\nM 1:\"suite\"\nSR 1|0.000\n";

    #[test]
    fn test_embed_then_extract_roundtrip() {
        let embedded = embed_chunks(TRACE, DEFAULT_CHUNK_SIZE).unwrap();
        assert!(embedded.starts_with(CHUNK_MARKER));
        let text = format!("<html><script>{embedded}</script></html>");
        assert_eq!(extract_from_text(&text).unwrap(), TRACE);
    }

    #[test]
    fn test_multiple_chunks_concatenate_in_order() {
        // Chunk boundary in the middle of a line must not matter.
        let embedded = embed_chunks(TRACE, 8).unwrap();
        assert!(embedded.matches('"').count() > 2);
        assert_eq!(extract_from_text(&embedded).unwrap(), TRACE);
    }

    #[test]
    fn test_missing_marker_is_an_error() {
        assert!(matches!(
            extract_from_text("<html>no data here</html>"),
            Err(WireError::MarkerNotFound(_))
        ));
    }

    #[test]
    fn test_artifact_falls_back_to_sibling_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let html = dir.path().join("log.html");
        std::fs::write(&html, "<html>dev build</html>").unwrap();
        let embedded = embed_chunks(TRACE, DEFAULT_CHUNK_SIZE).unwrap();
        std::fs::write(dir.path().join("bundle.js"), embedded).unwrap();

        assert_eq!(extract_from_artifact(&html).unwrap(), TRACE);
    }

    #[test]
    fn test_decoded_from_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let html = dir.path().join("log.html");
        let embedded = embed_chunks(TRACE, DEFAULT_CHUNK_SIZE).unwrap();
        std::fs::write(&html, format!("<script>{embedded}</script>")).unwrap();

        let decoded = iter_decoded_from_artifact(&html).unwrap();
        assert_eq!(decoded[0].message_type, "V");
        assert_eq!(decoded[1].message_type, "SR");
    }
}
