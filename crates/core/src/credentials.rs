//! Parsing of the engine's output file into recovered credentials.
//!
//! The engine is run with `--outfile-format=1,2`, so each line is the
//! cracked hash line followed by the plaintext:
//!
//! ```text
//! <field 1>:...:<field N>:<secret>
//! ```
//!
//! For the WPA modes the hash line has four fields,
//! `mic:mac_ap:mac_sta:essid`, and the whole hash line is the identifier.
//! The line is split after the Nth delimiter not preceded by a backslash, so
//! the secret may itself contain delimiters. Lines with too few delimiters
//! are skipped; they never abort parsing of the lines after them.

use serde::{Deserialize, Serialize};

const DELIMITER: char = ':';
const ESCAPE: char = '\\';

/// A single recovered secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrackedEntry {
    pub identifier: String,
    pub secret: String,
}

/// Parse one output line whose identifier spans `identifier_fields`
/// delimiter-separated fields. Returns `None` for blank or short lines.
pub fn parse_line(line: &str, identifier_fields: usize) -> Option<CrackedEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let mut identifier = String::new();
    let mut seen = 0;
    let mut chars = line.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some((_, escaped)) => identifier.push(escaped),
                None => identifier.push(ESCAPE),
            },
            DELIMITER => {
                seen += 1;
                if seen < identifier_fields.max(1) {
                    identifier.push(DELIMITER);
                    continue;
                }
                if identifier.is_empty() {
                    return None;
                }
                let secret = decode_hex_plaintext(&line[idx + DELIMITER.len_utf8()..]);
                return Some(CrackedEntry { identifier, secret });
            }
            other => identifier.push(other),
        }
    }
    None
}

/// Parse a whole output file's contents, skipping malformed lines.
pub fn parse_output(contents: &str, identifier_fields: usize) -> Vec<CrackedEntry> {
    contents
        .lines()
        .filter_map(|line| parse_line(line, identifier_fields))
        .collect()
}

/// Decode the engine's `$HEX[...]` encoding for non-printable plaintexts.
///
/// Anything that is not a well-formed hex wrapper is returned unchanged.
pub fn decode_hex_plaintext(secret: &str) -> String {
    let Some(hex) = secret
        .strip_prefix("$HEX[")
        .and_then(|s| s.strip_suffix(']'))
    else {
        return secret.to_string();
    };
    if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return secret.to_string();
    }
    let bytes: Vec<u8> = (0..hex.len())
        .step_by(2)
        .filter_map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
