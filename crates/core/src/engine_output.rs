//! Parsing of the cracking engine's periodic status blocks.
//!
//! The engine prints a block of `Label....: value` lines every status-timer
//! tick, separated from the next block by a delimiter (a blank line by
//! default). Each field is extracted by its own regex so a malformed or
//! shifted block loses only the affected fields.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Progress\.*:\s*(\d+)/(\d+)\s*\((\d+(?:\.\d+)?)%\)").expect("valid regex")
});

static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Speed\.#(\*|\d+)\.*:\s*(\d+(?:\.\d+)?)\s*([kMGTP]?H/s)").expect("valid regex")
});

static ETA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Time\.Estimated\.*:[^(\n]*\(([^)\n]*)\)").expect("valid regex")
});

static ETA_PART_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*(day|hour|min|sec)s?").expect("valid regex")
});

static RECOVERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Recovered\.*:\s*(\d+)/(\d+)").expect("valid regex")
});

static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Status\.*:[ \t]*(\S[^\r\n]*?)[ \t]*$").expect("valid regex"));

/// Default separator between status blocks.
pub const DEFAULT_BLOCK_DELIMITER: &str = "\n\n";

// ---------------------------------------------------------------------------
// Throughput
// ---------------------------------------------------------------------------

/// Hash-rate units the engine reports, with their multiplier to H/s.
const SPEED_UNITS: [(&str, f64); 6] = [
    ("H/s", 1.0),
    ("kH/s", 1e3),
    ("MH/s", 1e6),
    ("GH/s", 1e9),
    ("TH/s", 1e12),
    ("PH/s", 1e15),
];

/// Look up the H/s multiplier for an engine unit string.
pub fn unit_multiplier(unit: &str) -> Option<f64> {
    SPEED_UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, m)| *m)
}

/// A throughput reading as printed plus its normalized value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub value: f64,
    pub unit: String,
    pub hashes_per_sec: f64,
}

impl Throughput {
    /// Human-readable form, e.g. `412.3 kH/s`.
    pub fn display(&self) -> String {
        format!("{} {}", self.value, self.unit)
    }
}

// ---------------------------------------------------------------------------
// StatusSample
// ---------------------------------------------------------------------------

/// Fields extracted from one status block. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSample {
    /// Engine state label, e.g. `Running`, `Exhausted`, `Cracked`.
    pub stage: Option<String>,
    pub percentage: Option<f64>,
    pub progress_done: Option<u64>,
    pub progress_total: Option<u64>,
    pub throughput: Option<Throughput>,
    pub eta_secs: Option<u64>,
    pub recovered: Option<u64>,
    pub recovered_total: Option<u64>,
}

impl StatusSample {
    /// True when no field could be extracted.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// One-line description of the current action for the UI.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(stage) = &self.stage {
            parts.push(stage.clone());
        }
        if let Some(p) = self.percentage {
            parts.push(format!("{p:.2}%"));
        }
        if let Some(t) = &self.throughput {
            parts.push(format!("at {}", t.display()));
        }
        if let (Some(r), Some(total)) = (self.recovered, self.recovered_total) {
            parts.push(format!("recovered {r}/{total}"));
        }
        parts.join(", ")
    }
}

/// Extract every recognizable field from one status block.
pub fn parse_status_block(block: &str) -> StatusSample {
    let mut sample = StatusSample::default();

    if let Some(caps) = PROGRESS_RE.captures(block) {
        sample.progress_done = caps[1].parse().ok();
        sample.progress_total = caps[2].parse().ok();
        sample.percentage = caps[3]
            .parse::<f64>()
            .ok()
            .map(|p| p.clamp(0.0, 100.0));
    }

    sample.throughput = parse_throughput(block);
    sample.eta_secs = ETA_RE.captures(block).and_then(|c| parse_eta(&c[1]));

    if let Some(caps) = RECOVERED_RE.captures(block) {
        sample.recovered = caps[1].parse().ok();
        sample.recovered_total = caps[2].parse().ok();
    }

    sample.stage = STATUS_RE.captures(block).map(|c| c[1].to_string());

    sample
}

/// Prefer the aggregate `Speed.#*` line; fall back to the first device.
fn parse_throughput(block: &str) -> Option<Throughput> {
    let mut first = None;
    for caps in SPEED_RE.captures_iter(block) {
        let value: f64 = match caps[2].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let unit = caps[3].to_string();
        let Some(multiplier) = unit_multiplier(&unit) else {
            continue;
        };
        let reading = Throughput {
            value,
            hashes_per_sec: value * multiplier,
            unit,
        };
        if &caps[1] == "*" {
            return Some(reading);
        }
        if first.is_none() {
            first = Some(reading);
        }
    }
    first
}

/// Convert `1 hour, 2 mins, 3 secs` style text to seconds.
///
/// Returns `None` for text without any recognizable unit (e.g. `Unknown`).
pub fn parse_eta(text: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut matched = false;
    for caps in ETA_PART_RE.captures_iter(text) {
        let n: u64 = caps[1].parse().ok()?;
        let factor = match &caps[2] {
            "day" => 86_400,
            "hour" => 3_600,
            "min" => 60,
            _ => 1,
        };
        total = total.saturating_add(n.saturating_mul(factor));
        matched = true;
    }
    matched.then_some(total)
}

// ---------------------------------------------------------------------------
// Block splitting
// ---------------------------------------------------------------------------

/// Accumulates raw stdout and yields complete status blocks.
///
/// Carriage returns are dropped so CRLF output splits like LF output.
#[derive(Debug)]
pub struct BlockSplitter {
    delimiter: String,
    buf: String,
}

impl BlockSplitter {
    pub fn new(delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        Self {
            delimiter: if delimiter.is_empty() {
                DEFAULT_BLOCK_DELIMITER.to_string()
            } else {
                delimiter
            },
            buf: String::new(),
        }
    }

    /// Append a chunk and drain every block terminated by the delimiter.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.extend(chunk.chars().filter(|c| *c != '\r'));

        let mut blocks = Vec::new();
        while let Some(idx) = self.buf.find(&self.delimiter) {
            let block: String = self.buf.drain(..idx + self.delimiter.len()).collect();
            let block = block[..idx].trim();
            if !block.is_empty() {
                blocks.push(block.to_string());
            }
        }
        blocks
    }

    /// Return whatever trailing text never saw a delimiter.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

impl Default for BlockSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_DELIMITER)
    }
}

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

/// How the engine's exit code should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// At least one hash was recovered.
    Cracked,
    /// The keyspace was exhausted, or the runtime ceiling was reached.
    Exhausted,
    /// Anything else: engine error, abort, or killed by a signal.
    Error,
}

/// Classify an engine exit code. `None` means the process died by signal.
pub fn classify_exit(code: Option<i32>) -> ExitKind {
    match code {
        Some(0) => ExitKind::Cracked,
        // 4: aborted by the --runtime limit, same as running out of candidates.
        Some(1) | Some(4) => ExitKind::Exhausted,
        _ => ExitKind::Error,
    }
}
