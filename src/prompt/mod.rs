//! Text patterns recognised in target program output.
//!
//! Everything here works on *ANSI-stripped* text: the target draws a TUI, so
//! the raw PTY stream is mostly cursor movement and mode switches. Three
//! families of patterns live in this module:
//!
//! - **Version-gate banners**: the target refusing to start because its
//!   runtime is too old. A banner is recognised by a fixed set of phrases and
//!   the required version is pulled out by an ordered table of phrasings.
//! - **Trust prompt**: the "do you trust this folder" confirmation shown on
//!   first run in an unknown directory.
//! - **Session ids**: an opaque id the target prints, kept for cleanup.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

/// Case-sensitive phrases that mark a version-gate banner.
pub const VERSION_GATE_PHRASES: &[&str] =
    &["needs update", "newer version", "requires", "minimum version"];

/// Default trust prompt needles.
pub const DEFAULT_TRUST_PROMPT_PATTERNS: &[&str] =
    &["Do you trust the files in this folder?", "Yes, proceed"];

/// Which phrasing a minimum version was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPhrasing {
    /// `1.0.24 or higher`
    OrHigher,
    /// `version (1.0.24`
    Parenthesized,
    /// `requires 1.0.24`
    Requires,
    /// `minimum version: 1.0.24`
    MinimumVersion,
    /// `v1.0.24+`
    PlusSuffix,
}

/// A version token pulled out of a banner.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMatch {
    pub phrasing: VersionPhrasing,
    pub version: String,
}

/// A recognised version-gate banner.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionGate {
    /// The gate phrase that triggered the match.
    pub phrase: &'static str,
    /// The stripped output line containing the phrase.
    pub message: String,
    /// Extracted version, `None` when no phrasing matched.
    pub version: Option<VersionMatch>,
}

/// Ordered minimum-version phrasings. First match wins.
pub struct VersionPatterns {
    patterns: Vec<(VersionPhrasing, Regex)>,
}

impl Default for VersionPatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionPatterns {
    pub fn new() -> Self {
        const VER: &str = r"(\d+(?:\.\d+)+)";
        let build = |pattern: String| Regex::new(&pattern).unwrap();
        Self {
            patterns: vec![
                (
                    VersionPhrasing::OrHigher,
                    build(format!(r"v?{VER} or higher")),
                ),
                (
                    VersionPhrasing::Parenthesized,
                    build(format!(r"version \(v?{VER}")),
                ),
                (VersionPhrasing::Requires, build(format!(r"requires v?{VER}"))),
                (
                    VersionPhrasing::MinimumVersion,
                    build(format!(r"minimum version: v?{VER}")),
                ),
                (VersionPhrasing::PlusSuffix, build(format!(r"v{VER}\+"))),
            ],
        }
    }

    /// Extract the required version from (stripped) banner text.
    pub fn extract(&self, text: &str) -> Option<VersionMatch> {
        self.patterns.iter().find_map(|(phrasing, regex)| {
            regex.captures(text).map(|caps| VersionMatch {
                phrasing: *phrasing,
                version: caps[1].to_string(),
            })
        })
    }

    /// Look for a version-gate banner in stripped output.
    pub fn detect_gate(&self, text: &str) -> Option<VersionGate> {
        let phrase = gate_phrase(text)?;

        let message = text
            .lines()
            .find(|line| line.contains(phrase))
            .map(|line| line.trim().to_string())
            .unwrap_or_default();

        Some(VersionGate {
            phrase,
            message,
            version: self.extract(text),
        })
    }
}

/// Trust confirmation prompt matcher (plain substring needles).
#[derive(Debug, Clone)]
pub struct TrustPrompt {
    needles: Vec<String>,
}

impl Default for TrustPrompt {
    fn default() -> Self {
        Self::new(
            DEFAULT_TRUST_PROMPT_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl TrustPrompt {
    pub fn new(needles: Vec<String>) -> Self {
        Self {
            needles: needles.into_iter().filter(|n| !n.is_empty()).collect(),
        }
    }

    /// Returns the needle found in `text`, if any.
    pub fn detect(&self, text: &str) -> Option<&str> {
        self.needles
            .iter()
            .find(|needle| text.contains(needle.as_str()))
            .map(String::as_str)
    }
}

/// Pull a session id out of stripped output.
///
/// Accepts `session id`, `session_id`, `session-id` and `sessionId` labels in
/// any case, followed by a UUID.
pub fn extract_session_id(text: &str) -> Option<String> {
    static SESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r#"(?i)session[ _-]?id["']?\s*[:=]?\s*["']?([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})"#,
        )
        .unwrap()
    });
    let caps = SESSION_RE.captures(text)?;
    Uuid::parse_str(&caps[1]).ok().map(|id| id.to_string())
}

/// First version-gate phrase present in `text`, in table order.
pub fn gate_phrase(text: &str) -> Option<&'static str> {
    VERSION_GATE_PHRASES
        .iter()
        .copied()
        .find(|phrase| text.contains(phrase))
}

// CSI sequences per ECMA-48 (parameter, intermediate, final byte ranges),
// OSC sequences (ESC ] ... BEL or ST), and simple two-byte escapes.
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
});

/// Longest unterminated escape held back between chunks. Anything older is
/// passed through as text.
const MAX_PENDING_ESCAPE: usize = 256;

/// Strip ANSI escape sequences from PTY output.
pub fn strip_ansi(input: &str) -> String {
    ANSI_RE.replace_all(input, "").to_string()
}

/// Chunk-at-a-time [`strip_ansi`].
///
/// An escape sequence split across chunks is held back until it completes,
/// so the concatenated output matches stripping the whole stream at once.
#[derive(Debug, Default)]
pub struct AnsiStripper {
    pending: String,
}

impl AnsiStripper {
    /// Strip `chunk`, returning the text that is now known to be complete.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let split = incomplete_escape_start(&self.pending);
        let tail = self.pending.split_off(split);
        let complete = std::mem::replace(&mut self.pending, tail);
        strip_ansi(&complete)
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> String {
        strip_ansi(&std::mem::take(&mut self.pending))
    }
}

/// Byte offset of the first escape near the end of `text` that has not
/// terminated yet, or `text.len()` when every escape is complete.
fn incomplete_escape_start(text: &str) -> usize {
    let floor = text.len().saturating_sub(MAX_PENDING_ESCAPE);
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('\x1b') {
        let esc = pos + offset;
        match ANSI_RE.find_at(text, esc) {
            Some(m) if m.start() == esc => pos = m.end(),
            _ if esc >= floor => return esc,
            _ => pos = esc + 1,
        }
    }
    text.len()
}
