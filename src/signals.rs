//! Ready-signal classification.
//!
//! An interactive target never says "ready". Instead it switches the terminal
//! into the modes an input line needs and draws a prompt. Three independent
//! signals are tracked:
//!
//! - bracketed paste enabled (`ESC [ ? 2004 h`)
//! - focus reporting enabled (`ESC [ ? 1004 h`)
//! - a `> ` prompt in the ANSI-stripped text
//!
//! They arrive in any order and may be split across PTY reads, so each check
//! looks at the latest chunk plus a short window of the output before it.
//! Flags are sticky: once set they stay set for the trial.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::prompt::strip_ansi;

/// Control sequence that enables bracketed paste mode.
pub const BRACKETED_PASTE_ON: &str = "\x1b[?2004h";
/// Control sequence that enables focus event reporting.
pub const FOCUS_EVENTS_ON: &str = "\x1b[?1004h";

/// Bytes of earlier output re-examined with each chunk. Longer than any
/// sequence above.
const BOUNDARY_WINDOW: usize = 16;

static PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s").unwrap());

/// Sticky set of ready signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadySignals {
    bracketed_paste: bool,
    focus_events: bool,
    prompt: bool,
}

impl ReadySignals {
    pub fn bracketed_paste(&self) -> bool {
        self.bracketed_paste
    }

    pub fn focus_events(&self) -> bool {
        self.focus_events
    }

    pub fn prompt(&self) -> bool {
        self.prompt
    }

    /// All three signals observed.
    pub fn is_complete(&self) -> bool {
        self.bracketed_paste && self.focus_events && self.prompt
    }

    pub fn set_bracketed_paste(&mut self) {
        self.bracketed_paste = true;
    }

    pub fn set_focus_events(&mut self) {
        self.focus_events = true;
    }

    pub fn set_prompt(&mut self) {
        self.prompt = true;
    }

    /// Scan the newest output and raise any signal it carries.
    ///
    /// `cumulative` is all output so far (ending with `latest`). Returns true
    /// if at least one flag went from unset to set.
    pub fn observe(&mut self, cumulative: &str, latest: &str) -> bool {
        let before = *self;
        let window = boundary_window(cumulative, latest);

        if !self.bracketed_paste && window.contains(BRACKETED_PASTE_ON) {
            self.set_bracketed_paste();
        }
        if !self.focus_events && window.contains(FOCUS_EVENTS_ON) {
            self.set_focus_events();
        }
        if !self.prompt && PROMPT_RE.is_match(&strip_ansi(window)) {
            self.set_prompt();
        }

        *self != before
    }
}

/// The latest chunk extended backwards into the cumulative output.
fn boundary_window<'a>(cumulative: &'a str, latest: &'a str) -> &'a str {
    if !cumulative.ends_with(latest) {
        return latest;
    }
    let chunk_start = cumulative.len() - latest.len();
    let mut start = chunk_start.saturating_sub(BOUNDARY_WINDOW);
    while !cumulative.is_char_boundary(start) {
        start -= 1;
    }
    &cumulative[start..]
}
