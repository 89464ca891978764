//! Prompt, pager and error detection for interactive shells.
//!
//! The output of a command is complete once the trailing, newline-less part
//! of the buffer matches the command's `expect_string` or one of the profile
//! prompt patterns. Pager prompts are answered automatically; lines matching
//! an error pattern mark the command as failed.

use std::borrow::Cow;

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

use crate::profile::DeviceProfile;

/// Terminal escape sequences and stray carriage returns emitted by devices.
static ANSI_ESCAPES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b[()][A-Za-z0-9]|\x08+|\x00+")
        .expect("static ansi regex")
});

/// Prompt endings that work for most CLIs when no profile is known.
const GENERIC_PROMPTS: &[&str] = &[r"[>#\$\]]\s*$"];
const GENERIC_MORE: &[&str] = &[r"-+\s*\(?[Mm]ore.*-+\s*$"];

pub struct PromptMatcher {
    prompts: RegexSet,
    errors: RegexSet,
    more: RegexSet,
}

impl PromptMatcher {
    pub fn new<I, S>(prompts: I, errors: I, more: I) -> Result<Self, regex::Error>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
    {
        Ok(Self {
            prompts: RegexSet::new(prompts)?,
            errors: RegexSet::new(errors)?,
            more: RegexSet::new(more)?,
        })
    }

    /// Generic matcher used when no profile exists for the device type.
    pub fn generic() -> Self {
        Self::new(GENERIC_PROMPTS.to_vec(), Vec::<&str>::new(), GENERIC_MORE.to_vec())
            .expect("static generic patterns")
    }

    /// Builds a matcher from a profile, falling back to generic patterns.
    pub fn for_profile(profile: Option<&DeviceProfile>) -> Self {
        let Some(profile) = profile else {
            return Self::generic();
        };
        let prompts: Vec<&str> = if profile.prompt_patterns.is_empty() {
            GENERIC_PROMPTS.to_vec()
        } else {
            profile.prompt_patterns.iter().map(String::as_str).collect()
        };
        let more: Vec<&str> = if profile.more_patterns.is_empty() {
            GENERIC_MORE.to_vec()
        } else {
            profile.more_patterns.iter().map(String::as_str).collect()
        };
        let errors: Vec<&str> = profile.error_patterns.iter().map(String::as_str).collect();
        // Profiles are validated on load; generic is the safety net for hand-built ones.
        Self::new(prompts, errors, more).unwrap_or_else(|_| Self::generic())
    }

    pub fn is_prompt(&self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        !line.trim().is_empty() && self.prompts.is_match(line)
    }

    pub fn is_more(&self, line: &str) -> bool {
        self.more.is_match(line)
    }

    /// Whether the shell is back at a prompt or at the caller's `expect` pattern.
    pub fn ready(&self, tail: &str, expect: Option<&Regex>) -> bool {
        let ready = expect.is_some_and(|re| re.is_match(tail)) || self.is_prompt(tail);
        trace!("Prompt check on {:?}: {}", tail, ready);
        ready
    }

    /// First output line matching an error pattern.
    pub fn find_error(&self, output: &str) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        output
            .lines()
            .map(|l| l.trim_end())
            .find(|l| self.errors.is_match(l))
            .map(str::to_string)
    }
}

/// Compiles an `expect_string`. Invalid regex text is matched literally.
pub fn expect_regex(expect: &str) -> Regex {
    Regex::new(expect).unwrap_or_else(|_| {
        Regex::new(&regex::escape(expect)).expect("escaped literal is a valid regex")
    })
}

/// Removes terminal escape sequences.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPES.replace_all(text, "")
}

/// The part of `buffer` after the last newline (where a prompt sits).
pub fn tail(buffer: &str) -> &str {
    match buffer.rfind('\n') {
        Some(pos) => &buffer[pos + 1..],
        None => buffer,
    }
}

/// Strips the echoed command and the trailing prompt line from raw output.
pub fn clean_output(raw: &str, command: &str) -> String {
    let text = strip_ansi(raw).replace("\r\n", "\n").replace('\r', "");
    let mut content = text.as_str();

    let trimmed_cmd = command.trim();
    if !trimmed_cmd.is_empty() {
        let leading = content.trim_start_matches('\n');
        if let Some(rest) = leading.strip_prefix(trimmed_cmd) {
            content = rest.trim_start_matches([' ', '\n']);
        }
    }

    match content.rfind('\n') {
        Some(pos) => content[..pos].to_string(),
        // A lone line with no newline is the prompt itself.
        None => String::new(),
    }
}
