//! Activity / title / prompt detector (§4.J).
//!
//! A pure, line-oriented filter: feed it a chunk of PTY output, get back the
//! (unmodified) bytes, an optional parsed Claude status line, and whether
//! the chunk ends with a shell prompt. Callers (the PTY session, §4.C) use
//! `ends_with_prompt` to decide when to inject a title OSC sequence.
//!
//! Regex compilation happens once, at construction, grounded in the same
//! precompiled-regex-set idiom used for this kind of line classification
//! elsewhere in the pack; a bounded LRU memoizes the prompt check since it
//! is evaluated on every output chunk of a busy session.

use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const CACHE_CAPACITY: usize = 1_000;
const CACHE_EVICT_FRACTION: usize = 5; // evict ~20% on overflow
const CACHE_KEY_TAIL: usize = 100;

/// A parsed Claude Code status line (e.g. `✶ Exploring… (12s · ⇡ 3.2k tokens)`).
#[derive(Debug, Clone, PartialEq)]
pub struct ClaudeStatus {
    /// The verb phrase between the glyph and the opening parenthesis.
    pub action: String,
    /// Elapsed seconds reported in the status line.
    pub duration_secs: u64,
    /// Token count in thousands, as printed (e.g. `3.2` for `3.2k`).
    pub tokens_k: f64,
    /// The direction glyph (`⇡`/`⇣`/etc.) verbatim.
    pub direction: String,
}

/// Result of feeding one chunk of output through the detector.
#[derive(Debug, Clone)]
pub struct DetectResult<'a> {
    /// The input, unmodified — the detector never rewrites bytes itself.
    pub filtered: &'a [u8],
    /// A parsed status line, if the chunk's last line matched one.
    pub status: Option<ClaudeStatus>,
    /// True if the chunk ends with a recognized shell prompt.
    pub ends_with_prompt: bool,
}

/// Precompiled regex set plus a bounded memoization cache.
pub struct Detector {
    prompt_at_end: Regex,
    prompt_only_line: Regex,
    claude_status_line: Regex,
    cache: Mutex<LruCache<String, bool>>,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector").finish_non_exhaustive()
    }
}

impl Detector {
    /// Compile the regex set and create an empty cache.
    ///
    /// # Panics
    ///
    /// Panics if any pattern fails to compile; the patterns are fixed
    /// constants, so this can only happen as a result of a programming
    /// error in this module.
    #[must_use]
    #[expect(clippy::expect_used, reason = "regex patterns are fixed constants")]
    pub fn new() -> Self {
        // Matches a trailing bash/zsh/fish/PowerShell/bracketed prompt,
        // tolerating one trailing CSI sequence, but excluding Python's
        // `>>>`/`...` interactive prompts.
        let prompt_at_end = Regex::new(
            r"(?x)
            (?:\x1b\[[0-9;]*[a-zA-Z])?   # optional trailing CSI sequence
            \s*
            (?:
                [^\s>]+@[^\s>]+ \s* [:~][^\s>]* \s* [$#%>]  # user@host:~$ style
                | PS\ [A-Za-z]:\\[^>]*>                      # PowerShell
                | \[[^\]]*\]\s*[$#%>]                        # bracketed prompt
                | [$#%]
            )
            \s*$
            ",
        )
        .expect("prompt_at_end pattern is valid");

        let prompt_only_line = Regex::new(r"^\s*(?:[$#%>]|\[[^\]]*\]\s*[$#%>])\s*$")
            .expect("prompt_only_line pattern is valid");

        let claude_status_line = Regex::new(
            r"(?x)
            ^(?P<glyph>\S+)\s+
            (?P<action>.+?)…\s*
            \((?P<duration>\d+)s\s*
            ·\s*(?P<direction>\S+)\s*
            (?P<tokens>[\d.]+)k\s*tokens\)
            ",
        )
        .expect("claude_status_line pattern is valid");

        Self {
            prompt_at_end,
            prompt_only_line,
            claude_status_line,
            #[expect(clippy::unwrap_used, reason = "CACHE_CAPACITY is a nonzero constant")]
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    /// True if `line` consists solely of a shell prompt (no other content).
    #[must_use]
    pub fn is_prompt_only_line(&self, line: &str) -> bool {
        let excluded = line.trim_end() == ">>>" || line.trim_end() == "...";
        !excluded && self.prompt_only_line.is_match(line)
    }

    fn ends_with_prompt_uncached(&self, text: &str) -> bool {
        let excluded = text.trim_end().ends_with(">>>") || text.trim_end().ends_with("...");
        !excluded && self.prompt_at_end.is_match(text)
    }

    /// Memoized end-of-output prompt check, keyed on the last 100 characters.
    fn ends_with_prompt(&self, text: &str) -> bool {
        let tail_start = text
            .char_indices()
            .rev()
            .nth(CACHE_KEY_TAIL.saturating_sub(1))
            .map_or(0, |(idx, _)| idx);
        let key = &text[tail_start..];

        if let Some(cached) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(key) {
            return *cached;
        }

        let result = self.ends_with_prompt_uncached(key);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= CACHE_CAPACITY {
            let evict = (CACHE_CAPACITY / CACHE_EVICT_FRACTION).max(1);
            for _ in 0..evict {
                if cache.pop_lru().is_none() {
                    break;
                }
            }
        }
        cache.put(key.to_owned(), result);
        result
    }

    /// Parse a Claude status line, if `line` is one.
    #[must_use]
    pub fn parse_claude_status(&self, line: &str) -> Option<ClaudeStatus> {
        let caps = self.claude_status_line.captures(line)?;
        Some(ClaudeStatus {
            action: caps.name("action")?.as_str().trim().to_owned(),
            duration_secs: caps.name("duration")?.as_str().parse().ok()?,
            tokens_k: caps.name("tokens")?.as_str().parse().ok()?,
            direction: caps.name("direction")?.as_str().to_owned(),
        })
    }

    /// Run the detector over one chunk of (already UTF-8-lossy) output text.
    #[must_use]
    pub fn detect<'a>(&self, text: &str, bytes: &'a [u8]) -> DetectResult<'a> {
        let last_line = text.lines().next_back().unwrap_or("");
        DetectResult {
            filtered: bytes,
            status: self.parse_claude_status(last_line),
            ends_with_prompt: self.ends_with_prompt(text),
        }
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_bash_style_prompt_at_end() {
        let detector = Detector::new();
        assert!(detector.ends_with_prompt_uncached("user@host:~/project$ "));
        assert!(detector.ends_with_prompt_uncached("some output\n$ "));
    }

    #[test]
    fn excludes_python_interactive_prompts() {
        let detector = Detector::new();
        assert!(!detector.ends_with_prompt_uncached(">>> "));
        assert!(!detector.ends_with_prompt_uncached("... "));
    }

    #[test]
    fn prompt_only_line_detection() {
        let detector = Detector::new();
        assert!(detector.is_prompt_only_line("$ "));
        assert!(!detector.is_prompt_only_line("echo hi $"));
    }

    #[test]
    fn parses_claude_status_line() {
        let detector = Detector::new();
        let status = detector
            .parse_claude_status("✶ Exploring… (12s · ⇡ 3.2k tokens)")
            .expect("should parse");
        assert_eq!(status.action, "Exploring");
        assert_eq!(status.duration_secs, 12);
        assert_eq!(status.direction, "⇡");
        assert!((status.tokens_k - 3.2).abs() < f64::EPSILON);
    }

    #[test]
    fn cache_memoizes_repeated_lookups() {
        let detector = Detector::new();
        let text = "user@host:~$ ";
        assert!(detector.ends_with_prompt(text));
        assert!(detector.ends_with_prompt(text));
        assert_eq!(detector.cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn detect_reports_filtered_bytes_unchanged() {
        let detector = Detector::new();
        let bytes = b"hello\n$ ";
        let result = detector.detect("hello\n$ ", bytes);
        assert_eq!(result.filtered, bytes);
        assert!(result.ends_with_prompt);
        assert!(result.status.is_none());
    }
}
