//! Wildcard output matching.
//!
//! Expected stdout/stderr in a spec is written in a small pattern language:
//! `#` matches one or more digits, `*` matches any text including line
//! breaks, `%` matches any text excluding line breaks, everything else is
//! literal. Patterns compile to anchored regexes.

use std::sync::OnceLock;

use regex::Regex;

// Private-use placeholders keep the wildcard tokens out of reach of
// `regex::escape`. They cannot occur in authored patterns.
const DIGIT_TOKEN: char = '\u{e000}';
const ANY_TOKEN: char = '\u{e001}';
const LINE_TOKEN: char = '\u{e002}';

/// A compiled expectation pattern. Stateless and reusable.
pub struct Matcher {
    regex: Regex,
}

impl Matcher {
    /// Compile a wildcard pattern into a matcher.
    ///
    /// The result matches a candidate only if the entire candidate satisfies
    /// the pattern (anchored at both ends). Both `*` and `%` are lazy.
    pub fn compile(pattern: &str) -> Result<Matcher, regex::Error> {
        let protected: String = pattern
            .chars()
            .map(|c| match c {
                '#' => DIGIT_TOKEN,
                '*' => ANY_TOKEN,
                '%' => LINE_TOKEN,
                other => other,
            })
            .collect();
        let escaped = regex::escape(&protected);
        let expanded = escaped
            .replace(DIGIT_TOKEN, "[0-9]+")
            .replace(ANY_TOKEN, "(?s:.*?)")
            .replace(LINE_TOKEN, ".*?");
        let regex = Regex::new(&format!("^{expanded}$"))?;
        Ok(Matcher { regex })
    }

    /// Check whether the candidate matches the compiled pattern.
    ///
    /// Callers are expected to pass output through [`normalize_output`]
    /// first; the pattern itself is used as authored.
    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

fn ansi_escape_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    // CSI sequences (colors, cursor movement) and two-byte escapes.
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b(\[[0-9;?]*[ -/]*[@-~]|[@-Z\\-_])").expect("valid ANSI pattern")
    })
}

/// Normalize captured command output before matching.
///
/// Strips terminal control/color escape sequences, carriage returns, and
/// trailing whitespace (including trailing newlines).
pub fn normalize_output(raw: &str) -> String {
    let stripped = ansi_escape_regex().replace_all(raw, "");
    stripped.replace('\r', "").trim_end().to_string()
}
