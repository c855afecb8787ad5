//! # Progress Parser
//!
//! Classifies raw output lines of the transfer tool. In progress mode the tool
//! repaints a block of `Key: value` lines every stats interval using terminal
//! escape sequences, and writes `ERROR :` lines to stderr. [`parse_line`] turns
//! one such line into a [`ParsedLine`]; [`ProgressState`] folds a stream of
//! them into the percent/status/error signal kept per job.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::truncate_tail;

/// Key under which the byte form of `Transferred` is stored.
pub const TRANSFERRED_BYTES_KEY: &str = "Transferred";
/// Key under which the file-count form of `Transferred` is stored.
pub const TRANSFERRED_FILES_KEY: &str = "Transferred files";

/// Outcome of classifying a single output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// A `Key: value` status field.
    Field { key: String, value: String },
    /// An error line, kept verbatim after escape stripping.
    ErrorFragment(String),
}

static ESCAPE_RE: OnceLock<Regex> = OnceLock::new();
static ERROR_RE: OnceLock<Regex> = OnceLock::new();
static FIELD_RE: OnceLock<Regex> = OnceLock::new();
static BYTES_FORM_RE: OnceLock<Regex> = OnceLock::new();
static FILES_FORM_RE: OnceLock<Regex> = OnceLock::new();
static PERCENT_RE: OnceLock<Regex> = OnceLock::new();

fn escape_re() -> &'static Regex {
    ESCAPE_RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("escape pattern"))
}

fn error_re() -> &'static Regex {
    // Case-sensitive so the `Errors:` counter field is not taken for an error.
    ERROR_RE.get_or_init(|| {
        Regex::new(r"\b(?:ERROR|CRITICAL)\s*:|Fatal error:").expect("error marker pattern")
    })
}

fn field_re() -> &'static Regex {
    FIELD_RE.get_or_init(|| {
        Regex::new(r"^([A-Z][A-Za-z ]*[A-Za-z])\s*:\s*(\S.*)$").expect("field pattern")
    })
}

fn bytes_form_re() -> &'static Regex {
    BYTES_FORM_RE.get_or_init(|| {
        Regex::new(r"^[\d.]+\s*[A-Za-z]+\s*/\s*[\d.]+\s*[A-Za-z]+").expect("bytes form pattern")
    })
}

fn files_form_re() -> &'static Regex {
    FILES_FORM_RE
        .get_or_init(|| Regex::new(r"^\d+\s*/\s*\d+\s*(?:,|$)").expect("files form pattern"))
}

fn percent_re() -> &'static Regex {
    PERCENT_RE.get_or_init(|| Regex::new(r",\s*(\d{1,3})%").expect("percent pattern"))
}

/// Remove repaint sequences. When one appears mid-line, only the text after
/// the last sequence is what the terminal would show.
pub fn strip_escapes(raw: &str) -> &str {
    match escape_re().find_iter(raw).last() {
        Some(m) => &raw[m.end()..],
        None => raw,
    }
}

/// Classify one raw output line. Blank and unrecognised lines yield `None`.
pub fn parse_line(raw: &str) -> Option<ParsedLine> {
    let line = strip_escapes(raw.trim_end_matches(['\r', '\n'])).trim();
    if line.is_empty() {
        return None;
    }

    if error_re().is_match(line) {
        return Some(ParsedLine::ErrorFragment(line.to_string()));
    }

    let captures = field_re().captures(line)?;
    let key = captures.get(1)?.as_str().trim();
    let value = captures.get(2)?.as_str().trim();

    let key = if key == TRANSFERRED_BYTES_KEY {
        if bytes_form_re().is_match(value) {
            TRANSFERRED_BYTES_KEY
        } else if files_form_re().is_match(value) {
            TRANSFERRED_FILES_KEY
        } else {
            key
        }
    } else {
        key
    };

    Some(ParsedLine::Field {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Extract the `, NN%` percent from a `Transferred` value.
pub fn percent_of(value: &str) -> Option<i32> {
    let digits = percent_re().captures(value)?.get(1)?.as_str();
    digits.parse::<i32>().ok().map(|p| p.clamp(0, 100))
}

/// Accumulated parse state for one job.
#[derive(Debug, Clone)]
pub struct ProgressState {
    fields: Vec<(String, String)>,
    bytes_percent: Option<i32>,
    files_percent: Option<i32>,
    percent: i32,
    errors: String,
    error_cap: usize,
}

impl ProgressState {
    pub fn new(error_cap: usize) -> Self {
        Self {
            fields: Vec::new(),
            bytes_percent: None,
            files_percent: None,
            percent: 0,
            errors: String::new(),
            error_cap,
        }
    }

    /// Parse and apply a raw line. Returns false when the line was ignored.
    pub fn ingest(&mut self, raw: &str) -> bool {
        match parse_line(raw) {
            Some(parsed) => {
                self.apply(parsed);
                true
            }
            None => false,
        }
    }

    pub fn apply(&mut self, parsed: ParsedLine) {
        match parsed {
            ParsedLine::ErrorFragment(fragment) => self.push_error(&fragment),
            ParsedLine::Field { key, value } => {
                if key == TRANSFERRED_BYTES_KEY {
                    self.bytes_percent = percent_of(&value).or(self.bytes_percent);
                } else if key == TRANSFERRED_FILES_KEY {
                    self.files_percent = percent_of(&value).or(self.files_percent);
                }

                match self.fields.iter_mut().find(|(k, _)| *k == key) {
                    Some(entry) => entry.1 = value,
                    None => self.fields.push((key, value)),
                }

                if let Some(candidate) = self.bytes_percent.or(self.files_percent) {
                    self.percent = self.percent.max(candidate);
                }
            }
        }
    }

    /// Append an error fragment, keeping only the trailing `error_cap` chars.
    pub fn push_error(&mut self, fragment: &str) {
        self.errors.push_str(fragment);
        if !fragment.ends_with('\n') {
            self.errors.push('\n');
        }
        if self.errors.chars().count() > self.error_cap {
            self.errors = truncate_tail(&self.errors, self.error_cap).to_string();
        }
    }

    /// Process exit: percent is forced to 100 whatever was parsed.
    pub fn finish(&mut self) {
        self.percent = 100;
    }

    pub fn percent(&self) -> i32 {
        self.percent
    }

    pub fn error_text(&self) -> &str {
        &self.errors
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render every known field, keys right-aligned, one per line.
    pub fn render(&self) -> String {
        let width = self
            .fields
            .iter()
            .map(|(k, _)| k.chars().count())
            .max()
            .unwrap_or(0);

        self.fields
            .iter()
            .map(|(k, v)| format!("{k:>width$}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
