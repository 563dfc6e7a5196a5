//! INI-style composition file parser
//!
//! ```text
//! [Composite]
//! GracefulShutdown=yes
//!
//! [Service db]
//! Command=postgres -D data
//! ReadyTcpPort=5432
//! ```
//!
//! Keys are case-insensitive (stored upper-cased). Section order and value
//! order are preserved.

use std::collections::HashMap;
use std::path::Path;

/// Key -> values, in the order they appeared
pub type ParsedSection = HashMap<String, Vec<String>>;

/// Sections in file order, keyed by their bracketed header
pub type ParsedFile = Vec<(String, ParsedSection)>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Section '{0}' appears more than once")]
    DuplicateSection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: expected Key=Value, got '{text}'")]
    MalformedLine { line: usize, text: String },

    #[error("Line {0}: setting outside of any section")]
    NoSection(usize),

    #[error("Invalid shell quoting in: {0}")]
    Quoting(String),
}

/// Keys that accept space-separated multiple values
const SPACE_SEPARATED_KEYS: &[&str] = &["DEPENDENCIES"];

/// Parse a composition file from a string
pub fn parse_file(content: &str) -> Result<ParsedFile, ParseError> {
    let mut sections: ParsedFile = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        let line_number = index + 1;

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = normalize_header(line);
            if sections.iter().any(|(existing, _)| *existing == name) {
                return Err(ParseError::DuplicateSection(name));
            }
            sections.push((name, ParsedSection::new()));
            continue;
        }

        let Some((name, value)) = line.split_once('=') else {
            return Err(ParseError::MalformedLine {
                line: line_number,
                text: line.to_string(),
            });
        };

        let Some((_, section)) = sections.last_mut() else {
            return Err(ParseError::NoSection(line_number));
        };

        let name = name.trim().to_uppercase();
        let value = value.trim();
        let entry = section.entry(name.clone()).or_default();

        if SPACE_SEPARATED_KEYS.contains(&name.as_str()) {
            entry.extend(value.split_whitespace().map(str::to_string));
        } else {
            entry.push(value.to_string());
        }
    }

    Ok(sections)
}

/// Collapse inner whitespace so `[Service   web]` equals `[Service web]`
fn normalize_header(line: &str) -> String {
    let inner = &line[1..line.len() - 1];
    format!("[{}]", inner.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Parse a composition file from disk
pub async fn parse_composition_file(path: &Path) -> Result<ParsedFile, ParseError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_file(&content)
}

/// Split a command line using shell-like quoting
pub fn parse_command(raw: &str) -> Result<Vec<String>, ParseError> {
    shlex::split(raw).ok_or_else(|| ParseError::Quoting(raw.to_string()))
}

/// Parse Environment= values using shell-like quoting
pub fn parse_environment(raw: &str) -> Result<Vec<(String, String)>, ParseError> {
    let parts = shlex::split(raw).ok_or_else(|| ParseError::Quoting(raw.to_string()))?;

    let mut vars = Vec::new();
    for pair in parts {
        if let Some((key, value)) = pair.split_once('=') {
            vars.push((key.to_string(), value.to_string()));
        }
    }
    Ok(vars)
}

/// Parse a boolean setting (yes/true/1/on, no/false/0/off)
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}
