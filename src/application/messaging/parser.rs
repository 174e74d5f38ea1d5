//! Command text parsing

use once_cell::sync::Lazy;
use regex_lite::Regex;

/// A leading `N#` repeat token, e.g. `3#rd`
pub static EXECUTE_TIMES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)#(.+)$").expect("valid regex"));

/// A command line split off its prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// First token after the prefix, untouched
    pub word: String,
    pub args: Vec<String>,
    /// Everything after the word, leading whitespace stripped
    pub raw_args: String,
}

/// Split a message into a command word and arguments. Returns `None` when
/// the text does not start with the command prefix or has nothing after it.
pub fn parse_command(prefix: &str, text: &str) -> Option<ParsedCommand> {
    let text = text.trim_start();
    let body = text.strip_prefix(prefix)?;
    let body = body.trim_start();
    if body.is_empty() {
        return None;
    }
    let (word, rest) = match body.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (body, ""),
    };
    Some(ParsedCommand {
        word: word.to_string(),
        args: rest.split_whitespace().map(str::to_string).collect(),
        raw_args: rest.to_string(),
    })
}

/// Pull `@name` tokens out of a plain text line, returning the cleaned text
/// and the mention targets in order. Used by adapters without native
/// mention syntax.
pub fn extract_mentions(text: &str) -> (String, Vec<String>) {
    let mut mentions = Vec::new();
    let mut kept: Vec<&str> = Vec::new();
    for token in text.split(' ') {
        match token.strip_prefix('@') {
            Some(name) if !name.is_empty() => mentions.push(name.to_string()),
            _ => kept.push(token),
        }
    }
    (kept.join(" "), mentions)
}
