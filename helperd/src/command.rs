//! Text command surface: `START <tool> [params...]` and `STOP <tool>`

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { tool: String, params: String },
    Stop { tool: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownVerb(String),
}

impl Command {
    /// Parse one line. The tool may be missing; the supervisor rejects that.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_start();
        let (verb, rest) = split_word(line);
        if verb.is_empty() {
            return Err(ParseError::Empty);
        }
        let (tool, params) = split_word(rest);

        match verb.to_ascii_uppercase().as_str() {
            "START" => Ok(Command::Start {
                tool: tool.to_string(),
                params: params.trim_end_matches(|c: char| c == '\r' || c == '\n').to_string(),
            }),
            "STOP" => Ok(Command::Stop {
                tool: tool.to_string(),
            }),
            _ => Err(ParseError::UnknownVerb(verb.to_string())),
        }
    }
}

/// First whitespace-delimited word, and the rest after one separating run.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], s[end..].trim_start()),
        None => (s, ""),
    }
}
