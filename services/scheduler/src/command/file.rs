//! Command file parsing.
//!
//! Grammar:
//! - one command per line, split into shell-style tokens
//! - `'single'` and `"double"` quotes group tokens; `\"` and `\\` escape
//!   inside double quotes
//! - `#` at a token boundary comments out the rest of the line
//! - a trailing `\` joins the next line
//! - `MACRO NAME = tokens...` defines a macro, `NAME()` expands it

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors reading or parsing a command file.
#[derive(Debug, Error)]
pub enum CommandFileError {
    #[error("failed to read command file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: unterminated quote", path.display())]
    UnterminatedQuote { path: PathBuf, line: usize },

    #[error("{}:{line}: malformed macro definition", path.display())]
    MalformedMacro { path: PathBuf, line: usize },

    #[error("{}:{line}: undefined macro {name}", path.display())]
    UndefinedMacro {
        path: PathBuf,
        line: usize,
        name: String,
    },

    #[error("{}:{line}: macro {name} expands to itself", path.display())]
    RecursiveMacro {
        path: PathBuf,
        line: usize,
        name: String,
    },
}

/// One command parsed from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub args: Vec<String>,
    pub file: Option<PathBuf>,
    /// 1-based line on which the command starts.
    pub line_number: usize,
}

impl CommandLine {
    pub fn new(args: Vec<String>, file: Option<PathBuf>, line_number: usize) -> Self {
        Self {
            args,
            file,
            line_number,
        }
    }
}

/// Turns a command file into command lines.
pub trait CommandFileParser: Send + Sync {
    fn parse_file(&self, path: &Path) -> Result<Vec<CommandLine>, CommandFileError>;
}

/// Parser for the plain-text command file format.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCommandFileParser;

impl CommandFileParser for TextCommandFileParser {
    fn parse_file(&self, path: &Path) -> Result<Vec<CommandLine>, CommandFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| CommandFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        parse_str(&content, path)
    }
}

/// Parse command file `content`; `path` is only used for error reporting.
pub fn parse_str(content: &str, path: &Path) -> Result<Vec<CommandLine>, CommandFileError> {
    let mut macros: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut commands = Vec::new();

    for (line_number, logical) in logical_lines(content) {
        let tokens = tokenize(&logical).ok_or_else(|| CommandFileError::UnterminatedQuote {
            path: path.to_path_buf(),
            line: line_number,
        })?;
        if tokens.is_empty() {
            continue;
        }

        if tokens[0] == "MACRO" {
            match tokens.as_slice() {
                [_, name, eq, body @ ..] if eq == "=" && !name.is_empty() => {
                    macros.insert(name.clone(), body.to_vec());
                }
                _ => {
                    return Err(CommandFileError::MalformedMacro {
                        path: path.to_path_buf(),
                        line: line_number,
                    })
                }
            }
            continue;
        }
        commands.push((line_number, tokens));
    }

    commands
        .into_iter()
        .map(|(line_number, tokens)| {
            let mut args = Vec::with_capacity(tokens.len());
            let mut stack = Vec::new();
            expand(&tokens, &macros, &mut stack, &mut args).map_err(|failure| {
                failure.into_error(path.to_path_buf(), line_number)
            })?;
            Ok(CommandLine::new(args, Some(path.to_path_buf()), line_number))
        })
        .collect()
}

/// Join `\`-continued physical lines, keeping the first line number.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in content.lines().enumerate() {
        let (start, mut text) = pending.take().unwrap_or((idx + 1, String::new()));
        let trimmed = raw.trim_end();
        if let Some(head) = trimmed.strip_suffix('\\') {
            text.push_str(head);
            text.push(' ');
            pending = Some((start, text));
        } else {
            text.push_str(trimmed);
            lines.push((start, text));
        }
    }
    if let Some(last) = pending {
        lines.push(last);
    }
    lines
}

/// Split a line into tokens. Returns `None` on an unterminated quote.
fn tokenize(line: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '#' if !in_token => break,
            '\'' => {
                in_token = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        other => current.push(other),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
                            current.extend(chars.next());
                        }
                        other => current.push(other),
                    }
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}

enum ExpandFailure {
    Undefined(String),
    Recursive(String),
}

impl ExpandFailure {
    fn into_error(self, path: PathBuf, line: usize) -> CommandFileError {
        match self {
            ExpandFailure::Undefined(name) => CommandFileError::UndefinedMacro { path, line, name },
            ExpandFailure::Recursive(name) => CommandFileError::RecursiveMacro { path, line, name },
        }
    }
}

fn expand(
    tokens: &[String],
    macros: &BTreeMap<String, Vec<String>>,
    stack: &mut Vec<String>,
    out: &mut Vec<String>,
) -> Result<(), ExpandFailure> {
    for token in tokens {
        let Some(name) = token.strip_suffix("()") else {
            out.push(token.clone());
            continue;
        };
        if stack.iter().any(|active| active == name) {
            return Err(ExpandFailure::Recursive(name.to_string()));
        }
        let body = macros
            .get(name)
            .ok_or_else(|| ExpandFailure::Undefined(name.to_string()))?;
        stack.push(name.to_string());
        expand(body, macros, stack, out)?;
        stack.pop();
    }
    Ok(())
}
