//! Command strings: shell-like tokenizing (without a shell) and the
//! registration-time check that rejects shell syntax outright.

use crate::registry::ManagedService;

/// Shell syntax that would be silently inert under direct execution.
pub const BLOCKED_SHELL_PATTERNS: &[&str] = &["&&", "||", ";", "|", ">", "<", "`", "$(", "${"];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command cannot be empty")]
    Empty,

    #[error("unterminated {0} quote in command")]
    UnterminatedQuote(char),

    #[error("command ends with a dangling escape")]
    DanglingEscape,

    #[error("command contains disallowed shell pattern {0:?}; use a direct executable command (e.g. \"npm run dev\")")]
    DisallowedPattern(&'static str),
}

impl CommandError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY_COMMAND",
            Self::UnterminatedQuote(_) => "UNTERMINATED_QUOTE",
            Self::DanglingEscape => "DANGLING_ESCAPE",
            Self::DisallowedPattern(_) => "DISALLOWED_SHELL_PATTERN",
        }
    }
}

/// Split a command string into an argument vector.
///
/// Whitespace separates arguments outside quotes. `'...'` and `"..."` group,
/// with the other quote character taken literally inside. A backslash
/// escapes the next character anywhere. Nothing else is interpreted:
/// `$VAR`, globs and redirections pass through as plain text.
pub fn parse_command_args(input: &str) -> Result<Vec<String>, CommandError> {
    let mut args = Vec::new();
    let mut current = String::new();
    // Distinguishes `""` (an empty argument) from no argument at all.
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match (c, quote) {
            ('\\', _) => {
                escaped = true;
                in_token = true;
            }
            (q, Some(open)) if q == open => quote = None,
            ('"' | '\'', None) => {
                quote = Some(c);
                in_token = true;
            }
            (' ' | '\t' | '\n', None) => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            _ => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if escaped {
        return Err(CommandError::DanglingEscape);
    }
    if let Some(open) = quote {
        return Err(CommandError::UnterminatedQuote(open));
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

/// First blocked pattern contained in `command`, in declaration order.
pub fn first_blocked_shell_pattern(command: &str) -> Option<&'static str> {
    let command = command.trim();
    if command.is_empty() {
        return None;
    }
    BLOCKED_SHELL_PATTERNS
        .iter()
        .copied()
        .find(|pattern| command.contains(pattern))
}

/// Registration-time check for a managed command.
pub fn validate_managed_command(command: &str) -> Result<(), CommandError> {
    if command.trim().is_empty() {
        return Err(CommandError::Empty);
    }
    match first_blocked_shell_pattern(command) {
        Some(pattern) => Err(CommandError::DisallowedPattern(pattern)),
        None => Ok(()),
    }
}

/// One line per registered service whose command predates the shell-pattern
/// check, sorted. Meant to be computed once at startup by the caller.
pub fn legacy_command_warnings(services: &[ManagedService]) -> Vec<String> {
    let mut warnings: Vec<String> = services
        .iter()
        .filter_map(|svc| {
            first_blocked_shell_pattern(&svc.command)
                .map(|pattern| format!("{} (pattern {:?})", svc.name, pattern))
        })
        .collect();
    warnings.sort();
    warnings
}
