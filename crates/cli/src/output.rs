// Output format auto-detection for the CLI.
//
// TTY → human-readable text. Piped/redirected → structured JSON.
// `--json` flag forces JSON output regardless of terminal.

use std::io::{self, IsTerminal, Write};

use diql_client::{DocumentError, QueryFailed};
use serde::Serialize;

use crate::exit_code::{ServiceUnreachable, SessionRejected};

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    Human,
    /// Machine-readable JSON (one object per response).
    Json,
}

impl OutputFormat {
    /// Auto-detect format: JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    /// Testable variant that takes an explicit `is_tty` flag.
    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

/// Write a value to stdout in the selected format.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

/// Write a value to a provided writer (useful for testing).
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => {
            writeln!(writer, "{}", human_fn(value))
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

/// Write an error to stderr in the selected format.
pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    print_stderr(format, "error", ANSI_RED, code, message);
}

/// Write a progress or warning line to stderr in the selected format.
pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    print_stderr(format, "warning", ANSI_YELLOW, code, message);
}

/// Report execution progress on stderr, leaving stdout for the result.
pub fn print_progress(format: OutputFormat, percent_complete: f64) {
    let mut err = io::stderr().lock();
    let _ = match format {
        OutputFormat::Human => writeln!(err, "running... {percent_complete}%"),
        OutputFormat::Json => writeln!(
            err,
            "{}",
            serde_json::json!({ "progress": { "percentComplete": percent_complete } })
        ),
    };
}

fn print_stderr(format: OutputFormat, label: &str, color: &str, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line = render_human_stderr_line(label, message, io::stderr().is_terminal(), color);
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let mut obj = serde_json::Map::new();
            obj.insert(label.to_string(), serde_json::json!({ "code": code, "message": message }));
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");

    for cause in error.chain() {
        if let Some(unreachable) = cause.downcast_ref::<ServiceUnreachable>() {
            return (
                "SERVICE_UNREACHABLE",
                format!("{unreachable}. Check --url or the [connection] section of the config file"),
            );
        }
        if cause.downcast_ref::<SessionRejected>().is_some() {
            return (
                "AUTH_FAILURE",
                "Session credential rejected. Set DIQL_CREDENTIAL or pass --credential".to_string(),
            );
        }
        if cause.downcast_ref::<QueryFailed>().is_some() {
            return ("QUERY_FAILED", message);
        }
        if let Some(document_err) = cause.downcast_ref::<DocumentError>() {
            let code = match document_err {
                DocumentError::Invalid(_) => "INVALID_REQUEST",
                DocumentError::Server(_) => "SERVER_ERROR",
                DocumentError::Internal => "INTERNAL_ERROR",
                _ => "COMMAND_FAILED",
            };
            return (code, message);
        }
    }

    ("ERROR", message)
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_tty_returns_human() {
        assert_eq!(OutputFormat::detect_from_terminal(true), OutputFormat::Human);
    }

    #[test]
    fn detect_pipe_returns_json() {
        assert_eq!(OutputFormat::detect_from_terminal(false), OutputFormat::Json);
    }

    #[test]
    fn detect_json_flag_overrides_tty() {
        assert_eq!(OutputFormat::detect(true), OutputFormat::Json);
    }

    #[test]
    fn write_output_human_format() {
        #[derive(Serialize)]
        struct Info {
            name: String,
        }
        let info = Info { name: "Orders".into() };
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Human, &info, |i| format!("Analysis: {}", i.name))
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "Analysis: Orders\n");
    }

    #[test]
    fn write_output_json_does_not_call_human_fn() {
        #[derive(Serialize)]
        struct Info {
            version: i64,
        }
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Json, &Info { version: 7 }, |_| {
            unreachable!("human_fn should not be called in JSON mode")
        })
        .unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(output.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(parsed["version"], 7);
    }

    #[test]
    fn human_stderr_line_is_colored_only_on_tty() {
        assert_eq!(render_human_stderr_line("error", "boom", false, ANSI_RED), "error: boom");
        assert!(render_human_stderr_line("error", "boom", true, ANSI_RED).starts_with(ANSI_RED));
    }

    #[test]
    fn rejected_session_gets_actionable_message() {
        let err = anyhow::Error::new(SessionRejected).context("failed to load analysis A1");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "AUTH_FAILURE");
        assert!(message.contains("DIQL_CREDENTIAL"));
    }

    #[test]
    fn document_errors_keep_their_message() {
        let err = anyhow::Error::new(DocumentError::Internal);
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "INTERNAL_ERROR");
        assert_eq!(message, "internal error, please refresh");
    }
}
