// `diql run`: execute one query, streaming progress to stderr and printing
// the final result snapshot.

use std::sync::Arc;

use clap::Args;
use diql_client::IntermediateCallback;
use diql_common::result::ResultSnapshot;
use serde_json::Value;

use super::Session;
use crate::exit_code::SessionRejected;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Analysis id.
    pub analysis: String,

    /// Qube holding the query.
    pub qube: String,

    /// Query id.
    pub query: String,

    /// Analysis version to run against (defaults to the newest).
    #[arg(long)]
    pub version: Option<i64>,

    /// Do not report progress on stderr.
    #[arg(long)]
    pub quiet: bool,
}

pub async fn run(session: &Session, args: RunArgs) -> anyhow::Result<()> {
    let format = session.format;
    let mut connection = session.connect().await?;
    connection.load(&args.analysis, args.version).await?;

    let progress = (!args.quiet).then(|| progress_reporter(format));
    let provided = connection.client.documents().provide_query_results(&args.qube, &args.query, progress);
    let result = match provided {
        Ok(result) => result,
        Err(error) => {
            let action = format!("cannot run query {} in qube {}", args.query, args.qube);
            return Err(connection.explain(error, action));
        }
    };

    match result.finished().await {
        Ok(snapshot) => {
            output::print_output(format, &snapshot, format_human)?;
            Ok(())
        }
        Err(failed) => {
            output::print_output(format, &failed.0, format_human)?;
            if connection.logged_out() {
                return Err(anyhow::Error::new(SessionRejected)
                    .context(format!("query {} was interrupted", args.query)));
            }
            Err(anyhow::Error::new(failed).context(format!("query {} did not complete", args.query)))
        }
    }
}

/// Report each progress step once.
fn progress_reporter(format: OutputFormat) -> IntermediateCallback {
    let last = std::sync::Mutex::new(None::<f64>);
    Arc::new(move |snapshot: &ResultSnapshot| {
        let mut last = last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last != Some(snapshot.percent_complete) {
            *last = Some(snapshot.percent_complete);
            output::print_progress(format, snapshot.percent_complete);
        }
    })
}

fn format_human(snapshot: &ResultSnapshot) -> String {
    let mut lines = Vec::new();
    if let Some(columns) = &snapshot.column_names {
        lines.push(columns.join("\t"));
    }
    let rows = snapshot.rows.as_deref().unwrap_or_default();
    for row in rows {
        lines.push(row.iter().map(render_cell).collect::<Vec<_>>().join("\t"));
    }
    match &snapshot.exception {
        Some(exception) => {
            lines.push(format!("failed at {}%: {exception}", snapshot.percent_complete))
        }
        None => lines.push(format!("({} rows)", rows.len())),
    }
    lines.join("\n")
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn human_output_renders_a_tab_separated_table() {
        let snapshot = ResultSnapshot {
            percent_complete: 100.0,
            rows: Some(vec![vec![json!("CA"), json!(42)], vec![json!("NV"), Value::Null]]),
            column_names: Some(vec!["state".into(), "count".into()]),
            ..ResultSnapshot::default()
        };

        assert_eq!(format_human(&snapshot), "state\tcount\nCA\t42\nNV\t\n(2 rows)");
    }

    #[test]
    fn human_output_reports_failure_with_partial_rows() {
        let snapshot = ResultSnapshot {
            percent_complete: 40.0,
            rows: Some(vec![vec![json!(7)]]),
            exception: Some("Cancelled.".into()),
            ..ResultSnapshot::default()
        };

        assert_eq!(format_human(&snapshot), "7\nfailed at 40%: Cancelled.");
    }
}
