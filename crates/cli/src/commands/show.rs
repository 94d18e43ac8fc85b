// `diql show`: load an analysis and print its qubes, queries, and slices.

use clap::Args;
use diql_common::analysis::{Analysis, Slice};
use serde::Serialize;

use super::Session;
use crate::output;

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Analysis id.
    pub analysis: String,

    /// Version to load (defaults to the newest).
    #[arg(long)]
    pub version: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShowOutput {
    analysis: Analysis,
    newest_version: Option<i64>,
}

pub async fn run(session: &Session, args: ShowArgs) -> anyhow::Result<()> {
    let mut connection = session.connect().await?;
    let analysis = connection.load(&args.analysis, args.version).await?;
    let newest_version = connection.client.documents().newest_version();

    let shown = ShowOutput { analysis, newest_version };
    output::print_output(session.format, &shown, format_human)?;
    Ok(())
}

fn format_human(shown: &ShowOutput) -> String {
    let analysis = &shown.analysis;
    let mut lines = Vec::new();

    let mut header = format!("{} ({}) version {}", analysis.name, analysis.id, analysis.version);
    if let Some(newest) = shown.newest_version.filter(|newest| *newest > analysis.version) {
        header.push_str(&format!(" [newest: {newest}]"));
    }
    lines.push(header);
    if !analysis.table.is_empty() {
        lines.push(format!("table: {}", analysis.table));
    }

    lines.push("slices:".to_string());
    for slice in &analysis.slices {
        lines.push(format!("  {}  {}  {}", slice.id, slice.name, describe_selection(slice)));
    }

    lines.push("qubes:".to_string());
    for qube in &analysis.qubes {
        lines.push(format!("  {}  {}  (slice {})", qube.id, qube.name, qube.slice_id));
        for query in &qube.queries {
            lines.push(format!("    {}  {}  {}", query.id, query.name, query.diql));
        }
    }

    lines.join("\n")
}

fn describe_selection(slice: &Slice) -> String {
    let mut parts: Vec<String> = slice
        .slice_disjunctions
        .iter()
        .map(|disjunction| {
            let values: Vec<String> = disjunction
                .disjunction_values
                .iter()
                .map(|value| value.as_str().map_or_else(|| value.to_string(), str::to_string))
                .collect();
            format!("{} in [{}]", disjunction.field_name, values.join(", "))
        })
        .collect();
    if let Some(conjunction) = slice.manual_conjunction.as_deref().filter(|text| !text.is_empty()) {
        parts.push(conjunction.to_string());
    }
    if parts.is_empty() {
        "all rows".to_string()
    } else {
        parts.join(" and ")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn analysis() -> Analysis {
        serde_json::from_value(json!({
            "id": "A1",
            "version": 3,
            "name": "Orders",
            "table": "orders",
            "qubes": [{
                "id": "Q1",
                "name": "Counts",
                "sliceId": "S1",
                "queries": [{ "id": "R1", "name": "Total", "diql": "select count()" }]
            }],
            "slices": [{
                "id": "S1",
                "name": "West",
                "manualConjunction": "total > 10",
                "sliceDisjunctions": [{ "fieldName": "state", "disjunctionValues": ["CA", "NV"] }]
            }]
        }))
        .expect("analysis should decode")
    }

    #[test]
    fn human_output_lists_structure_and_newest_version() {
        let text = format_human(&ShowOutput { analysis: analysis(), newest_version: Some(5) });

        assert!(text.starts_with("Orders (A1) version 3 [newest: 5]"));
        assert!(text.contains("  S1  West  state in [CA, NV] and total > 10"));
        assert!(text.contains("  Q1  Counts  (slice S1)"));
        assert!(text.contains("    R1  Total  select count()"));
    }

    #[test]
    fn empty_slice_selects_all_rows() {
        let slice = Slice { id: "S2".into(), ..Slice::default() };
        assert_eq!(describe_selection(&slice), "all rows");
    }
}
