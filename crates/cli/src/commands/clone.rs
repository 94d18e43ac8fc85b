// `diql clone`: copy an analysis version into a new analysis.

use clap::Args;
use diql_common::analysis::Analysis;

use super::Session;
use crate::output;

#[derive(Debug, Args)]
pub struct CloneArgs {
    /// Analysis id to clone.
    pub analysis: String,

    /// Version to clone (defaults to the newest).
    #[arg(long)]
    pub version: Option<i64>,
}

pub async fn run(session: &Session, args: CloneArgs) -> anyhow::Result<()> {
    let mut connection = session.connect().await?;
    connection.load(&args.analysis, args.version).await?;

    let cloned = connection.client.documents().clone_and_load_current_analysis().await;
    let clone = match cloned {
        Ok(clone) => clone,
        Err(error) => {
            let action = format!("failed to clone analysis {}", args.analysis);
            return Err(connection.explain(error, action));
        }
    };
    output::print_output(session.format, &clone, |clone| format_human(&args.analysis, clone))?;
    Ok(())
}

fn format_human(source: &str, clone: &Analysis) -> String {
    format!("cloned {source} into {} (version {})", clone.id, clone.version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_output_names_both_analyses() {
        let clone = Analysis { id: "A2".into(), version: 1, ..Analysis::default() };
        assert_eq!(format_human("A1", &clone), "cloned A1 into A2 (version 1)");
    }
}
