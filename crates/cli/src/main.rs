// diql CLI entry point.

use std::path::PathBuf;
use std::process;

use clap::Parser;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "diql", about = "Command-line client for the diql query service")]
struct Cli {
    /// Config file (defaults to ~/.diql/client.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Service URL, overriding the config file.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Session credential.
    #[arg(long, global = true, env = "DIQL_CREDENTIAL", hide_env_values = true)]
    credential: Option<String>,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.json);
    let session = commands::Session {
        config: cli.config,
        url: cli.url,
        credential: cli.credential,
        format,
    };

    match commands::run(&session, cli.command) {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            output::print_anyhow_error(format, &error);
            ExitCode::from_error(&error).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "diql",
            "run",
            "A1",
            "Q1",
            "R1",
            "--version",
            "4",
            "--url",
            "wss://query.example.com/socket",
        ])
        .expect("arguments should parse");

        assert_eq!(cli.url.as_deref(), Some("wss://query.example.com/socket"));
        match cli.command {
            commands::Command::Run(args) => {
                assert_eq!(args.analysis, "A1");
                assert_eq!(args.qube, "Q1");
                assert_eq!(args.query, "R1");
                assert_eq!(args.version, Some(4));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn show_requires_an_analysis_id() {
        assert!(Cli::try_parse_from(["diql", "show"]).is_err());
    }
}
