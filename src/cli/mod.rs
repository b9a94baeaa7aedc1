//! Command-line interface.

mod query;
mod serve;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use bizlens::logging::init_logging;
use bizlens::Config;

#[derive(Parser, Debug)]
#[command(name = "bizlens", version, about = "Business-metrics query backend")]
pub(crate) struct Cli {
    /// Config file (default: ~/.bizlens/config.json or $BIZLENS_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run the HTTP API for the dashboard
    Serve {
        /// Bind address, overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one registered query and print the response as JSON
    Query {
        /// Registered query id
        query_id: String,
        /// Parameters as a JSON array, e.g. '["emea", 2024]'
        #[arg(long, default_value = "[]")]
        params: String,
        /// Request an AI narrative
        #[arg(long)]
        analysis: bool,
    },
    /// List registered queries
    Queries,
}

/// Parse arguments, load config, initialise logging and dispatch.
pub(crate) async fn run() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config.logging);

    match cli.command {
        Command::Serve { bind } => serve::cmd_serve(config, bind).await,
        Command::Query {
            query_id,
            params,
            analysis,
        } => query::cmd_query(&config, &query_id, &params, analysis).await,
        Command::Queries => query::cmd_queries(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_command() {
        let cli = Cli::try_parse_from([
            "bizlens",
            "--config",
            "/tmp/c.json",
            "query",
            "revenue",
            "--params",
            r#"["emea"]"#,
            "--analysis",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/c.json")));
        match cli.command {
            Command::Query {
                query_id,
                params,
                analysis,
            } => {
                assert_eq!(query_id, "revenue");
                assert_eq!(params, r#"["emea"]"#);
                assert!(analysis);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_serve_defaults() {
        let cli = Cli::try_parse_from(["bizlens", "serve"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { bind: None }));
    }
}
