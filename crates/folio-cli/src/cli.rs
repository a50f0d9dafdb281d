//! CLI argument definitions for Folio.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use folio_search::Priority;

/// Folio -- cited answers about what you are reading.
#[derive(Parser)]
#[command(
    name = "folio",
    version,
    about = "Folio -- cited answers about what you are reading",
    long_about = "Ask questions about a book and get streamed, cited answers. Answers are \
                  cached locally and requests are rate limited."
)]
pub struct Cli {
    /// Path to the configuration file (TOML, or JSON by extension).
    #[arg(long, short, global = true, default_value = "config/folio.toml")]
    pub config: PathBuf,

    /// Default log level when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a question and stream the answer.
    Ask {
        /// The question.
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        /// What you are reading, e.g. "Dune by Frank Herbert".
        #[arg(long)]
        context: Option<String>,

        /// Scheduling priority if the request has to wait.
        #[arg(long, value_enum, default_value_t = PriorityArg::Interactive)]
        priority: PriorityArg,

        /// Print the final answer as JSON instead of streaming text.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or clear the answer cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show configuration and cache status.
    Status,
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Show cache size and counters.
    Stats,
    /// Delete every cached answer.
    Clear,
}

/// Command-line spelling of [`Priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
    Interactive,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Interactive => Priority::Interactive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_joins_words_and_parses_flags() {
        let cli = Cli::try_parse_from([
            "folio", "ask", "who", "is", "Paul?", "--context", "Dune", "--priority", "low",
        ])
        .unwrap();
        match cli.command {
            Commands::Ask {
                query,
                context,
                priority,
                json,
            } => {
                assert_eq!(query.join(" "), "who is Paul?");
                assert_eq!(context.as_deref(), Some("Dune"));
                assert_eq!(Priority::from(priority), Priority::Low);
                assert!(!json);
            }
            _ => panic!("expected ask"),
        }
        assert_eq!(cli.config, PathBuf::from("config/folio.toml"));
    }

    #[test]
    fn ask_requires_a_query() {
        assert!(Cli::try_parse_from(["folio", "ask"]).is_err());
    }

    #[test]
    fn cache_subcommands_and_global_flags() {
        let cli = Cli::try_parse_from(["folio", "cache", "clear", "--config", "x.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheAction::Clear
            }
        ));
        assert_eq!(cli.config, PathBuf::from("x.json"));
    }
}
