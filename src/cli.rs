//! Command-line surface (`spec.md` §6.2's CLI-triggered operations).
//!
//! Grounded on the teacher's `cli/commands.rs` shape (a `Parser` root with
//! a `Subcommand` enum and `#[arg]`-annotated fields), widened from the
//! teacher's three data-plane commands to this crate's four operational
//! ones: running the service, forcing a rebuild, and exporting/importing
//! segment archives.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "spectre")]
#[command(about = "Kubernetes cluster state-history engine")]
pub struct Cli {
    /// Path to a TOML config file. Missing is not an error; defaults apply.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full service: listener, sync pipeline, and the timeline
    /// gRPC server, with an optional startup rebuild.
    Serve,

    /// Force a rebuild from the segment log into the graph, bypassing the
    /// `RebuildIfEmptyOnly` gate, then exit.
    Rebuild {
        /// Replay window, in seconds back from now. Overrides the
        /// configured `[rebuild].window_secs` when set.
        #[arg(long)]
        window_secs: Option<u64>,
    },

    /// Export a time window of sealed segments to a gzipped tar archive.
    Export {
        /// Destination archive path.
        #[arg(short, long)]
        output: PathBuf,
        /// Start of the time window, as Unix seconds.
        #[arg(long)]
        start_secs: i64,
        /// End of the time window, as Unix seconds.
        #[arg(long)]
        end_secs: i64,
    },

    /// Import segments from a gzipped tar archive produced by `export`.
    Import {
        /// Source archive path.
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_a_config_path() {
        let cli = Cli::parse_from(["spectre", "--config", "spectre.toml", "serve"]);
        assert_eq!(cli.config, Some(PathBuf::from("spectre.toml")));
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn parses_export_with_a_time_window() {
        let cli = Cli::parse_from(["spectre", "export", "--output", "out.tar.gz", "--start-secs", "0", "--end-secs", "100"]);
        match cli.command {
            Commands::Export { output, start_secs, end_secs } => {
                assert_eq!(output, PathBuf::from("out.tar.gz"));
                assert_eq!(start_secs, 0);
                assert_eq!(end_secs, 100);
            }
            _ => panic!("expected Export"),
        }
    }
}
