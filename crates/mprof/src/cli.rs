use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mprof")]
#[command(about = "Inspect allocation snapshots written by mprof-trace")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the call sites with the most sampled bytes in a snapshot
    Top {
        /// Snapshot file ({prefix}.{pid}.{tid}.bin)
        file: PathBuf,

        /// Number of entries to display
        #[arg(long, short = 'n', default_value = "20")]
        top: usize,

        /// Binary the snapshot was recorded from, for symbolization
        #[arg(long, short = 'e')]
        exe: Option<PathBuf>,

        /// Load address of the binary, subtracted before symbolization
        #[arg(long, value_parser = parse_hex, requires = "exe")]
        load_base: Option<u64>,

        /// Output as JSON
        #[arg(long, conflicts_with = "csv")]
        json: bool,

        /// Output as CSV
        #[arg(long)]
        csv: bool,
    },

    /// List snapshot files in a directory
    List {
        /// Directory to search (defaults to current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Load snapshot files into a SQLite database
    Import {
        /// Database file (created if missing)
        db: PathBuf,

        /// Snapshot files to import
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Binary the snapshots were recorded from, for symbolization
        #[arg(long, short = 'e')]
        exe: Option<PathBuf>,

        /// Load address of the binary, subtracted before symbolization
        #[arg(long, value_parser = parse_hex, requires = "exe")]
        load_base: Option<u64>,
    },

    /// Execute raw SQL query on an imported database
    Query {
        /// Database file
        db: PathBuf,

        /// SQL query to execute
        sql: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Parse a hex address, with or without a `0x` prefix.
pub fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| format!("Invalid address '{}'. Examples: 0x555555554000, 7f00a000", s))
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Top { top, .. } = &self.command
            && *top == 0
        {
            return Err("--top must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn hex_addresses() {
        assert_eq!(parse_hex("0x1000"), Ok(0x1000));
        assert_eq!(parse_hex("7f00a000"), Ok(0x7f00_a000));
        assert!(parse_hex("0xzz").is_err());
        assert!(parse_hex("").is_err());
    }

    #[test]
    fn top_flags() {
        let cli = Cli::parse_from([
            "mprof", "top", "run.1.2.bin", "-n", "5", "-e", "./app", "--load-base", "0x5555",
            "--json",
        ]);
        match cli.command {
            Command::Top {
                top,
                exe,
                load_base,
                json,
                csv,
                ..
            } => {
                assert_eq!(top, 5);
                assert_eq!(exe, Some(PathBuf::from("./app")));
                assert_eq!(load_base, Some(0x5555));
                assert!(json && !csv);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn json_and_csv_conflict() {
        assert!(Cli::try_parse_from(["mprof", "top", "f.bin", "--json", "--csv"]).is_err());
    }

    #[test]
    fn load_base_needs_binary() {
        assert!(Cli::try_parse_from(["mprof", "top", "f.bin", "--load-base", "1000"]).is_err());
    }

    #[test]
    fn zero_top_is_rejected() {
        let cli = Cli::parse_from(["mprof", "-vv", "top", "f.bin", "-n", "0"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.validate().is_err());
    }
}
