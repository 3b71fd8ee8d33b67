use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "cgmtrace",
    about = "Decode, parse and analyze CGM BLE SDK diagnostic logs"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Decrypt and inflate a Logan container into plaintext lines.
    Decode(DecodeArgs),
    /// Parse log files into event records and report parse quality.
    Parse(ParseArgs),
    /// Parse log files and run every analyzer over them.
    Analyze(AnalyzeArgs),
    /// Print the effective configuration.
    Config,
}

#[derive(Debug, Args)]
pub struct DecodeArgs {
    pub path: PathBuf,
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct FileSelection {
    /// Directory the file ids are resolved against.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub root: PathBuf,
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ParseArgs {
    #[command(flatten)]
    pub selection: FileSelection,
    /// Include the parsed records in the output.
    #[arg(long, default_value_t = false)]
    pub records: bool,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub selection: FileSelection,
    /// Restrict the analysis to one session key.
    #[arg(long, value_name = "KEY")]
    pub session: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn decode_accepts_output_path() {
        let cli = Cli::try_parse_from(["cgmtrace", "decode", "raw.log", "--output", "plain.log"])
            .expect("parse");
        let CliCommand::Decode(args) = cli.command else {
            panic!("expected decode");
        };
        assert_eq!(args.path, PathBuf::from("raw.log"));
        assert_eq!(args.output, Some(PathBuf::from("plain.log")));
        assert!(!cli.pretty);
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cgmtrace",
            "analyze",
            "--root",
            "logs",
            "a.log",
            "b.log",
            "--session",
            "L1",
            "--pretty",
            "--config",
            "custom.toml",
        ])
        .expect("parse");
        assert!(cli.pretty);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        let CliCommand::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.selection.root, PathBuf::from("logs"));
        assert_eq!(args.selection.files, vec!["a.log", "b.log"]);
        assert_eq!(args.session.as_deref(), Some("L1"));
    }

    #[test]
    fn parse_requires_at_least_one_file() {
        assert!(Cli::try_parse_from(["cgmtrace", "parse"]).is_err());
        let cli = Cli::try_parse_from(["cgmtrace", "parse", "x.log", "--records"]).expect("parse");
        let CliCommand::Parse(args) = cli.command else {
            panic!("expected parse");
        };
        assert!(args.records);
        assert_eq!(args.selection.root, PathBuf::from("."));
    }
}
