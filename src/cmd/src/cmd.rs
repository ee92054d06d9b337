use std::fmt::Display;

use clap::{Parser, Subcommand, ValueEnum};

use svcalloc_registry::config::Config;
use svcalloc_trace::init::{TraceConfig, FORMAT_JSON, FORMAT_PLAIN};

use crate::replay::{self, ReplayCmd};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(
        short,
        long,
        global = true,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(
        short = 'o',
        long = "log-file",
        global = true,
        required = false,
        help = "Log output file path"
    )]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, Parser, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "{FORMAT_PLAIN}"),
            Format::Json => write!(f, "{FORMAT_JSON}"),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCmd {
    Replay(ReplayCmd),
    Version,
}

pub fn run() -> anyhow::Result<()> {
    let command = Cmd::parse();

    let trace_conf = TraceConfig {
        level: command.level,
        format: command.format.to_string(),
        file: command.log_file,
    };

    match command.sub {
        SubCmd::Version => println!("dev"),
        SubCmd::Replay(r) => {
            let mut config = match r.config.as_deref() {
                Some(file) => Config::load(file)?,
                None => Config::default(),
            };
            if let Some(dual_stack) = r.dual_stack {
                config.dual_stack = dual_stack;
            }

            replay::start(config, r, trace_conf)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn works_parse_replay() {
        let command = Cmd::try_parse_from([
            "svcalloc",
            "-l",
            "debug",
            "-d",
            "json",
            "replay",
            "-f",
            "requests.yaml",
            "--dual-stack",
            "false",
        ])
        .unwrap();
        assert_eq!(command.level, "debug");
        assert_eq!(command.format.to_string(), FORMAT_JSON);
        match command.sub {
            SubCmd::Replay(r) => {
                assert_eq!(r.file, "requests.yaml");
                assert_eq!(r.config, None);
                assert_eq!(r.dual_stack, Some(false));
                assert!(!r.metrics);
            }
            SubCmd::Version => panic!("this test should be failed"),
        }
    }

    #[test]
    fn works_parse_log_file_after_subcommand() {
        let command = Cmd::try_parse_from([
            "svcalloc",
            "replay",
            "-f",
            "requests.yaml",
            "-o",
            "/tmp/svcalloc.log",
        ])
        .unwrap();
        assert_eq!(command.log_file.as_deref(), Some("/tmp/svcalloc.log"));
    }

    #[test]
    fn fails_parse_replay_without_file() {
        if Cmd::try_parse_from(["svcalloc", "replay"]).is_ok() {
            panic!("this test should be failed")
        }
    }
}
