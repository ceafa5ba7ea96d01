use clap::Parser;
use std::io;
use std::path::PathBuf;

/// Decode a gdb/MI transcript and print every routed record as JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Transcript to replay; reads stdin when omitted
    #[arg(value_name = "transcript", value_parser = parse_path)]
    pub transcript: Option<PathBuf>,

    /// Path of the config file
    #[arg(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub console_log: bool,

    #[arg(long, default_value = "info")]
    pub console_level: String,

    #[arg(long, default_value = "info")]
    pub file_level: String,
}

fn parse_path(path: &str) -> Result<PathBuf, io::Error> {
    PathBuf::from(path).canonicalize()
}
