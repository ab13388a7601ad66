use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use config::AgentConfig;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, version, about, long_about = None)]
/// Cli tool for validating & printing the agent config
pub struct Args {
    /// path to the agent config. Missing file prints the built-in defaults
    #[clap(short = 'p', long, value_parser)]
    pub path: PathBuf,
    /// print the parsed config as a debug tree or re-emitted YAML
    #[clap(short = 'f', long, value_enum, default_value = "debug")]
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Debug,
    Yaml,
}

fn main() -> Result<()> {
    let args = Args::parse();
    println!("found config at path = {}", args.path.display());

    let cfg = AgentConfig::load(&args.path)?;
    match args.format {
        Format::Debug => {
            println!("{:#?}", cfg);
        }
        Format::Yaml => {
            println!("{}", serde_yaml::to_string(&cfg)?);
        }
    }

    Ok(())
}
