use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "vaultpref",
    about = "Encrypted local preference store",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the value stored under a key.
    Get { key: String },
    /// Store a value. Multiple words are joined with spaces, or form the set for `--type string-set`.
    Put {
        key: String,
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        value: Vec<String>,
        #[arg(long = "type", value_enum, default_value_t = ValueType::String)]
        kind: ValueType,
        /// Return once visible instead of waiting for the write to reach disk.
        #[arg(long)]
        apply: bool,
    },
    /// Remove one or more keys.
    Remove {
        #[arg(required = true, num_args = 1..)]
        keys: Vec<String>,
        #[arg(long)]
        apply: bool,
    },
    /// Print every stored key and value.
    List,
    /// Remove everything.
    Clear {
        #[arg(long)]
        apply: bool,
    },
    /// Import a JSON snapshot of `{"key": {"type": ..., "value": ...}}`.
    Import {
        path: PathBuf,
        #[arg(long)]
        apply: bool,
    },
    /// Round-trip a probe value through the encrypted store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Int,
    Long,
    Float,
    Bool,
    StringSet,
}
