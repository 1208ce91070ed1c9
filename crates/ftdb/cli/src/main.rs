// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! FTDB CLI Tool
//!
//! Command-line utility for inspecting an FTDB environment: dump dictionaries, list them,
//! verify their trees and force a checkpoint.

use std::fmt::Write as _;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ftdb_core::{Dictionary, DictionaryOptions, EnvConfig, Environment, ErrorKind, StorageError};
use tracing::{error, info};

/// Exit status for storage failures and missing dictionaries
const EXIT_FAILURE: i32 = 1;
/// Exit status for usage errors, matching clap's
const EXIT_USAGE: i32 = 2;

#[derive(Parser)]
#[command(name = "ftdb")]
#[command(about = "FTDB - transactional ordered key-value engine utility")]
#[command(version = "0.1.0")]
struct Cli {
    /// Environment directory
    #[arg(long, short = 'e', global = true, default_value = ".")]
    env_dir: PathBuf,

    /// JSON file with environment options; `--env-dir` overrides its directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every key and value of a dictionary in hex
    Dump {
        /// Dictionary name; every dictionary when omitted
        #[arg(long, short = 's')]
        subdb: Option<String>,
    },
    /// List dictionaries with role, entry count and upgrade progress
    List,
    /// Check the tree structure of dictionaries
    Verify {
        /// Dictionary name; every dictionary when omitted
        #[arg(long, short = 's')]
        subdb: Option<String>,
    },
    /// Open the environment, recovering if needed, checkpoint and close
    Checkpoint,
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = Cli::parse();

    let env = match open_environment(&cli) {
        Ok(env) => env,
        Err(e) => {
            error!("Failed to open environment {}: {:#}", cli.env_dir.display(), e);
            process::exit(exit_code(&e));
        }
    };

    let result = match cli.command {
        Commands::Dump { subdb } => handle_dump(&env, subdb.as_deref()),
        Commands::List => handle_list(&env),
        Commands::Verify { subdb } => handle_verify(&env, subdb.as_deref()),
        Commands::Checkpoint => handle_checkpoint(&env),
    };
    let closed = env.close().map_err(anyhow::Error::from);
    let result = result.and(closed);

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(exit_code(&e));
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<EnvConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<EnvConfig>(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => EnvConfig::default(),
    };
    config.env_dir = cli.env_dir.clone();
    config.checkpoint_period = 0;
    Ok(config)
}

/// Opens an existing environment; only `checkpoint` opens it writable.
fn open_environment(cli: &Cli) -> anyhow::Result<Environment> {
    let mut config = load_config(cli)?;
    if !Environment::exists(&config.env_dir) {
        return Err(StorageError::NotFound(format!("no environment in {}", config.env_dir.display())).into());
    }
    config.read_only = !matches!(cli.command, Commands::Checkpoint);
    Ok(Environment::open(config)?)
}

/// Usage errors exit with 2, everything else with 1.
fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<StorageError>() {
        Some(storage) if storage.kind() == ErrorKind::Usage => EXIT_USAGE,
        Some(_) => EXIT_FAILURE,
        None if e.downcast_ref::<serde_json::Error>().is_some() => EXIT_USAGE,
        None => EXIT_FAILURE,
    }
}

/// Dictionaries named on the command line, or all of them.
fn dictionaries(env: &Environment, name: Option<&str>) -> anyhow::Result<Vec<Dictionary>> {
    let names = match name {
        Some(name) => vec![name.to_string()],
        None => env.dictionary_names(),
    };
    names.iter().map(|name| env.open_dictionary(name, DictionaryOptions::existing()).map_err(anyhow::Error::from)).collect()
}

/// One line per byte string: a space and two hex digits per byte.
fn hex_line(bytes: &[u8]) -> String {
    let mut line = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        let _ = write!(line, " {byte:02x}");
    }
    line
}

fn handle_dump(env: &Environment, name: Option<&str>) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for dictionary in dictionaries(env, name)? {
        let txn = env.begin()?;
        let mut cursor = dictionary.cursor(&txn)?;
        let mut count = 0u64;
        while let Some(entry) = cursor.next()? {
            writeln!(out, "{}", hex_line(&entry.key))?;
            writeln!(out, "{}", hex_line(&entry.value))?;
            count += 1;
        }
        cursor.close();
        txn.commit()?;
        info!("Dumped {} entries of dictionary {}", count, dictionary.name());
    }
    out.flush()?;
    Ok(())
}

fn handle_list(env: &Environment) -> anyhow::Result<()> {
    let all = dictionaries(env, None)?;
    if all.is_empty() {
        println!("No dictionaries found");
    }
    for dictionary in &all {
        let report = dictionary.verify()?;
        let progress = dictionary.upgrade_progress();
        println!(
            "{}\t{:?}\tentries={}\tlegacy_nodes={}\ttarget={}",
            dictionary.name(),
            dictionary.role(),
            report.entries,
            progress.legacy_remaining,
            progress.target
        );
    }
    info!("Listed {} dictionaries", all.len());
    Ok(())
}

fn handle_verify(env: &Environment, name: Option<&str>) -> anyhow::Result<()> {
    for dictionary in dictionaries(env, name)? {
        let report = dictionary.verify().with_context(|| format!("verifying {}", dictionary.name()))?;
        println!("{}: {}", dictionary.name(), serde_json::to_string(&report)?);
    }
    Ok(())
}

fn handle_checkpoint(env: &Environment) -> anyhow::Result<()> {
    let record = env.checkpoint()?;
    println!("Checkpoint {} written at {}", record.id, record.end_lsn);
    info!("Checkpoint {} covers {} dictionaries", record.id, record.dictionaries.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_line_format() {
        assert_eq!(hex_line(&[0x00, 0xab, 0x10]), " 00 ab 10");
        assert_eq!(hex_line(&[]), "");
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::from(StorageError::Usage("bad".into()));
        let missing = anyhow::Error::from(StorageError::NotFound("main".into()));
        let corrupt = anyhow::Error::from(StorageError::Corruption("torn".into()));
        assert_eq!(exit_code(&usage), EXIT_USAGE);
        assert_eq!(exit_code(&missing), EXIT_FAILURE);
        assert_eq!(exit_code(&corrupt), EXIT_FAILURE);
    }

    #[test]
    fn test_missing_environment_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere");
        for command in ["dump", "list", "verify", "checkpoint"] {
            let cli = Cli::try_parse_from(["ftdb", "--env-dir", missing.to_str().unwrap(), command]).unwrap();
            let err = open_environment(&cli).err().unwrap();
            assert_eq!(exit_code(&err), EXIT_FAILURE);
        }
        assert!(!missing.exists());
    }

    #[test]
    fn test_inspection_commands_open_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = EnvConfig::new(dir.path()).with_node_size(4096).with_checkpoint_period(0);
        let env = Environment::open(config).unwrap();
        drop(env.open_dictionary("main", DictionaryOptions::default()).unwrap());
        env.close().unwrap();

        let env_dir = dir.path().to_str().unwrap();
        let cli = Cli::try_parse_from(["ftdb", "--env-dir", env_dir, "dump"]).unwrap();
        let env = open_environment(&cli).unwrap();
        assert!(env.config().read_only);
        assert_eq!(env.config().node_size, 4096);
        assert!(env.checkpoint().is_err());
        env.close().unwrap();

        let cli = Cli::try_parse_from(["ftdb", "--env-dir", env_dir, "checkpoint"]).unwrap();
        let env = open_environment(&cli).unwrap();
        assert!(!env.config().read_only);
        handle_checkpoint(&env).unwrap();
        env.close().unwrap();
    }

    #[test]
    fn test_cli_parses_dump_with_subdb() {
        let cli = Cli::try_parse_from(["ftdb", "--env-dir", "/tmp/env", "dump", "-s", "main"]).unwrap();
        assert_eq!(cli.env_dir, PathBuf::from("/tmp/env"));
        assert!(matches!(cli.command, Commands::Dump { subdb: Some(ref name) } if name == "main"));
    }
}
