//! # rucms - operator tool for a rucms content store
//!
//! Inspects and maintains a data directory offline: list buckets, dump and
//! restore namespaces as JSON lines, purge a namespace and force a sorted
//! index rebuild.

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

use rucms::{
    Consistency, ContentEngine, EngineConfig, Namespace, NamespaceDescriptor, NoopNotifier, Order,
    QueryOptions, TypeRegistry,
};

/// Operator tool for a rucms content store.
#[derive(Parser, Debug)]
#[command(name = "rucms", version, about = "Operator tool for a rucms content store")]
struct Args {
    /// Path to the data directory of the store.
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Backend page cache size in megabytes.
    #[arg(long, default_value_t = 64)]
    cache_size_mb: u64,

    /// Minimum interval between two sorted index rebuilds, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    debounce_ms: u64,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// List every bucket in the store.
    Buckets,

    /// Write every record of a namespace as one JSON document per line.
    Dump {
        #[arg(long)]
        name: String,

        /// Output file, '-' for stdout.
        #[arg(long, default_value = "-")]
        out: String,
    },

    /// Import records written by `dump`, keeping their ids.
    Restore {
        #[arg(long)]
        name: String,

        /// Input file, '-' for stdin.
        #[arg(long = "in", default_value = "-")]
        input: String,
    },

    /// Print the newest records of a namespace.
    List {
        #[arg(long)]
        name: String,

        /// Number of records, -1 for all.
        #[arg(long, default_value_t = 10, allow_hyphen_values = true)]
        limit: i64,
    },

    /// Delete every record of a namespace.
    Purge {
        #[arg(long)]
        name: String,

        /// Confirm the deletion.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },

    /// Rebuild the sorted index of a namespace now.
    Reindex {
        #[arg(long)]
        name: String,
    },
}

impl Command {
    fn namespace(&self) -> Option<&str> {
        match self {
            Command::Buckets => None,
            Command::Dump { name, .. }
            | Command::Restore { name, .. }
            | Command::List { name, .. }
            | Command::Purge { name, .. }
            | Command::Reindex { name } => Some(name.as_str()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_engine_config(&args);
    let registry = operator_registry(args.command.namespace())?;
    let mut engine = ContentEngine::open(config, registry, Arc::new(NoopNotifier))?;

    let result = run(&engine, &args.command);
    engine.shutdown()?;
    result
}

fn run(engine: &ContentEngine, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Buckets => {
            let backend = engine.backend();
            for name in backend.bucket_names() {
                let len = backend.bucket(&name)?.map(|t| t.len()).unwrap_or(0);
                println!("{}\t{}", name, len);
            }
        }
        Command::Dump { name, out } => {
            let records = engine.repository().get_all(name)?;
            let mut writer = open_output(out)?;
            for raw in &records {
                writer.write_all(raw)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            info!(namespace = %name, records = records.len(), "Dumped namespace");
        }
        Command::Restore { name, input } => {
            let reader = open_input(input)?;
            let mut restored = 0usize;
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match engine.repository().import(name, line.as_bytes()) {
                    Ok(_) => restored += 1,
                    Err(e) => warn!(namespace = %name, line = n + 1, "Skipping record: {}", e),
                }
            }
            let ns = Namespace::parse(name).map_err(anyhow::Error::msg)?;
            engine.maintainer().rebuild(&ns)?;
            info!(namespace = %name, records = restored, "Restored namespace");
        }
        Command::List { name, limit } => {
            let opts = QueryOptions {
                count: *limit,
                offset: 0,
                order: Order::Desc,
            };
            let page = engine.query().paginate(name, &opts)?;
            for raw in &page.records {
                println!("{}", String::from_utf8_lossy(raw));
            }
            eprintln!("{} of {} records", page.records.len(), page.total);
        }
        Command::Purge { name, yes } => {
            if !yes {
                anyhow::bail!("refusing to purge {} without --yes", name);
            }
            let ids = engine.query().keys(name, false)?;
            for id in &ids {
                engine.repository().delete(name, id, Consistency::Eventual)?;
            }
            let ns = Namespace::parse(name).map_err(anyhow::Error::msg)?;
            engine.maintainer().rebuild(&ns)?;
            info!(namespace = %name, records = ids.len(), "Purged namespace");
        }
        Command::Reindex { name } => {
            let ns = Namespace::parse(name).map_err(anyhow::Error::msg)?;
            let count = engine.maintainer().rebuild(&ns)?;
            println!("{} records indexed", count);
        }
    }
    Ok(())
}

/// Registers a default descriptor for the namespace an operator command
/// targets. Records are kept as stored; only the engine fields are interpreted.
fn operator_registry(namespace: Option<&str>) -> anyhow::Result<TypeRegistry> {
    let registry = TypeRegistry::new();
    match namespace {
        Some(name) => {
            let ns = Namespace::parse(name).map_err(anyhow::Error::msg)?;
            Ok(registry.register(NamespaceDescriptor::new(ns.kind())))
        }
        None => Ok(registry),
    }
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Build EngineConfig from CLI arguments.
fn build_engine_config(args: &Args) -> EngineConfig {
    EngineConfig {
        data_dir: PathBuf::from(&args.data_dir),
        cache_size_mb: args.cache_size_mb,
        debounce_window: Duration::from_millis(args.debounce_ms),
        ..Default::default()
    }
}

fn open_output(path: &str) -> io::Result<Box<dyn Write>> {
    if path == "-" {
        Ok(Box::new(BufWriter::new(io::stdout())))
    } else {
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }
}

fn open_input(path: &str) -> io::Result<Box<dyn BufRead>> {
    if path == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dump() {
        let args = Args::parse_from(["rucms", "--data-dir", "/tmp/x", "dump", "--name", "Post"]);
        assert_eq!(args.data_dir, "/tmp/x");
        assert_eq!(
            args.command,
            Command::Dump {
                name: "Post".to_string(),
                out: "-".to_string()
            }
        );
        assert_eq!(args.command.namespace(), Some("Post"));
    }

    #[test]
    fn test_parse_list_all() {
        let args = Args::parse_from(["rucms", "list", "--name", "Post__pending", "--limit", "-1"]);
        assert_eq!(
            args.command,
            Command::List {
                name: "Post__pending".to_string(),
                limit: -1
            }
        );
    }

    #[test]
    fn test_purge_defaults_to_unconfirmed() {
        let args = Args::parse_from(["rucms", "purge", "--name", "Post"]);
        assert_eq!(
            args.command,
            Command::Purge {
                name: "Post".to_string(),
                yes: false
            }
        );
    }

    #[test]
    fn test_engine_config_from_args() {
        let args = Args::parse_from(["rucms", "--debounce-ms", "250", "buckets"]);
        let config = build_engine_config(&args);
        assert_eq!(config.debounce_window, Duration::from_millis(250));
        assert_eq!(config.cache_size_mb, 64);
        assert_eq!(args.command.namespace(), None);
    }

    #[test]
    fn test_operator_registry_uses_kind() {
        let registry = operator_registry(Some("Post__pending")).unwrap();
        assert!(registry.contains("Post"));
        assert!(operator_registry(Some("__content_index")).is_err());
    }
}
