use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use stagecache::cache::{RecordId, ResourceStore, SqliteStorage};
use stagecache::config::Config;
use stagecache::logging;

#[derive(Parser, Debug)]
#[command(name = "stagecache")]
#[command(about = "Inspect and edit an offline record cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stagecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database, overriding the configured one
  #[arg(short, long)]
  database: Option<PathBuf>,

  /// Resource type to operate on
  #[arg(short, long)]
  resource: String,

  /// Query parameters of the cached scope, as JSON
  #[arg(short, long, default_value = "{}")]
  scope: String,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Store one or more JSON documents
  Put { docs: Vec<String> },
  /// Merge-patch a record
  Patch { id: String, patch: String },
  /// Destroy records
  Rm { ids: Vec<String> },
  /// List cached records, or show one
  Ls { id: Option<String> },
  /// Show local and shadow copies side by side
  Cache {
    /// Only records with unsynced changes
    #[arg(long)]
    pending: bool,
  },
  /// Mark records as synced
  Sync { ids: Vec<String> },
  /// Remove every row of the scope
  Purge,
}

/// Parse a command line id: JSON numbers and strings keep their type,
/// anything else is taken as a string.
fn parse_id(raw: &str) -> RecordId {
  serde_json::from_str::<Value>(raw)
    .ok()
    .and_then(|v| RecordId::from_value(&v).ok())
    .unwrap_or_else(|| RecordId::Str(raw.to_string()))
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON '{}': {}", raw, e))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let path = match args.database.or_else(|| config.database.clone()) {
    Some(path) => path,
    None => SqliteStorage::default_path()?,
  };
  let storage = Arc::new(SqliteStorage::open_at(&path)?);

  let scope = parse_json(&args.scope)?;
  let store: ResourceStore<Value, _> = ResourceStore::new(storage, &args.resource, &scope)
    .with_pipeline(config.pipeline())
    .with_options(config.store_options());

  match args.command {
    Command::Put { docs } => {
      let docs = docs
        .iter()
        .map(|d| parse_json(d))
        .collect::<Result<Vec<_>>>()?;
      let stored = store.batch_store(docs).await?;
      print(&stored)?;
    }
    Command::Patch { id, patch } => {
      let updated = store.update(parse_id(&id), parse_json(&patch)?).await?;
      print(&updated)?;
    }
    Command::Rm { ids } => {
      store
        .batch_destroy(ids.iter().map(|id| parse_id(id)))
        .await?;
    }
    Command::Ls { id: Some(id) } => print(&store.refresh(parse_id(&id)).await?)?,
    Command::Ls { id: None } => print(&store.refresh_all().await?)?,
    Command::Cache { pending } => {
      let entries = if pending {
        store.pending().await?
      } else {
        store.get_cache().await?
      };
      print(&entries)?;
    }
    Command::Sync { ids } => {
      let cleared = store.sync(ids.iter().map(|id| parse_id(id))).await?;
      println!("{} of {} record(s) synced", cleared, ids.len());
    }
    Command::Purge => {
      let removed = store.purge().await?;
      println!("{} row(s) removed", removed);
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_id() {
    assert_eq!(parse_id("5"), RecordId::Int(5));
    assert_eq!(parse_id("\"5\""), RecordId::from("5"));
    assert_eq!(parse_id("abc"), RecordId::from("abc"));
    assert_eq!(parse_id("1.5"), RecordId::from("1.5"));
  }

  #[test]
  fn test_args_parse() {
    let args = Args::try_parse_from([
      "stagecache",
      "--resource",
      "todo",
      "--scope",
      r#"{"page":1}"#,
      "sync",
      "1",
      "\"2\"",
    ])
    .unwrap();
    assert_eq!(args.resource, "todo");
    match args.command {
      Command::Sync { ids } => assert_eq!(ids, vec!["1", "\"2\""]),
      other => panic!("unexpected command {:?}", other),
    }
  }
}
