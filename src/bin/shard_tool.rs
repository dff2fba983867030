use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use docshard::resolver::{self, polynomial_hash};
use docshard::{
    BroadcastEventBus, Document, Filter, FindOptions, InMemoryCache, InMemoryDocumentStore,
    ShardTopologyManager, ShardingConfig, ShardingPolicy, Value,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shard-tool")]
#[command(about = "Developer tooling for docshard placement and rebalancing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Hash,
    Range,
}

#[derive(Subcommand)]
enum Command {
    /// Print the shard each key resolves to under a sharding config file.
    Route {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        collection: String,
        /// JSON literal (`42`, `"abc"`) or bare text.
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
    },
    /// Run an in-memory scenario and print the resulting status as JSON.
    Simulate {
        #[arg(long, default_value_t = 4)]
        shards: usize,
        #[arg(long, default_value_t = 1000)]
        docs: usize,
        #[arg(long, value_enum, default_value_t = Strategy::Hash)]
        strategy: Strategy,
        /// Shards to add after loading.
        #[arg(long, default_value_t = 1)]
        add: usize,
        /// Slot to remove at the end.
        #[arg(long)]
        remove: Option<usize>,
        #[arg(long)]
        policy: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docshard=warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Route {
            config,
            collection,
            keys,
        } => route(&config, &collection, &keys),
        Command::Simulate {
            shards,
            docs,
            strategy,
            add,
            remove,
            policy,
        } => simulate(shards, docs, strategy, add, remove, policy.as_deref()).await,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_key(raw: &str) -> Result<Value> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::try_from(json).map_err(|err| anyhow!("unsupported key '{}': {}", raw, err)),
        Err(_) => Ok(Value::from(raw)),
    }
}

fn route(config_path: &Path, collection: &str, keys: &[String]) -> Result<()> {
    let config: ShardingConfig = read_json(config_path)?;
    config.validate()?;

    for raw in keys {
        let key = parse_key(raw)?;
        let slot = resolver::resolve(&config, &key)?;
        println!(
            "{}\tslot={}\tshard={}\thash={}",
            key,
            slot,
            resolver::shard_name(collection, slot),
            polynomial_hash(&key.key_string())
        );
    }
    Ok(())
}

async fn simulate(
    shards: usize,
    docs: usize,
    strategy: Strategy,
    add: usize,
    remove: Option<usize>,
    policy_path: Option<&Path>,
) -> Result<()> {
    let policy: ShardingPolicy = match policy_path {
        Some(path) => read_json(path)?,
        None => ShardingPolicy::default(),
    };
    let store = InMemoryDocumentStore::shared();
    let events = Arc::new(BroadcastEventBus::default());
    let manager = ShardTopologyManager::new(
        store.clone(),
        Arc::new(InMemoryCache::new()),
        events.clone(),
        policy,
    )?;

    let (collection, config) = match strategy {
        Strategy::Hash => ("users", ShardingConfig::hash("user_id", shards)),
        Strategy::Range => {
            let width = (docs / shards.max(1)).max(1) as i64;
            let boundaries: Vec<i64> = (0..shards as i64).map(|i| i * width).collect();
            ("scores", ShardingConfig::range("score", boundaries))
        }
    };
    let sharded = manager.initialize_sharding(collection, config).await?;

    let batch: Vec<Document> = (0..docs)
        .map(|i| {
            Document::new()
                .with("user_id", format!("user-{}", i))
                .with("score", i as i64)
                .with("payload", "x".repeat(16 + i % 48))
        })
        .collect();
    sharded.bulk_insert(batch).await?;

    for _ in 0..add {
        let report = manager.add_shard(collection).await?;
        eprintln!(
            "added {} (slot {}), moved {} document(s)",
            report.shard_name, report.shard_index, report.migrated_documents
        );
    }
    if let Some(slot) = remove {
        let report = manager.remove_shard(collection, slot).await?;
        eprintln!(
            "removed {}, moved {} document(s)",
            report.shard_name, report.migrated_documents
        );
    }

    let found = sharded.find(&Filter::all(), &FindOptions::new()).await?.len();
    if found != docs {
        return Err(anyhow!("expected {} documents after the scenario, found {}", docs, found));
    }

    let status = manager.status(collection).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    eprintln!("events: {}", events.event_names().join(", "));
    Ok(())
}
