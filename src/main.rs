use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use graphdao::{
    DataStack, EntityCatalog, JsonUpserter, MergePolicy, PrimaryKeyTable, StackConfig,
    UpsertOptions,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "graphdao")]
#[command(about = "Ingest JSON documents into a managed object store")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct StoreArgs {
    /// Model document: {"entities": [...]}
    #[arg(long)]
    model: PathBuf,
    /// memory:// or binary://<path>
    #[arg(long, default_value = "memory://")]
    store: String,
    /// Conflict resolution on save: error, object or store
    #[arg(long, value_parser = parse_merge_policy)]
    merge_policy: Option<MergePolicy>,
}

fn parse_merge_policy(name: &str) -> std::result::Result<MergePolicy, String> {
    MergePolicy::parse(name)
        .ok_or_else(|| format!("unknown merge policy '{}' (expected error, object or store)", name))
}

#[derive(Subcommand)]
enum Command {
    /// Upsert a JSON document and save it
    Ingest {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        root: String,
        /// Primary keys, e.g. User=id or Profile=id,userId
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        /// JSON to store renames, e.g. User.profiles=profileSet
        #[arg(long = "rename")]
        renames: Vec<String>,
        /// Skip fields the model does not declare
        #[arg(long)]
        lenient: bool,
        input: PathBuf,
    },
    /// Count committed objects of an entity
    Count {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        entity: String,
    },
    /// Delete every object of an entity
    Purge {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        entity: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "graphdao=debug" } else { "graphdao=info" };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Ingest {
            store,
            root,
            keys,
            renames,
            lenient,
            input,
        } => {
            let policy = build_policy(&keys, &renames)?;
            let options = if lenient {
                UpsertOptions::lenient()
            } else {
                UpsertOptions::default()
            };
            let entity = root.clone();
            let produced = ingest(&store, root, policy, options, &input).await?;
            println!("Upserted {} {} object(s)", produced, entity);
            Ok(())
        }
        Command::Count { store, entity } => {
            let stack = open_stack(&store)?;
            println!("{}", stack.store().count(&entity)?);
            Ok(())
        }
        Command::Purge { store, entity } => {
            let mut stack = open_stack(&store)?;
            let deleted = stack
                .view_context()
                .batch_delete(&entity, None)?;
            println!("Deleted {} {} object(s)", deleted.len(), entity);
            Ok(())
        }
    }
}

fn open_stack(args: &StoreArgs) -> Result<DataStack> {
    let model = fs::read_to_string(&args.model)
        .with_context(|| format!("Failed to read model '{}'", args.model.display()))?;
    let catalog = EntityCatalog::from_json(&model)
        .with_context(|| format!("Invalid model '{}'", args.model.display()))?;
    let mut config = StackConfig::from_url(&args.store)?;
    if let Some(policy) = args.merge_policy {
        config = config
            .view_merge_policy(policy)
            .background_merge_policy(policy);
    }
    Ok(DataStack::open(config, catalog)?)
}

async fn ingest(
    args: &StoreArgs,
    root: String,
    policy: PrimaryKeyTable,
    options: UpsertOptions,
    input: &Path,
) -> Result<usize> {
    let document = fs::read_to_string(input)
        .with_context(|| format!("Failed to read input '{}'", input.display()))?;
    let stack = open_stack(args)?;
    let handle = stack.spawn_background_context();

    let produced = handle
        .perform_dao(move |dao| -> graphdao::UpsertResult<usize> {
            let upserter = JsonUpserter::with_options(&policy, options);
            let ids = upserter.upsert_str(dao, &document, &root)?;
            dao.context().save()?;
            Ok(ids.len())
        })
        .await??;
    Ok(produced)
}

/// Parse `Entity=field[,field]` keys and `Entity.json=store` renames
fn build_policy(keys: &[String], renames: &[String]) -> Result<PrimaryKeyTable> {
    let mut policy = PrimaryKeyTable::new();

    for spec in keys {
        let (entity, fields) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid key '{}'. Expected format: Entity=field[,field]", spec))?;
        let fields: Vec<String> = fields
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        if fields.is_empty() {
            bail!("Key '{}' lists no fields", spec);
        }
        policy = policy.with_keys(entity.trim(), fields);
    }

    for spec in renames {
        let (source, store_name) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid rename '{}'. Expected format: Entity.json=store", spec))?;
        let (entity, json_name) = source
            .split_once('.')
            .ok_or_else(|| anyhow!("Invalid rename '{}'. Expected format: Entity.json=store", spec))?;
        policy = policy.with_rename(entity.trim(), json_name.trim(), store_name.trim());
    }

    Ok(policy)
}
