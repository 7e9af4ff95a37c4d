//! Tablesync CLI - inspect local stores and the page-fetch order.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use tablesync_common::{TableId, TableObject};
use tablesync_storage::{create_default_registry, LocalStore};
use tablesync_sync::sort_table_ids;

#[derive(Parser)]
#[command(name = "tablesync")]
#[command(about = "Tablesync - offline-first table object replication")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the order in which table pages are fetched.
    Order {
        /// Tables in pull order.
        #[arg(short, long, value_delimiter = ',', required = true)]
        tables: Vec<TableId>,

        /// Tables whose pages are interleaved.
        #[arg(short, long, value_delimiter = ',')]
        parallel: Vec<TableId>,

        /// Page counts as `table:pages`.
        #[arg(long, value_delimiter = ',', value_parser = parse_pages)]
        pages: Vec<(TableId, u32)>,
    },

    /// List table objects of a local store.
    List {
        /// Path to the store.
        #[arg(short, long)]
        store: PathBuf,

        /// Only this table (default: every table).
        #[arg(short, long)]
        table: Option<TableId>,

        /// Include objects pending deletion.
        #[arg(short, long)]
        all: bool,
    },

    /// Show a single table object.
    Show {
        /// Path to the store.
        #[arg(short, long)]
        store: PathBuf,

        /// Uuid of the table object.
        uuid: String,
    },

    /// List entities waiting to be pushed.
    Pending {
        /// Path to the store.
        #[arg(short, long)]
        store: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Order {
            tables,
            parallel,
            pages,
        } => cmd_order(&tables, &parallel, pages),

        Commands::List { store, table, all } => cmd_list(&store, table, all).await,

        Commands::Show { store, uuid } => cmd_show(&store, &uuid).await,

        Commands::Pending { store } => cmd_pending(&store).await,
    }
}

/// Parse a `table:pages` pair.
fn parse_pages(value: &str) -> std::result::Result<(TableId, u32), String> {
    let (table, pages) = value
        .split_once(':')
        .ok_or_else(|| format!("expected table:pages, got '{}'", value))?;
    let table = table
        .trim()
        .parse()
        .map_err(|e| format!("invalid table id '{}': {}", table, e))?;
    let pages = pages
        .trim()
        .parse()
        .map_err(|e| format!("invalid page count '{}': {}", pages, e))?;
    Ok((table, pages))
}

/// Open an existing file-backed store.
async fn open_store(path: &Path) -> Result<LocalStore> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Store {} does not exist", path.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("Store {} is not a directory", path.display());
    }

    let registry = create_default_registry();
    let config = serde_json::json!({
        "path": path.to_string_lossy()
    });

    let backend = registry
        .resolve("file", config)
        .context("Failed to open store")?;
    debug!("Opened {} store at {}", backend.name(), path.display());

    Ok(LocalStore::open(backend, Vec::new()).await)
}

fn print_object(object: &TableObject) {
    let kind = if object.is_file { "FILE" } else { "OBJ " };
    println!(
        "  [{}] {} table={} status={:?} etag={}",
        kind,
        object.uuid,
        object.table_id,
        object.upload_status,
        object.etag.as_deref().unwrap_or("-")
    );
}

/// Print the page-fetch order.
fn cmd_order(tables: &[TableId], parallel: &[TableId], pages: Vec<(TableId, u32)>) -> Result<()> {
    let pages: HashMap<TableId, u32> = pages.into_iter().collect();
    let order = sort_table_ids(tables, parallel, &pages);

    let order: Vec<String> = order.iter().map(|id| id.to_string()).collect();
    println!("{}", order.join(","));
    Ok(())
}

/// List table objects.
async fn cmd_list(path: &Path, table: Option<TableId>, all: bool) -> Result<()> {
    let store = open_store(path).await?;
    let objects = store.get_all_table_objects(table.unwrap_or(-1), all).await;

    if objects.is_empty() {
        println!("No table objects.");
    } else {
        println!("{} table objects:", objects.len());
        for object in &objects {
            print_object(object);
        }
    }

    Ok(())
}

/// Show a single table object as JSON.
async fn cmd_show(path: &Path, uuid: &str) -> Result<()> {
    let store = open_store(path).await?;
    let object = store
        .get_table_object(uuid, None)
        .await
        .with_context(|| format!("Table object {} not found", uuid))?;

    println!("{}", serde_json::to_string_pretty(&object)?);
    if object.is_file {
        match store.get_file(uuid).await {
            Some(data) => println!("Payload: {} bytes", data.len()),
            None => println!("Payload: not downloaded"),
        }
    }

    Ok(())
}

/// List dirty table objects and notifications.
async fn cmd_pending(path: &Path) -> Result<()> {
    let store = open_store(path).await?;

    let objects: Vec<TableObject> = store
        .get_all_table_objects(-1, true)
        .await
        .into_iter()
        .filter(|o| o.upload_status.is_dirty())
        .collect();
    let notifications: Vec<_> = store
        .get_all_notifications(true)
        .await
        .into_iter()
        .filter(|n| n.upload_status.is_dirty())
        .collect();

    if objects.is_empty() && notifications.is_empty() {
        println!("Nothing to push.");
        return Ok(());
    }

    // Pushed newest first
    for object in objects.iter().rev() {
        print_object(object);
    }
    for notification in &notifications {
        println!(
            "  [NOTE] {} status={:?}",
            notification.uuid, notification.upload_status
        );
    }

    Ok(())
}
