use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pagestore::core::{Record, RecordId, StoreConfig};
use pagestore::store::{PageStore, PAGES};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pagestore")]
#[command(about = "Persistent page store with section hierarchy assembly")]
#[command(version)]
struct Cli {
    /// TOML 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 覆盖配置中的数据目录
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import JSON-lines records into a collection
    Import {
        /// One record per line
        file: PathBuf,

        #[arg(long, default_value = PAGES)]
        collection: String,
    },

    /// Assemble the section hierarchy of the primary collection
    Assemble,

    /// Print the store report
    Stats,

    /// Print a record (with adjacency) as JSON
    Show { id: String },
}

fn resolve_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if config.data_dir.is_none() {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        config.data_dir = Some(base.join("pagestore"));
    }
    Ok(config)
}

fn import(store: &PageStore, file: &PathBuf, collection: &str) -> anyhow::Result<usize> {
    let reader = BufReader::new(
        std::fs::File::open(file).with_context(|| format!("open {}", file.display()))?,
    );
    let mut queued = 0usize;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", file.display(), lineno + 1))?;
        store.enqueue(collection, record)?;
        queued += 1;
    }
    store.flush()?;
    Ok(queued)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    info!(
        "Opening pagestore at {}",
        config
            .data_dir
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );
    let store = PageStore::open(config).await?;

    match &cli.command {
        Commands::Import { file, collection } => {
            let n = import(&store, file, collection)?;
            store.checkpoint().await?;
            info!("Imported {} records into {}", n, collection);
        }
        Commands::Assemble => {
            let report = store.assemble()?;
            store.checkpoint().await?;
            println!("{}", report);
        }
        Commands::Stats => {
            println!("{}", store.report());
        }
        Commands::Show { id } => match store.get_record(&RecordId::new(id.as_str())) {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("record not found: {}", id),
        },
    }
    Ok(())
}
