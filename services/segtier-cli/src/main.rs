use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use segtier_core::{EventSink, QueryRange, SegmentKey, TierConfig, TracingEventSink};
use segtier_storage::{
    BlobStore, ColdRangeReader, FileLogStore, LocalBlobStore, S3BlobStore, S3Config, TieredLog,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod records;
mod time_expr;

use records::{copy_records, RecordPrefix};
use time_expr::{parse_duration, TimeExpr};

#[derive(Parser, Debug)]
#[command(name = "segtier")]
#[command(about = "Cold-storage tiering for segmented logs", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to SEGTIER_CONFIG / ./config/segtier)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cold bucket, overriding the configured one
    #[arg(long, env = "SEGTIER_BUCKET", global = true)]
    bucket: Option<String>,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Root directory of the local blob store (used unless --s3-region is set)
    #[arg(long, env = "SEGTIER_BLOB_ROOT", default_value = "./cold", global = true)]
    blob_root: PathBuf,

    /// S3 region; selects the S3 backend
    #[arg(long, env = "SEGTIER_S3_REGION", global = true)]
    s3_region: Option<String>,

    /// S3-compatible endpoint (MinIO etc.)
    #[arg(long, env = "SEGTIER_S3_ENDPOINT", global = true)]
    s3_endpoint: Option<String>,

    /// S3 access key
    #[arg(long, env = "SEGTIER_S3_ACCESS_KEY", global = true)]
    s3_access_key: Option<String>,

    /// S3 secret key
    #[arg(long, env = "SEGTIER_S3_SECRET_KEY", global = true, hide_env_values = true)]
    s3_secret_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Archive purgeable segments into the cold tier
    Archive {
        /// Directory of sealed `<low>-<high>.flushed` segment files
        #[arg(long)]
        segments: PathBuf,

        /// Archive segments last written longer ago than this (e.g. 1h, 2d)
        #[arg(long, default_value = "1h")]
        older_than: String,
    },

    /// Stream archived records for a time range to stdout, one per line
    Retrieve {
        /// Start of the range: now, a duration ago, RFC 3339 or a segment id
        #[arg(long, default_value = "1h")]
        from: String,

        /// End of the range, same forms as --from
        #[arg(long, default_value = "now")]
        to: String,

        /// Prefix for each record: none strips the record id
        #[arg(long, value_enum, default_value = "none")]
        prefix: RecordPrefix,
    },

    /// List cold objects with their decoded ranges
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = open_store(&cli.store).await?;
    let sink: Arc<dyn EventSink> = Arc::new(TracingEventSink);

    match cli.command {
        Commands::Archive {
            segments,
            older_than,
        } => archive(store, config, sink, segments, &older_than).await,
        Commands::Retrieve { from, to, prefix } => {
            retrieve(store, config, sink, &from, &to, prefix).await
        }
        Commands::List => list(store, &config).await,
    }
}

/// Logs go to stderr; stdout carries retrieved content.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<TierConfig> {
    let config = match &cli.config {
        Some(path) => TierConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TierConfig::load().context("failed to load config")?,
    };

    Ok(match &cli.bucket {
        Some(bucket) => config.with_bucket(bucket),
        None => config,
    })
}

async fn open_store(args: &StoreArgs) -> Result<Arc<dyn BlobStore>> {
    let Some(region) = &args.s3_region else {
        info!("Using local blob store at {}", args.blob_root.display());
        let store = LocalBlobStore::new(&args.blob_root)
            .await
            .with_context(|| format!("failed to open {}", args.blob_root.display()))?;
        return Ok(Arc::new(store));
    };

    let s3_config = match (&args.s3_endpoint, &args.s3_access_key, &args.s3_secret_key) {
        (Some(endpoint), Some(access), Some(secret)) => {
            S3Config::new(region).with_endpoint(endpoint, access, secret)
        }
        (Some(_), _, _) => {
            return Err(anyhow!(
                "--s3-endpoint requires --s3-access-key and --s3-secret-key"
            ))
        }
        _ => S3Config::new(region),
    };

    info!("Using S3 blob store in {}", region);
    let store = S3BlobStore::new(s3_config)
        .await
        .context("failed to initialise S3 client")?;
    Ok(Arc::new(store))
}

async fn archive(
    store: Arc<dyn BlobStore>,
    config: TierConfig,
    sink: Arc<dyn EventSink>,
    segments: PathBuf,
    older_than: &str,
) -> Result<()> {
    let age = parse_duration(older_than)
        .ok_or_else(|| anyhow!("`{older_than}` is not a duration like 1h, 90m or 2d"))?;
    let cutoff = Utc::now() - age;

    let local = FileLogStore::new(&segments)
        .await
        .with_context(|| format!("failed to open segment directory {}", segments.display()))?;
    let log = TieredLog::new(Arc::new(local), store, config, sink)
        .await
        .context("failed to set up cold tier")?;

    info!("Archiving segments older than {}", cutoff);
    let report = log.archive_purgeable(cutoff).await?;
    log.close().await?;

    for (segment, error) in &report.failed {
        eprintln!("failed: {segment}: {error}");
    }
    let summary = report.summary();
    println!(
        "archived {} segment(s), {} -> {} bytes, {} failed",
        summary.archived, summary.bytes_read, summary.bytes_written, summary.failed
    );

    if report.is_complete() {
        Ok(())
    } else {
        Err(anyhow!("{} segment(s) could not be archived", summary.failed))
    }
}

async fn retrieve(
    store: Arc<dyn BlobStore>,
    config: TierConfig,
    sink: Arc<dyn EventSink>,
    from: &str,
    to: &str,
    prefix: RecordPrefix,
) -> Result<()> {
    let now = Utc::now();
    let query = QueryRange::new(
        TimeExpr::parse(from, now)?.lower(),
        TimeExpr::parse(to, now)?.upper(),
    );
    info!("Retrieving {} .. {}", query.from.time, query.to.time);

    let reader = ColdRangeReader::new(store.clone(), config, sink);
    let stream = reader.open_range(query);
    let mut stdout = tokio::io::stdout();
    let copied = copy_records(stream, &mut stdout, prefix)
        .await
        .context("failed to write to stdout")?;
    tokio::io::AsyncWriteExt::flush(&mut stdout).await?;

    info!("Retrieved {} bytes", copied);
    store.close().await?;
    Ok(())
}

async fn list(store: Arc<dyn BlobStore>, config: &TierConfig) -> Result<()> {
    let objects = store
        .list_objects(&config.bucket)
        .await
        .with_context(|| format!("failed to list bucket {}", config.bucket))?;

    for object in objects {
        match SegmentKey::decode(&object.key) {
            Ok(key) => println!(
                "{}\t{}\t{}\t{}",
                object.key,
                key.range().low().datetime().to_rfc3339(),
                key.range().high().datetime().to_rfc3339(),
                object.size_bytes
            ),
            Err(_) => println!("{}\t-\t-\t{}", object.key, object.size_bytes),
        }
    }

    store.close().await?;
    Ok(())
}
