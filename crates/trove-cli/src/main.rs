use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use trove_client::{FsImageStore, HttpImageFetcher, HttpSourceAdapter, load_sources, registry_from};
use trove_core::job::JobSnapshot;
use trove_core::models::ProductRecord;
use trove_core::request::{ScrapeRequest, SearchFilters, SortOrder};
use trove_core::traits::{NullStore, ProductStore, SourceRegistry};
use trove_core::{EngineConfig, JobManager, TracingJobReporter};
use trove_db::{Database, DatabaseConfig, ProductQuery, ProductRepository, ProductSort};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "trove", version, about = "Product search scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scrape job and print the collected products
    Scrape {
        /// Search terms
        #[arg(short, long)]
        query: String,

        /// Source name from the sources file
        #[arg(short, long)]
        source: String,

        /// Number of products to collect
        #[arg(short, long, default_value_t = 50)]
        max_items: u32,

        #[arg(long)]
        min_price: Option<f64>,

        #[arg(long)]
        max_price: Option<f64>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        condition: Option<String>,

        /// relevance, price_asc, price_desc or newest
        #[arg(long, default_value = "relevance")]
        sort: String,

        /// Drop products whose title contains this term (repeatable)
        #[arg(long = "exclude")]
        exclude_terms: Vec<String>,

        /// Source definitions (JSON)
        #[arg(long, env = "TROVE_SOURCES_FILE", default_value = "sources.json")]
        sources_file: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Store products in the database (requires DATABASE_URL)
        #[arg(long, default_value_t = false)]
        save: bool,

        /// Skip image download and resizing
        #[arg(long, default_value_t = false)]
        no_images: bool,
    },

    /// List stored products
    Products {
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        category: Option<String>,

        /// Case-insensitive title search
        #[arg(short, long)]
        search: Option<String>,

        #[arg(long)]
        min_price: Option<f64>,

        #[arg(long)]
        max_price: Option<f64>,

        /// newest, price_asc or price_desc
        #[arg(long, default_value = "newest")]
        sort: String,

        #[arg(short, long, default_value_t = 20)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trove=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape {
            query,
            source,
            max_items,
            min_price,
            max_price,
            category,
            condition,
            sort,
            exclude_terms,
            sources_file,
            format,
            save,
            no_images,
        } => {
            let sort: SortOrder = sort.parse().map_err(anyhow::Error::msg)?;
            let request = ScrapeRequest::new(query, source, max_items).with_filters(SearchFilters {
                min_price,
                max_price,
                category,
                condition,
                sort,
                exclude_terms,
            });

            let mut config = EngineConfig::from_env()?;
            if no_images {
                config.image.enabled = false;
            }
            let sources = registry_from(
                load_sources(&sources_file)
                    .with_context(|| format!("loading {}", sources_file.display()))?,
            );

            let snapshot = if save {
                let repo = connect_db().await?;
                run_job(config, sources, repo, request).await?
            } else {
                run_job(config, sources, NullStore, request).await?
            };

            let stdout = std::io::stdout();
            write_products(&mut stdout.lock(), &snapshot.results, format)?;
        }
        Commands::Products {
            source,
            category,
            search,
            min_price,
            max_price,
            sort,
            limit,
            offset,
            format,
        } => {
            let sort: ProductSort = sort.parse()?;
            let repo = connect_db().await?;
            let page = repo
                .list(&ProductQuery {
                    source,
                    category,
                    min_price,
                    max_price,
                    search,
                    sort,
                    limit,
                    offset,
                })
                .await?;

            eprintln!("Showing {} of {} stored products", page.products.len(), page.total);
            let stdout = std::io::stdout();
            write_products(&mut stdout.lock(), &page.products, format)?;
        }
    }

    Ok(())
}

async fn connect_db() -> Result<ProductRepository> {
    let config = DatabaseConfig::from_env()
        .context("DATABASE_URL not set. Required for --save and the products command.")?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db.products())
}

/// Start one job, report progress on stderr until it finishes, and return
/// the final snapshot. Ctrl-C cancels the job and keeps what was collected.
async fn run_job<S: ProductStore>(
    config: EngineConfig,
    sources: SourceRegistry<HttpSourceAdapter>,
    store: S,
    request: ScrapeRequest,
) -> Result<JobSnapshot> {
    let fetcher = HttpImageFetcher::new(IMAGE_FETCH_TIMEOUT, config.image.max_bytes)?;
    let image_store = FsImageStore::new(&config.image.storage_dir);
    let manager = JobManager::new(
        config,
        sources,
        store,
        fetcher,
        image_store,
        Arc::new(TracingJobReporter),
    );

    let id = manager.start(request)?;
    tracing::info!(job_id = %id, "Job started");

    let snapshot = tokio::select! {
        result = poll_until_done(&manager, id) => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling job...");
            manager.cancel(id)?;
            poll_until_done(&manager, id).await?
        }
    };

    manager.wait_for_images().await;
    let snapshot = manager.status(id).unwrap_or(snapshot);
    manager.shutdown().await;

    let s = &snapshot.summary;
    eprintln!(
        "Job {} {}: {} products ({} rejected, {} duplicates, {} failed pages)",
        s.id, s.state, s.items_found, s.quality_rejects, s.duplicates, s.error_count
    );
    if let Some(error) = &s.last_error {
        eprintln!("Last error: {error}");
    }
    Ok(snapshot)
}

async fn poll_until_done<A, S, F, I>(
    manager: &JobManager<A, S, F, I>,
    id: Uuid,
) -> Result<JobSnapshot>
where
    A: trove_core::traits::SourceAdapter,
    S: ProductStore,
    F: trove_core::traits::ImageFetcher,
    I: trove_core::traits::ImageStore,
{
    let mut last_reported = None;
    loop {
        let snapshot = manager.status(id)?;
        let s = &snapshot.summary;
        if last_reported != Some((s.items_completed, s.state)) {
            eprintln!(
                "[{}] {}/{} processed ({:.0}%), {} found",
                s.state,
                s.items_completed,
                s.items_requested,
                s.progress * 100.0,
                s.items_found
            );
            last_reported = Some((s.items_completed, s.state));
        }
        if s.state.is_terminal() {
            return Ok(snapshot);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn write_products<W: Write>(out: &mut W, products: &[ProductRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, products)?;
            writeln!(out)?;
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            writer.write_record([
                "fingerprint",
                "title",
                "price",
                "currency",
                "source",
                "category",
                "condition",
                "url",
                "images",
                "captured_at",
            ])?;
            for p in products {
                writer.write_record([
                    p.fingerprint.as_str(),
                    p.title.as_str(),
                    format!("{:.2}", p.price.amount).as_str(),
                    p.price.currency.as_str(),
                    p.source.as_str(),
                    p.category.as_deref().unwrap_or(""),
                    p.condition.as_deref().unwrap_or(""),
                    p.url.as_deref().unwrap_or(""),
                    p.images.join("|").as_str(),
                    p.captured_at.to_rfc3339().as_str(),
                ])?;
            }
            writer.flush()?;
        }
    }
    Ok(())
}
