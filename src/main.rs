use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use scrapemark::auth::{Authenticator, LocalAuthenticator, RemoteAuthenticator};
use scrapemark::config::Settings;
use scrapemark::db::{self, Db};
use scrapemark::enrich::{OpenAiSummarizer, Summarizer};
use scrapemark::pipeline::{EnrichmentOutcome, IngestRequest, Pipeline, RegenerateRequest};
use scrapemark::scraper::{FetchedPage, PageFetcher, SpiderFetcher};
use scrapemark::{api, parser};

#[derive(Parser)]
#[command(name = "scrapemark", about = "Scrape pages into collections, extract structure, summarize")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to bind (overrides SCRAPEMARK_BIND)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Scrape one URL into a collection
    Ingest {
        #[arg(long)]
        user: String,
        #[arg(long)]
        collection: String,
        #[arg(long)]
        url: String,
        /// Also generate AI insights
        #[arg(long)]
        enrich: bool,
    },
    /// Regenerate AI insights for a stored page
    Regenerate {
        #[arg(long)]
        user: String,
        #[arg(long)]
        page: String,
    },
    /// Print headings and links extracted from a markdown file
    Parse { file: String },
    /// Manage collections
    Collection {
        #[command(subcommand)]
        command: CollectionCommands,
    },
    /// Show row counts
    Stats,
}

#[derive(Subcommand)]
enum CollectionCommands {
    /// Create a collection and print its id
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Serve { bind } => {
            let db = Db::open(&settings.db_path)?;
            let auth: Arc<dyn Authenticator> = match settings.auth_url.as_deref() {
                Some(url) => Arc::new(RemoteAuthenticator::new(
                    url,
                    settings.auth_api_key.as_deref(),
                    Duration::from_secs(settings.auth_timeout_secs.max(1)),
                )?),
                None => {
                    tracing::warn!("SCRAPEMARK_AUTH_URL not set, trusting bearer tokens as user ids");
                    Arc::new(LocalAuthenticator)
                }
            };
            let pipeline = build_pipeline(&settings, db, auth)?;
            let bind = bind.unwrap_or_else(|| settings.bind.clone());
            api::serve(Arc::new(pipeline), &bind).await
        }
        Commands::Ingest {
            user,
            collection,
            url,
            enrich,
        } => {
            let db = Db::open(&settings.db_path)?;
            let pipeline = build_pipeline(&settings, db, Arc::new(LocalAuthenticator))?;
            let request = IngestRequest {
                url,
                collection_id: collection,
                enrich,
            };
            let outcome = pipeline.ingest(Some(&user), &request).await?;
            let page = &outcome.page;
            println!("Saved page {} ({})", page.id, page.url);
            println!("Title:    {}", page.title);
            println!("Headings: {:?}", outcome.children.headings);
            println!("Links:    {:?}", outcome.children.links);
            match outcome.enrichment {
                EnrichmentOutcome::NotRequested => {}
                EnrichmentOutcome::Unavailable => println!("Insights: skipped (no OpenAI key)"),
                EnrichmentOutcome::Stored(row, action) => {
                    println!("Insights: {:?}, {}", action, row.summary_short)
                }
                EnrichmentOutcome::Failed(e) => println!("Insights: failed ({})", e),
            }
            Ok(())
        }
        Commands::Regenerate { user, page } => {
            let db = Db::open(&settings.db_path)?;
            let pipeline = build_pipeline(&settings, db, Arc::new(LocalAuthenticator))?;
            let row = pipeline
                .regenerate(Some(&user), &RegenerateRequest { page_id: page })
                .await?;
            println!("{}", serde_json::to_string_pretty(&row)?);
            Ok(())
        }
        Commands::Parse { file } => {
            let markdown =
                std::fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file))?;
            let parsed = parser::parse_markdown(&markdown);
            for h in &parsed.headings {
                println!("{:>3} {} {}", h.order_index, "#".repeat(h.level as usize), h.text);
            }
            if !parsed.links.is_empty() {
                println!("\n--- Links ---");
            }
            for l in &parsed.links {
                let scope = if l.is_external { "ext" } else { "int" };
                println!("{:>3} [{}] {} -> {}", l.order_index, scope, l.anchor_text, l.url);
            }
            println!(
                "\n{} headings, {} links",
                parsed.headings.len(),
                parsed.links.len()
            );
            Ok(())
        }
        Commands::Collection {
            command:
                CollectionCommands::Create {
                    owner,
                    name,
                    description,
                },
        } => {
            let db = Db::open(&settings.db_path)?;
            let row = db.with_conn(|conn| {
                db::insert_collection(conn, &owner, &name, description.as_deref())
            })?;
            println!("Created collection {} ({})", row.id, row.name);
            Ok(())
        }
        Commands::Stats => {
            let db = Db::open(&settings.db_path)?;
            let s = db.with_conn(db::get_stats)?;
            println!("Collections: {}", s.collections);
            println!("Pages:       {}", s.pages);
            println!("Headings:    {}", s.headings);
            println!("Links:       {} ({} external)", s.links, s.external_links);
            println!("Insights:    {}", s.insights);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_pipeline(settings: &Settings, db: Db, auth: Arc<dyn Authenticator>) -> Result<Pipeline> {
    let fetcher: Arc<dyn PageFetcher> = match settings.spider_api_key.as_deref() {
        Some(key) => Arc::new(SpiderFetcher::new(key)?),
        None => Arc::new(MissingFetcher),
    };
    let summarizer: Option<Arc<dyn Summarizer>> = match settings.openai_api_key.as_deref() {
        Some(key) => Some(Arc::new(OpenAiSummarizer::new(
            key,
            &settings.openai_base_url,
            &settings.openai_model,
            settings.openai_temperature,
            Duration::from_secs(settings.openai_timeout_secs.max(1)),
        )?)),
        None => None,
    };
    Ok(Pipeline::new(db, auth, fetcher, summarizer, settings.persist_mode))
}

/// Stands in when no scraping key is configured, so regeneration and the
/// API's other routes still work.
struct MissingFetcher;

#[async_trait::async_trait]
impl PageFetcher for MissingFetcher {
    async fn fetch(&self, _url: &str) -> Result<FetchedPage> {
        anyhow::bail!("SPIDER_API_KEY is not set")
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
