use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::assemble::{self, ChildWrites, PersistMode};
use crate::auth::{Authenticator, Identity};
use crate::db::{self, Db, InsightRow, PageRecord};
use crate::enrich::{self, PromptSource, Summarizer, MAX_PROMPT_HEADINGS, MAX_PROMPT_LINKS};
use crate::error::{
    PipelineError, PipelineResult, ENRICHMENT_FAILED, FETCH_FAILED, INSIGHTS_SAVE_FAILED, SAVE_FAILED,
};
use crate::parser;
use crate::scraper::{self, PageFetcher};
use crate::upsert::{self, UpsertAction};

/// Stages of one ingestion. A failure at any stage ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Authenticating,
    FetchingSource,
    Parsing,
    PersistingPage,
    PersistingChildren,
    Enriching,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "projectId", alias = "targetCollectionId")]
    pub collection_id: String,
    #[serde(default, rename = "useAi", alias = "enrich")]
    pub enrich: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegenerateRequest {
    #[serde(default, rename = "scrapeId", alias = "pageId")]
    pub page_id: String,
}

#[derive(Debug, Clone)]
pub enum EnrichmentOutcome {
    NotRequested,
    /// Requested, but no summarizer is configured.
    Unavailable,
    Stored(InsightRow, UpsertAction),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub page: PageRecord,
    pub children: ChildWrites,
    pub enrichment: EnrichmentOutcome,
}

struct Run {
    stage: Stage,
}

impl Run {
    fn start() -> Self {
        Self {
            stage: Stage::Authenticating,
        }
    }

    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        debug!(?stage, "ingestion stage");
    }

    fn fail(&self, err: PipelineError) -> PipelineError {
        warn!(from = ?self.stage, stage = ?Stage::Failed, kind = err.kind(), error = %err, "ingestion failed");
        err
    }
}

pub struct Pipeline {
    db: Db,
    auth: Arc<dyn Authenticator>,
    fetcher: Arc<dyn PageFetcher>,
    summarizer: Option<Arc<dyn Summarizer>>,
    persist_mode: PersistMode,
}

impl Pipeline {
    pub fn new(
        db: Db,
        auth: Arc<dyn Authenticator>,
        fetcher: Arc<dyn PageFetcher>,
        summarizer: Option<Arc<dyn Summarizer>>,
        persist_mode: PersistMode,
    ) -> Self {
        Self {
            db,
            auth,
            fetcher,
            summarizer,
            persist_mode,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Resolve a bearer token to the calling user.
    pub async fn authenticate(&self, token: Option<&str>) -> PipelineResult<Identity> {
        let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
            return Err(PipelineError::Auth(
                "Authentication required. Please log in again.".into(),
            ));
        };
        match self.auth.verify(token).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(PipelineError::Auth(
                "Your session has expired. Please log in again.".into(),
            )),
            Err(e) => {
                error!(error = %e, "Auth service check failed");
                Err(PipelineError::Auth(
                    "Your session has expired. Please log in again.".into(),
                ))
            }
        }
    }

    pub async fn ingest(&self, token: Option<&str>, request: &IngestRequest) -> PipelineResult<IngestOutcome> {
        let identity = self.authenticate(token).await.map_err(|e| Run::start().fail(e))?;
        self.ingest_as(&identity, request).await
    }

    /// Ingestion for an already authenticated caller.
    pub async fn ingest_as(&self, identity: &Identity, request: &IngestRequest) -> PipelineResult<IngestOutcome> {
        let mut run = Run::start();
        let owner = identity.user_id.as_str();

        if request.url.trim().is_empty() || request.collection_id.trim().is_empty() {
            return Err(run.fail(PipelineError::Validation(
                "Please provide both a website URL and select a project.".into(),
            )));
        }
        let url = scraper::normalize_url(&request.url).map_err(|e| {
            debug!(error = %e, "rejected URL");
            run.fail(PipelineError::Validation("Please enter a valid website URL.".into()))
        })?;
        let collection_id = request.collection_id.trim();
        let collection = self
            .db
            .with_conn(|conn| db::fetch_collection_for_owner(conn, collection_id, owner))
            .map_err(|e| {
                error!(error = %e, "Collection lookup failed");
                run.fail(PipelineError::Persistence(SAVE_FAILED.into()))
            })?;
        if collection.is_none() {
            return Err(run.fail(PipelineError::NotFound(
                "Project not found or access denied".into(),
            )));
        }

        // ── Fetch ──
        run.advance(Stage::FetchingSource);
        info!(%url, "Scraping URL");
        let fetched = self.fetcher.fetch(&url).await.map_err(|e| {
            error!(%url, error = %e, "Scrape failed");
            run.fail(PipelineError::UpstreamFetch(FETCH_FAILED.into()))
        })?;

        // ── Parse ──
        run.advance(Stage::Parsing);
        let parsed = parser::parse_markdown(fetched.markdown.as_deref().unwrap_or(""));
        info!(
            headings = parsed.headings.len(),
            links = parsed.links.len(),
            "Extracted page structure"
        );

        // ── Persist ──
        run.advance(Stage::PersistingPage);
        let new_page = assemble::build_page(owner, collection_id, &url, &fetched);
        let persisted = assemble::persist(&self.db, &new_page, &parsed, self.persist_mode, |page| {
            debug!(page_id = %page.id, "page row stored");
            run.advance(Stage::PersistingChildren);
        });
        let assembled = persisted.map_err(|e| {
            error!(error = %e, "Page insert failed");
            run.fail(PipelineError::Persistence(SAVE_FAILED.into()))
        })?;
        debug!(page_id = %assembled.page.id, children = ?assembled.children, "children written");

        // ── Enrich (optional, never fatal) ──
        let enrichment = if !request.enrich {
            EnrichmentOutcome::NotRequested
        } else if let Some(summarizer) = &self.summarizer {
            run.advance(Stage::Enriching);
            let page = &assembled.page;
            let source = PromptSource::from_parsed(&page.title, page.meta_description.as_deref(), &parsed);
            match enrich::enrich(summarizer.as_ref(), &source).await {
                Ok(insight) => match upsert::store_insight(&self.db, &page.id, &insight) {
                    Ok((row, action)) => EnrichmentOutcome::Stored(row, action),
                    Err(e) => {
                        warn!(page_id = %page.id, error = %e, "Storing AI insights failed");
                        EnrichmentOutcome::Failed(e.to_string())
                    }
                },
                Err(e) => {
                    warn!(page_id = %page.id, error = %e, "AI generation error");
                    EnrichmentOutcome::Failed(e.to_string())
                }
            }
        } else {
            info!("No summarizer configured, skipping AI insights");
            EnrichmentOutcome::Unavailable
        };

        run.advance(Stage::Done);
        Ok(IngestOutcome {
            page: assembled.page,
            children: assembled.children,
            enrichment,
        })
    }

    pub async fn regenerate(&self, token: Option<&str>, request: &RegenerateRequest) -> PipelineResult<InsightRow> {
        let identity = self.authenticate(token).await?;
        self.regenerate_as(&identity, request).await
    }

    /// Re-run enrichment for a stored page owned by the caller.
    pub async fn regenerate_as(&self, identity: &Identity, request: &RegenerateRequest) -> PipelineResult<InsightRow> {
        let page_id = request.page_id.trim();
        if page_id.is_empty() {
            return Err(PipelineError::Validation("Missing required field: scrapeId".into()));
        }

        let loaded = self
            .db
            .with_conn(|conn| {
                let Some(page) = db::fetch_page_for_owner(conn, page_id, &identity.user_id)? else {
                    return Ok(None);
                };
                let headings = db::fetch_headings(conn, page_id, MAX_PROMPT_HEADINGS)?;
                let links = db::fetch_links(conn, page_id, MAX_PROMPT_LINKS)?;
                Ok(Some((page, headings, links)))
            })
            .map_err(|e| {
                error!(page_id, error = %e, "Page lookup failed");
                PipelineError::Persistence("Unable to load the scrape. Please try again.".into())
            })?;
        let Some((page, headings, links)) = loaded else {
            return Err(PipelineError::NotFound("Scrape not found or access denied".into()));
        };

        let Some(summarizer) = &self.summarizer else {
            return Err(PipelineError::Config(
                "AI insights are not configured. Please contact support.".into(),
            ));
        };

        let source = PromptSource::from_rows(&page.title, page.meta_description.as_deref(), &headings, &links);
        let insight = enrich::enrich(summarizer.as_ref(), &source).await.map_err(|e| {
            error!(page_id, error = %e, "AI generation error");
            PipelineError::Enrichment(ENRICHMENT_FAILED.into())
        })?;

        let (row, _) = upsert::store_insight(&self.db, page_id, &insight).map_err(|e| {
            error!(page_id, error = %e, "Storing AI insights failed");
            PipelineError::Persistence(INSIGHTS_SAVE_FAILED.into())
        })?;
        Ok(row)
    }
}
