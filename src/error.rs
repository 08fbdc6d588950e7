use thiserror::Error;

/// Caller-facing failure of an ingestion or regeneration request.
///
/// Every variant carries the message shown to the caller. Upstream and store
/// details are logged where the error is raised and never end up here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    UpstreamFetch(String),
    #[error("{0}")]
    Persistence(String),
    #[error("{0}")]
    Enrichment(String),
    #[error("{0}")]
    Config(String),
}

pub const FETCH_FAILED: &str =
    "Something went wrong. Please check if the website link is valid or try again in some time.";
pub const SAVE_FAILED: &str = "Unable to save the scraped data. Please try again.";
pub const INSIGHTS_SAVE_FAILED: &str = "Unable to save the AI insights. Please try again.";
pub const ENRICHMENT_FAILED: &str = "Unable to generate AI insights right now. Please try again.";

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::UpstreamFetch(_) => "upstream_fetch",
            Self::Persistence(_) => "persistence",
            Self::Enrichment(_) => "enrichment",
            Self::Config(_) => "config",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
