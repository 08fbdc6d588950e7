use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{self, Db, NewPage, PageRecord};
use crate::parser::{Heading, Link, ParsedPage};
use crate::scraper::FetchedPage;

pub const MAX_LINKS: usize = 100;
pub const UNTITLED: &str = "Untitled";

/// How the page and its child rows are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    /// Page write is fatal; heading and link batches are best-effort.
    #[default]
    BestEffort,
    /// Page, headings and links commit together or not at all.
    Atomic,
}

/// Whether a failed write aborts the ingestion or is only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    Fatal,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// Nothing to write, no statement issued.
    Skipped,
    Written(usize),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChildWrites {
    pub headings: WriteStatus,
    pub links: WriteStatus,
}

#[derive(Debug, Clone)]
pub struct Assembled {
    pub page: PageRecord,
    pub children: ChildWrites,
}

/// Combine fetched metadata into the page row to insert.
pub fn build_page(owner_id: &str, collection_id: &str, url: &str, fetched: &FetchedPage) -> NewPage {
    let clean = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    NewPage {
        owner_id: owner_id.to_string(),
        collection_id: collection_id.to_string(),
        url: url.to_string(),
        title: clean(&fetched.title).unwrap_or_else(|| UNTITLED.to_string()),
        meta_description: clean(&fetched.description),
        icon_url: clean(&fetched.icon_url),
        raw_content: fetched.raw.clone(),
    }
}

/// First `MAX_LINKS` links in extraction order.
pub fn capped_links(links: &[Link]) -> &[Link] {
    &links[..links.len().min(MAX_LINKS)]
}

/// Persist the page, then its headings and links.
///
/// `on_page_stored` runs once the page row has its id and before any child
/// batch is written. It runs under the connection lock and must not touch `db`.
///
/// An `Err` always means the page itself was not stored. Child failures under
/// `PersistMode::BestEffort` are reported through `ChildWrites` instead.
pub fn persist(
    db: &Db,
    page: &NewPage,
    parsed: &ParsedPage,
    mode: PersistMode,
    on_page_stored: impl FnOnce(&PageRecord),
) -> Result<Assembled> {
    let links = capped_links(&parsed.links);
    if links.len() < parsed.links.len() {
        info!(
            extracted = parsed.links.len(),
            kept = links.len(),
            "Dropping links beyond the per-page cap"
        );
    }

    db.with_conn(|conn| match mode {
        PersistMode::Atomic => {
            let tx = conn.unchecked_transaction()?;
            let record = db::insert_page(&tx, page)?;
            on_page_stored(&record);
            let children = write_children(&tx, &record.id, &parsed.headings, links, WritePolicy::Fatal)?;
            tx.commit()?;
            Ok(Assembled { page: record, children })
        }
        PersistMode::BestEffort => {
            let record = db::insert_page(conn, page)?;
            on_page_stored(&record);
            let children =
                write_children(conn, &record.id, &parsed.headings, links, WritePolicy::BestEffort)?;
            Ok(Assembled { page: record, children })
        }
    })
}

fn write_children(
    conn: &Connection,
    page_id: &str,
    headings: &[Heading],
    links: &[Link],
    policy: WritePolicy,
) -> Result<ChildWrites> {
    let headings = write_batch(conn, page_id, "headings", headings, policy, db::insert_headings)?;
    let links = write_batch(conn, page_id, "links", links, policy, db::insert_links)?;
    Ok(ChildWrites { headings, links })
}

fn write_batch<T>(
    conn: &Connection,
    page_id: &str,
    what: &str,
    items: &[T],
    policy: WritePolicy,
    insert: fn(&Connection, &str, &[T]) -> Result<usize>,
) -> Result<WriteStatus> {
    if items.is_empty() {
        return Ok(WriteStatus::Skipped);
    }

    match policy {
        // Runs inside the caller's transaction
        WritePolicy::Fatal => Ok(WriteStatus::Written(insert(conn, page_id, items)?)),
        WritePolicy::BestEffort => {
            let result = (|| -> Result<usize> {
                let tx = conn.unchecked_transaction()?;
                let n = insert(&tx, page_id, items)?;
                tx.commit()?;
                Ok(n)
            })();
            match result {
                Ok(n) => Ok(WriteStatus::Written(n)),
                Err(e) => {
                    warn!(page_id, what, error = %e, "Child insert failed, keeping page");
                    Ok(WriteStatus::Failed)
                }
            }
        }
    }
}
