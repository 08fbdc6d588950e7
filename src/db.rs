use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::parser::{Heading, Link};

/// Shared handle to the SQLite store. The lock is never held across an `.await`.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        f(&conn)
    }
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS collections (
            id          TEXT PRIMARY KEY,
            owner_id    TEXT NOT NULL,
            name        TEXT NOT NULL,
            description TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_collections_owner ON collections(owner_id);

        CREATE TABLE IF NOT EXISTS pages (
            id               TEXT PRIMARY KEY,
            owner_id         TEXT NOT NULL,
            collection_id    TEXT NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
            url              TEXT NOT NULL CHECK(url <> ''),
            title            TEXT NOT NULL CHECK(title <> ''),
            meta_description TEXT,
            icon_url         TEXT,
            raw_content      TEXT NOT NULL DEFAULT 'null',
            tags             TEXT NOT NULL DEFAULT '[]',
            notes            TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pages_owner ON pages(owner_id);
        CREATE INDEX IF NOT EXISTS idx_pages_collection ON pages(collection_id);

        CREATE TABLE IF NOT EXISTS headings (
            id          INTEGER PRIMARY KEY,
            page_id     TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
            level       INTEGER NOT NULL CHECK(level BETWEEN 1 AND 6),
            text        TEXT NOT NULL,
            order_index INTEGER NOT NULL,
            UNIQUE(page_id, order_index)
        );

        CREATE TABLE IF NOT EXISTS links (
            id          INTEGER PRIMARY KEY,
            page_id     TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
            url         TEXT NOT NULL,
            anchor_text TEXT NOT NULL,
            is_external BOOLEAN NOT NULL DEFAULT 0,
            order_index INTEGER NOT NULL,
            UNIQUE(page_id, order_index)
        );

        -- At most one enrichment result per page
        CREATE TABLE IF NOT EXISTS insights (
            id            TEXT PRIMARY KEY,
            page_id       TEXT NOT NULL UNIQUE REFERENCES pages(id) ON DELETE CASCADE,
            summary_short TEXT NOT NULL CHECK(summary_short <> ''),
            summary_long  TEXT,
            tags          TEXT NOT NULL DEFAULT '[]',
            key_points    TEXT NOT NULL DEFAULT '[]',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn new_id() -> String {
    Uuid::now_v7().to_string()
}

fn json_list(row: &Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_value(row: &Row, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ── Collections ──

#[derive(Debug, Clone, Serialize)]
pub struct CollectionRow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn insert_collection(
    conn: &Connection,
    owner_id: &str,
    name: &str,
    description: Option<&str>,
) -> Result<CollectionRow> {
    let now = Utc::now();
    let row = CollectionRow {
        id: new_id(),
        owner_id: owner_id.to_string(),
        name: name.to_string(),
        description: description.map(str::to_string),
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO collections (id, owner_id, name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            row.id, row.owner_id, row.name, row.description, row.created_at, row.updated_at,
        ],
    )?;
    Ok(row)
}

pub fn fetch_collection_for_owner(
    conn: &Connection,
    collection_id: &str,
    owner_id: &str,
) -> Result<Option<CollectionRow>> {
    let row = conn
        .query_row(
            "SELECT id, owner_id, name, description, created_at, updated_at
             FROM collections WHERE id = ?1 AND owner_id = ?2",
            rusqlite::params![collection_id, owner_id],
            |row| {
                Ok(CollectionRow {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

// ── Pages ──

pub struct NewPage {
    pub owner_id: String,
    pub collection_id: String,
    pub url: String,
    pub title: String,
    pub meta_description: Option<String>,
    pub icon_url: Option<String>,
    pub raw_content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageRecord {
    pub id: String,
    pub owner_id: String,
    pub collection_id: String,
    pub url: String,
    pub title: String,
    pub meta_description: Option<String>,
    pub icon_url: Option<String>,
    pub raw_content: serde_json::Value,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const PAGE_COLUMNS: &str = "id, owner_id, collection_id, url, title, meta_description, icon_url,
     raw_content, tags, notes, created_at, updated_at";

fn page_from_row(row: &Row) -> rusqlite::Result<PageRecord> {
    Ok(PageRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        collection_id: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        meta_description: row.get(5)?,
        icon_url: row.get(6)?,
        raw_content: json_value(row, 7)?,
        tags: json_list(row, 8)?,
        notes: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Insert a page and return it with its generated id and timestamps.
pub fn insert_page(conn: &Connection, page: &NewPage) -> Result<PageRecord> {
    let now = Utc::now();
    let record = PageRecord {
        id: new_id(),
        owner_id: page.owner_id.clone(),
        collection_id: page.collection_id.clone(),
        url: page.url.clone(),
        title: page.title.clone(),
        meta_description: page.meta_description.clone(),
        icon_url: page.icon_url.clone(),
        raw_content: page.raw_content.clone(),
        tags: Vec::new(),
        notes: None,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO pages
         (id, owner_id, collection_id, url, title, meta_description, icon_url,
          raw_content, tags, notes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            record.id,
            record.owner_id,
            record.collection_id,
            record.url,
            record.title,
            record.meta_description,
            record.icon_url,
            serde_json::to_string(&record.raw_content)?,
            serde_json::to_string(&record.tags)?,
            record.notes,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(record)
}

pub fn fetch_page_for_owner(
    conn: &Connection,
    page_id: &str,
    owner_id: &str,
) -> Result<Option<PageRecord>> {
    let sql = format!(
        "SELECT {} FROM pages WHERE id = ?1 AND owner_id = ?2",
        PAGE_COLUMNS
    );
    let page = conn
        .query_row(&sql, rusqlite::params![page_id, owner_id], page_from_row)
        .optional()?;
    Ok(page)
}

/// Delete a page; headings, links and its enrichment result go with it.
pub fn delete_page(conn: &Connection, page_id: &str) -> Result<usize> {
    let n = conn.execute("DELETE FROM pages WHERE id = ?1", rusqlite::params![page_id])?;
    Ok(n)
}

// ── Headings / links ──

#[derive(Debug, Clone, Serialize)]
pub struct HeadingRow {
    pub id: i64,
    pub page_id: String,
    pub level: u8,
    pub text: String,
    pub order_index: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkRow {
    pub id: i64,
    pub page_id: String,
    pub url: String,
    pub anchor_text: String,
    pub is_external: bool,
    pub order_index: u32,
}

/// Callers own the surrounding transaction.
pub fn insert_headings(conn: &Connection, page_id: &str, headings: &[Heading]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO headings (page_id, level, text, order_index) VALUES (?1, ?2, ?3, ?4)",
    )?;
    let mut count = 0;
    for h in headings {
        count += stmt.execute(rusqlite::params![page_id, h.level, h.text, h.order_index])?;
    }
    Ok(count)
}

/// Callers own the surrounding transaction.
pub fn insert_links(conn: &Connection, page_id: &str, links: &[Link]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO links (page_id, url, anchor_text, is_external, order_index)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut count = 0;
    for l in links {
        count += stmt.execute(rusqlite::params![
            page_id, l.url, l.anchor_text, l.is_external, l.order_index,
        ])?;
    }
    Ok(count)
}

pub fn fetch_headings(conn: &Connection, page_id: &str, limit: usize) -> Result<Vec<HeadingRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, page_id, level, text, order_index FROM headings
         WHERE page_id = ?1 ORDER BY order_index LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![page_id, limit as i64], |row| {
            Ok(HeadingRow {
                id: row.get(0)?,
                page_id: row.get(1)?,
                level: row.get(2)?,
                text: row.get(3)?,
                order_index: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_links(conn: &Connection, page_id: &str, limit: usize) -> Result<Vec<LinkRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, page_id, url, anchor_text, is_external, order_index FROM links
         WHERE page_id = ?1 ORDER BY order_index LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![page_id, limit as i64], |row| {
            Ok(LinkRow {
                id: row.get(0)?,
                page_id: row.get(1)?,
                url: row.get(2)?,
                anchor_text: row.get(3)?,
                is_external: row.get(4)?,
                order_index: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Insights ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInsight {
    pub summary_short: String,
    pub summary_long: Option<String>,
    pub tags: Vec<String>,
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsightRow {
    pub id: String,
    pub page_id: String,
    pub summary_short: String,
    pub summary_long: Option<String>,
    pub tags: Vec<String>,
    pub key_points: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn insight_from_row(row: &Row) -> rusqlite::Result<InsightRow> {
    Ok(InsightRow {
        id: row.get(0)?,
        page_id: row.get(1)?,
        summary_short: row.get(2)?,
        summary_long: row.get(3)?,
        tags: json_list(row, 4)?,
        key_points: json_list(row, 5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub fn fetch_insight(conn: &Connection, page_id: &str) -> Result<Option<InsightRow>> {
    let row = conn
        .query_row(
            "SELECT id, page_id, summary_short, summary_long, tags, key_points, created_at, updated_at
             FROM insights WHERE page_id = ?1",
            rusqlite::params![page_id],
            insight_from_row,
        )
        .optional()?;
    Ok(row)
}

/// Insert-or-replace keyed on `page_id`. An existing row keeps its id and
/// `created_at`; every other field is overwritten.
pub fn upsert_insight(conn: &Connection, page_id: &str, insight: &NewInsight) -> Result<InsightRow> {
    let now = Utc::now();
    let row = conn.query_row(
        "INSERT INTO insights
         (id, page_id, summary_short, summary_long, tags, key_points, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(page_id) DO UPDATE SET
             summary_short = excluded.summary_short,
             summary_long  = excluded.summary_long,
             tags          = excluded.tags,
             key_points    = excluded.key_points,
             updated_at    = excluded.updated_at
         RETURNING id, page_id, summary_short, summary_long, tags, key_points, created_at, updated_at",
        rusqlite::params![
            new_id(),
            page_id,
            insight.summary_short,
            insight.summary_long,
            serde_json::to_string(&insight.tags)?,
            serde_json::to_string(&insight.key_points)?,
            now,
        ],
        insight_from_row,
    )?;
    Ok(row)
}

pub fn count_insights(conn: &Connection, page_id: &str) -> Result<usize> {
    let n: usize = conn.query_row(
        "SELECT COUNT(*) FROM insights WHERE page_id = ?1",
        rusqlite::params![page_id],
        |r| r.get(0),
    )?;
    Ok(n)
}

// ── Stats ──

pub struct Stats {
    pub collections: usize,
    pub pages: usize,
    pub headings: usize,
    pub links: usize,
    pub external_links: usize,
    pub insights: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    Ok(Stats {
        collections: count("SELECT COUNT(*) FROM collections")?,
        pages: count("SELECT COUNT(*) FROM pages")?,
        headings: count("SELECT COUNT(*) FROM headings")?,
        links: count("SELECT COUNT(*) FROM links")?,
        external_links: count("SELECT COUNT(*) FROM links WHERE is_external = 1")?,
        insights: count("SELECT COUNT(*) FROM insights")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parser::parse_markdown;

    pub(crate) fn seed_page(conn: &Connection, owner: &str) -> PageRecord {
        let collection = insert_collection(conn, owner, "Research", None).unwrap();
        insert_page(
            conn,
            &NewPage {
                owner_id: owner.into(),
                collection_id: collection.id,
                url: "https://example.com".into(),
                title: "Example".into(),
                meta_description: None,
                icon_url: None,
                raw_content: serde_json::json!({ "markdown": "# Example" }),
            },
        )
        .unwrap()
    }

    fn insight(summary: &str) -> NewInsight {
        NewInsight {
            summary_short: summary.into(),
            summary_long: None,
            tags: vec!["ai".into()],
            key_points: vec![],
        }
    }

    #[test]
    fn page_round_trips_through_owner_lookup() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let page = seed_page(conn, "user-1");
            let found = fetch_page_for_owner(conn, &page.id, "user-1")?.unwrap();
            assert_eq!(found.title, "Example");
            assert_eq!(found.raw_content["markdown"], "# Example");
            assert!(found.tags.is_empty());
            assert!(fetch_page_for_owner(conn, &page.id, "user-2")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn children_come_back_in_order() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let page = seed_page(conn, "u");
            let parsed = parse_markdown("# A\n[x](/x)\n## B\n[y](https://y)");
            insert_headings(conn, &page.id, &parsed.headings)?;
            insert_links(conn, &page.id, &parsed.links)?;
            let headings = fetch_headings(conn, &page.id, 20)?;
            assert_eq!(headings.iter().map(|h| h.text.as_str()).collect::<Vec<_>>(), ["A", "B"]);
            let links = fetch_links(conn, &page.id, 1)?;
            assert_eq!(links.len(), 1);
            assert_eq!(links[0].url, "/x");
            assert!(!links[0].is_external);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn upsert_replaces_in_place() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let page = seed_page(conn, "u");
            let first = upsert_insight(conn, &page.id, &insight("first"))?;
            let second = upsert_insight(conn, &page.id, &insight("second"))?;
            assert_eq!(first.id, second.id);
            assert_eq!(second.summary_short, "second");
            assert_eq!(second.created_at, first.created_at);
            assert_eq!(count_insights(conn, &page.id)?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_cascades_to_children() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let page = seed_page(conn, "u");
            let parsed = parse_markdown("# A\n[x](/x)");
            insert_headings(conn, &page.id, &parsed.headings)?;
            insert_links(conn, &page.id, &parsed.links)?;
            upsert_insight(conn, &page.id, &insight("s"))?;

            assert_eq!(delete_page(conn, &page.id)?, 1);
            let stats = get_stats(conn)?;
            assert_eq!((stats.pages, stats.headings, stats.links, stats.insights), (0, 0, 0, 0));
            assert_eq!(stats.collections, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn empty_summary_is_rejected_by_schema() {
        let db = Db::open_in_memory().unwrap();
        let result = db.with_conn(|conn| {
            let page = seed_page(conn, "u");
            upsert_insight(conn, &page.id, &insight(""))
        });
        assert!(result.is_err());
    }
}
