use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::db::{self, Db, InsightRow, NewInsight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Replaced,
}

/// Attach `insight` to `page_id`, replacing the page's existing result in place.
///
/// Lookup and write run in one transaction over a `UNIQUE(page_id)` upsert, so
/// concurrent regenerations of the same page converge on a single row.
pub fn store_insight(db: &Db, page_id: &str, insight: &NewInsight) -> Result<(InsightRow, UpsertAction)> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let existing = db::fetch_insight(&tx, page_id)?;
        let row = db::upsert_insight(&tx, page_id, insight)?;
        tx.commit()?;

        let action = match existing {
            Some(prev) => {
                debug_assert_eq!(prev.id, row.id);
                UpsertAction::Replaced
            }
            None => UpsertAction::Created,
        };
        info!(page_id, insight_id = %row.id, ?action, "Stored AI insights");
        Ok((row, action))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::seed_page;

    fn insight(summary: &str, tags: &[&str]) -> NewInsight {
        NewInsight {
            summary_short: summary.into(),
            summary_long: Some(format!("{summary} in more words")),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            key_points: vec!["point".into()],
        }
    }

    #[test]
    fn first_store_creates_then_replaces() {
        let db = Db::open_in_memory().unwrap();
        let page = db.with_conn(|conn| Ok(seed_page(conn, "u"))).unwrap();

        let (first, action) = store_insight(&db, &page.id, &insight("one", &["a"])).unwrap();
        assert_eq!(action, UpsertAction::Created);

        let (second, action) = store_insight(&db, &page.id, &insight("two", &[])).unwrap();
        assert_eq!(action, UpsertAction::Replaced);
        assert_eq!(second.id, first.id);
        assert_eq!(second.page_id, page.id);
        assert_eq!(second.summary_short, "two");
        assert!(second.tags.is_empty());

        let count = db.with_conn(|conn| db::count_insights(conn, &page.id)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn concurrent_regenerations_leave_one_row() {
        let db = Db::open_in_memory().unwrap();
        let page = db.with_conn(|conn| Ok(seed_page(conn, "u"))).unwrap();

        std::thread::scope(|s| {
            for i in 0..8 {
                let db = db.clone();
                let page_id = page.id.clone();
                s.spawn(move || {
                    store_insight(&db, &page_id, &insight(&format!("run {i}"), &["t"])).unwrap();
                });
            }
        });

        let count = db.with_conn(|conn| db::count_insights(conn, &page.id)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn unknown_page_is_rejected() {
        let db = Db::open_in_memory().unwrap();
        assert!(store_insight(&db, "missing", &insight("x", &[])).is_err());
    }
}
