use anyhow::Result;

use super::schema::Database;
use super::types::{FetchRun, FetchRunDbRow, NewFetchRun};

impl Database {
    // ========================================================================
    // Fetch-Run Log (append-only)
    // ========================================================================

    pub async fn insert_fetch_run(&self, run: &NewFetchRun) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO fetch_runs (
                feed_name, fetched_at_ms, status, articles_found, articles_processed,
                articles_inserted, error_message, execution_time_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&run.feed_name)
        .bind(run.fetched_at.timestamp_millis())
        .bind(run.status.as_str())
        .bind(run.articles_found)
        .bind(run.articles_processed)
        .bind(run.articles_inserted)
        .bind(&run.error_message)
        .bind(run.execution_time_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent runs for a feed, newest first
    pub async fn recent_runs(&self, feed_name: &str, limit: i64) -> Result<Vec<FetchRun>> {
        let rows: Vec<FetchRunDbRow> = sqlx::query_as(
            r#"
            SELECT id, feed_name, fetched_at_ms, status, articles_found, articles_processed,
                   articles_inserted, error_message, execution_time_ms
            FROM fetch_runs
            WHERE feed_name = ?
            ORDER BY fetched_at_ms DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(feed_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FetchRunDbRow::into_fetch_run).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FetchStatus;
    use chrono::{Duration, Utc};

    fn run(feed: &str, offset_ms: i64, status: FetchStatus) -> NewFetchRun {
        NewFetchRun {
            feed_name: feed.to_string(),
            fetched_at: Utc::now() + Duration::milliseconds(offset_ms),
            status,
            articles_found: 3,
            articles_processed: 2,
            articles_inserted: 1,
            error_message: None,
            execution_time_ms: 42,
        }
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first_per_feed() {
        let db = Database::open(":memory:").await.unwrap();
        db.insert_fetch_run(&run("A", 0, FetchStatus::Success)).await.unwrap();
        db.insert_fetch_run(&run("B", 5, FetchStatus::Error)).await.unwrap();
        db.insert_fetch_run(&run("A", 10, FetchStatus::Partial)).await.unwrap();

        let runs = db.recent_runs("A", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, FetchStatus::Partial);
        assert_eq!(runs[1].status, FetchStatus::Success);
        assert!(runs[0].fetched_at > runs[1].fetched_at);
        assert_eq!(runs[0].execution_time_ms, 42);
    }

    #[tokio::test]
    async fn test_recent_runs_respects_limit() {
        let db = Database::open(":memory:").await.unwrap();
        for i in 0..5 {
            db.insert_fetch_run(&run("A", i, FetchStatus::Success)).await.unwrap();
        }
        assert_eq!(db.recent_runs("A", 3).await.unwrap().len(), 3);
    }
}
