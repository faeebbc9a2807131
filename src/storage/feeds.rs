use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Feed, FeedDbRow, FeedSpec};

const FEED_COLUMNS: &str = "id, name, url, category, is_active, created_at, updated_at";

impl Database {
    // ========================================================================
    // Feed Registry
    // ========================================================================

    /// Register configured feeds that are not yet known by name.
    ///
    /// Existing feeds keep their url, category and active flag, so a config
    /// edit never changes the identity of a feed that is already running.
    /// Returns the number of newly inserted feeds.
    pub async fn sync_feeds(&self, feeds: &[FeedSpec]) -> Result<u64> {
        if feeds.is_empty() {
            return Ok(0);
        }

        const BATCH_SIZE: usize = 100;
        let now = chrono::Utc::now().timestamp();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        for chunk in feeds.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO feeds (name, url, category, is_active, created_at) ");

            builder.push_values(chunk, |mut b, feed| {
                b.push_bind(&feed.name)
                    .push_bind(&feed.url)
                    .push_bind(feed.category.as_str())
                    .push_bind(true)
                    .push_bind(now);
            });

            builder.push(" ON CONFLICT(name) DO NOTHING");

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn find_feed_by_name(&self, name: &str) -> Result<Option<Feed>> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE name = ?"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedDbRow::into_feed).transpose()?)
    }

    /// Active feeds ordered by name
    pub async fn find_active_feeds(&self) -> Result<Vec<Feed>> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE is_active = 1 ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(FeedDbRow::into_feed)
            .collect::<Result<_, _>>()?)
    }

    /// All feeds, active or not, ordered by name
    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        let rows: Vec<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY name"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(FeedDbRow::into_feed)
            .collect::<Result<_, _>>()?)
    }

    /// Toggle the active flag. Returns false when no feed has that name.
    pub async fn set_feed_active(&self, name: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET is_active = ?, updated_at = ? WHERE name = ?")
            .bind(active)
            .bind(chrono::Utc::now().timestamp())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
