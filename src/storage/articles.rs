use super::schema::Database;
use super::types::{Article, ArticleDbRow, NormalizedArticle};

const ARTICLE_COLUMNS: &str = "id, title, summary, content, link, author, published, category, \
     source_name, source_url, image_url, slug, is_processed, created_at, updated_at";

/// Result of a single guarded insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleInsert {
    Inserted(i64),
    /// Another row already owns this link
    LinkTaken,
    /// Another row already owns this slug
    SlugTaken,
}

impl Database {
    // ========================================================================
    // Article Operations
    // ========================================================================
    //
    // These return `sqlx::Error` rather than `anyhow::Error` so the upserter
    // can tell lock contention apart from real failures.

    pub async fn find_article_by_link(&self, link: &str) -> Result<Option<Article>, sqlx::Error> {
        let row: Option<ArticleDbRow> =
            sqlx::query_as(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE link = ?"))
                .bind(link)
                .fetch_optional(&self.pool)
                .await?;
        row.map(decode_article).transpose()
    }

    pub async fn find_article_by_slug(&self, slug: &str) -> Result<Option<Article>, sqlx::Error> {
        let row: Option<ArticleDbRow> =
            sqlx::query_as(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE slug = ?"))
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?;
        row.map(decode_article).transpose()
    }

    /// Insert an article under the given slug.
    ///
    /// Unique-index violations are reported as [`ArticleInsert::LinkTaken`] or
    /// [`ArticleInsert::SlugTaken`] instead of errors: both are expected when
    /// concurrent runs race on the same link or title.
    pub async fn insert_article(
        &self,
        article: &NormalizedArticle,
        slug: &str,
    ) -> Result<ArticleInsert, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO articles (
                title, summary, content, link, author, published, category,
                source_name, source_url, image_url, slug, is_processed, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
        )
        .bind(&article.title)
        .bind(&article.summary)
        .bind(&article.content)
        .bind(&article.link)
        .bind(&article.author)
        .bind(article.published.map(|p| p.timestamp()))
        .bind(article.category.as_str())
        .bind(&article.source_name)
        .bind(&article.source_url)
        .bind(&article.image_url)
        .bind(slug)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(ArticleInsert::Inserted(done.last_insert_rowid())),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // SQLite names the violated column: "UNIQUE constraint failed: articles.slug"
                if db_err.message().contains("articles.slug") {
                    Ok(ArticleInsert::SlugTaken)
                } else {
                    Ok(ArticleInsert::LinkTaken)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh the mutable fields of an existing article.
    ///
    /// Link, slug and published date are never touched. Returns false when no
    /// article has that link.
    pub async fn refresh_article(
        &self,
        link: &str,
        content: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET content = COALESCE(?, content),
                image_url = COALESCE(?, image_url),
                updated_at = ?
            WHERE link = ?
        "#,
        )
        .bind(content)
        .bind(image_url)
        .bind(chrono::Utc::now().timestamp())
        .bind(link)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Articles from one source in insertion order
    pub async fn articles_for_source(&self, source_name: &str) -> Result<Vec<Article>, sqlx::Error> {
        let rows: Vec<ArticleDbRow> = sqlx::query_as(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE source_name = ? ORDER BY id"
        ))
        .bind(source_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_article).collect()
    }

    pub async fn count_articles(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn decode_article(row: ArticleDbRow) -> Result<Article, sqlx::Error> {
    row.into_article()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
