use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use thiserror::Error;

use super::IngestSettings;
use crate::config::DuplicatePolicy;
use crate::storage::{is_lock_error, ArticleInsert, Database, NormalizedArticle};
use crate::util::slug_with_suffix;

/// How an article was reconciled with storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    /// New row under the base slug
    Inserted,
    /// Link already stored; nothing written
    SkippedDuplicate,
    /// Link already stored; mutable fields refreshed
    Refreshed,
    /// New row under a disambiguated slug
    SlugCollisionResolved,
}

impl UpsertOutcome {
    /// True when a new row was written
    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::SlugCollisionResolved)
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    /// Every slug candidate was owned by another article
    #[error("No free slug for {link} after {attempts} attempts")]
    SlugExhausted { link: String, attempts: u32 },

    /// The database stayed busy (or writes kept timing out) through every retry
    #[error("Storage unavailable after {retries} retries: {reason}")]
    StorageUnavailable { retries: u32, reason: String },

    /// Any other storage failure; not retried
    #[error("Storage error: {0}")]
    Storage(#[source] sqlx::Error),
}

/// Reconcile one normalized article with storage, keyed by link.
///
/// An already-stored link is never inserted again: with
/// [`DuplicatePolicy::Skip`] nothing is written, with
/// [`DuplicatePolicy::Refresh`] only content and image URL are updated.
///
/// A new link is inserted under the first free candidate from
/// [`slug_candidate`]. Candidates depend only on the title and the link, so
/// the slug an article ends up with is the same whichever run inserts it.
/// Losing an insert race on the link resolves to `SkippedDuplicate`; losing
/// one on the slug moves to the next candidate.
pub async fn upsert(
    db: &Database,
    article: &NormalizedArticle,
    settings: &IngestSettings,
) -> Result<UpsertOutcome, UpsertError> {
    let existing = with_storage_retry(settings, "find_article_by_link", || {
        db.find_article_by_link(&article.link)
    })
    .await?;

    if existing.is_some() {
        return match settings.on_duplicate {
            DuplicatePolicy::Skip => Ok(UpsertOutcome::SkippedDuplicate),
            DuplicatePolicy::Refresh => {
                with_storage_retry(settings, "refresh_article", || {
                    db.refresh_article(
                        &article.link,
                        article.content.as_deref(),
                        article.image_url.as_deref(),
                    )
                })
                .await?;
                Ok(UpsertOutcome::Refreshed)
            }
        };
    }

    let hash = link_hash(&article.link);
    for attempt in 0..=settings.max_slug_retries {
        let candidate = slug_candidate(&article.slug, &hash, attempt);

        let taken = with_storage_retry(settings, "find_article_by_slug", || {
            db.find_article_by_slug(&candidate)
        })
        .await?;
        if taken.is_some() {
            tracing::debug!(link = %article.link, slug = %candidate, "Slug taken, trying next candidate");
            continue;
        }

        let (inserted, timed_out) = storage_retry_tracking_timeouts(settings, "insert_article", || {
            db.insert_article(article, &candidate)
        })
        .await?;

        match resolve_insert(db, settings, article, &candidate, inserted, timed_out).await? {
            InsertResolution::New if attempt == 0 => return Ok(UpsertOutcome::Inserted),
            InsertResolution::New => {
                tracing::debug!(link = %article.link, slug = %candidate, attempt, "Resolved slug collision");
                return Ok(UpsertOutcome::SlugCollisionResolved);
            }
            InsertResolution::Duplicate => return Ok(UpsertOutcome::SkippedDuplicate),
            InsertResolution::SlugTaken => continue,
        }
    }

    Err(UpsertError::SlugExhausted {
        link: article.link.clone(),
        attempts: settings.max_slug_retries + 1,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertResolution {
    New,
    Duplicate,
    SlugTaken,
}

/// Classify one insert attempt.
///
/// A timed-out insert may still have committed, in which case the retry
/// conflicts with our own row. When a timeout happened, a conflict whose
/// stored row has this link and this slug counts as new.
async fn resolve_insert(
    db: &Database,
    settings: &IngestSettings,
    article: &NormalizedArticle,
    candidate: &str,
    inserted: ArticleInsert,
    timed_out: bool,
) -> Result<InsertResolution, UpsertError> {
    let conflict = match inserted {
        ArticleInsert::Inserted(_) => return Ok(InsertResolution::New),
        ArticleInsert::LinkTaken => InsertResolution::Duplicate,
        ArticleInsert::SlugTaken => InsertResolution::SlugTaken,
    };
    if !timed_out {
        return Ok(conflict);
    }

    let stored = with_storage_retry(settings, "find_article_by_link", || {
        db.find_article_by_link(&article.link)
    })
    .await?;
    if stored.is_some_and(|a| a.slug == candidate) {
        tracing::debug!(link = %article.link, slug = %candidate, "Timed-out insert had committed");
        return Ok(InsertResolution::New);
    }
    Ok(conflict)
}

/// Slug to try on a given attempt.
///
/// - attempt 0: the base slug
/// - attempt 1: base + `-` + the link hash
/// - attempt n: base + `-` + the link hash + `-n`
///
/// The base is shortened as needed to keep the whole within the slug width.
pub fn slug_candidate(base: &str, link_hash: &str, attempt: u32) -> String {
    match attempt {
        0 => base.to_string(),
        1 => slug_with_suffix(base, link_hash),
        n => slug_with_suffix(base, &format!("{link_hash}-{n}")),
    }
}

/// First 8 hex chars of SHA-256(link)
fn link_hash(link: &str) -> String {
    let digest = Sha256::digest(link.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..8].to_string()
}

/// Run one storage call under the write timeout, retrying busy/locked
/// failures and timeouts with exponential backoff.
async fn with_storage_retry<T, F, Fut>(
    settings: &IngestSettings,
    op: &'static str,
    call: F,
) -> Result<T, UpsertError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let (value, _) = storage_retry_tracking_timeouts(settings, op, call).await?;
    Ok(value)
}

/// [`with_storage_retry`], also reporting whether any attempt hit the write
/// timeout before the call finally returned.
async fn storage_retry_tracking_timeouts<T, F, Fut>(
    settings: &IngestSettings,
    op: &'static str,
    mut call: F,
) -> Result<(T, bool), UpsertError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut retries = 0;
    let mut timed_out = false;
    loop {
        let reason = match tokio::time::timeout(settings.write_timeout, call()).await {
            Ok(Ok(value)) => return Ok((value, timed_out)),
            Ok(Err(e)) if is_lock_error(&e) => e.to_string(),
            Ok(Err(e)) => return Err(UpsertError::Storage(e)),
            Err(_) => {
                timed_out = true;
                format!("{op} timed out after {:?}", settings.write_timeout)
            }
        };

        if retries >= settings.storage_retries {
            return Err(UpsertError::StorageUnavailable { retries, reason });
        }

        let delay = settings.storage_backoff.saturating_mul(2u32.saturating_pow(retries));
        tracing::warn!(
            op,
            retry = retries,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Storage unavailable, backing off"
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Category;
    use crate::util::{slugify, MAX_SLUG_LEN};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn article(link: &str, title: &str) -> NormalizedArticle {
        NormalizedArticle {
            title: title.to_string(),
            summary: None,
            content: Some("v1".to_string()),
            link: link.to_string(),
            author: None,
            published: None,
            image_url: None,
            category: Category::Us,
            source_name: "Wire".to_string(),
            source_url: "https://wire.example/rss".to_string(),
            slug: slugify(title),
        }
    }

    #[tokio::test]
    async fn test_insert_new_article() {
        let db = test_db().await;
        let outcome = upsert(&db, &article("https://w.example/1", "Hello"), &IngestSettings::default())
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert!(outcome.is_new());
    }

    #[tokio::test]
    async fn test_same_link_twice_is_skipped() {
        let db = test_db().await;
        let settings = IngestSettings::default();
        let a = article("https://w.example/1", "Hello");

        upsert(&db, &a, &settings).await.unwrap();
        let second = upsert(&db, &a, &settings).await.unwrap();

        assert_eq!(second, UpsertOutcome::SkippedDuplicate);
        assert_eq!(db.count_articles().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_skip_policy_never_mutates() {
        let db = test_db().await;
        let settings = IngestSettings::default();
        upsert(&db, &article("https://w.example/1", "Hello"), &settings).await.unwrap();

        let mut changed = article("https://w.example/1", "Hello again");
        changed.content = Some("v2".to_string());
        upsert(&db, &changed, &settings).await.unwrap();

        let stored = db.find_article_by_link("https://w.example/1").await.unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("v1"));
        assert_eq!(stored.title, "Hello");
        assert_eq!(stored.updated_at, None);
    }

    #[tokio::test]
    async fn test_refresh_policy_updates_content_only() {
        let db = test_db().await;
        let settings = IngestSettings {
            on_duplicate: DuplicatePolicy::Refresh,
            ..IngestSettings::default()
        };
        upsert(&db, &article("https://w.example/1", "Hello"), &settings).await.unwrap();

        let mut changed = article("https://w.example/1", "Completely different");
        changed.content = Some("v2".to_string());
        changed.image_url = Some("https://img.example/1.jpg".to_string());
        let outcome = upsert(&db, &changed, &settings).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Refreshed);
        assert!(!outcome.is_new());

        let stored = db.find_article_by_link("https://w.example/1").await.unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("v2"));
        assert_eq!(stored.image_url.as_deref(), Some("https://img.example/1.jpg"));
        assert_eq!(stored.slug, "hello");
        assert_eq!(stored.title, "Hello");
    }

    #[tokio::test]
    async fn test_title_collision_gets_hashed_slug() {
        let db = test_db().await;
        let settings = IngestSettings::default();

        let first = upsert(&db, &article("https://w.example/1", "Breaking News"), &settings)
            .await
            .unwrap();
        let second = upsert(&db, &article("https://w.example/2", "Breaking News"), &settings)
            .await
            .unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::SlugCollisionResolved);

        let a = db.find_article_by_link("https://w.example/1").await.unwrap().unwrap();
        let b = db.find_article_by_link("https://w.example/2").await.unwrap().unwrap();
        assert_eq!(a.slug, "breaking-news");
        assert_eq!(
            b.slug,
            format!("breaking-news-{}", link_hash("https://w.example/2"))
        );
    }

    #[tokio::test]
    async fn test_slug_exhaustion_fails() {
        let db = test_db().await;
        let settings = IngestSettings {
            max_slug_retries: 0,
            ..IngestSettings::default()
        };
        upsert(&db, &article("https://w.example/1", "Same"), &settings).await.unwrap();

        let err = upsert(&db, &article("https://w.example/2", "Same"), &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::SlugExhausted { attempts: 1, .. }));
        assert_eq!(db.count_articles().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_numbered_candidates_after_hash() {
        let db = test_db().await;
        let settings = IngestSettings::default();
        let target = article("https://w.example/3", "Same");
        let hash = link_hash(&target.link);

        // Occupy the first two candidates with unrelated articles
        for (i, slug) in [slug_candidate("same", &hash, 0), slug_candidate("same", &hash, 1)]
            .iter()
            .enumerate()
        {
            let filler = article(&format!("https://other.example/{i}"), "Filler");
            db.insert_article(&filler, slug).await.unwrap();
        }

        assert_eq!(
            upsert(&db, &target, &settings).await.unwrap(),
            UpsertOutcome::SlugCollisionResolved
        );
        let stored = db.find_article_by_link(&target.link).await.unwrap().unwrap();
        assert_eq!(stored.slug, format!("same-{hash}-2"));
    }

    #[test]
    fn test_slug_candidates_fit_width() {
        let base = "a".repeat(MAX_SLUG_LEN);
        for attempt in 0..10 {
            assert!(slug_candidate(&base, "deadbeef", attempt).len() <= MAX_SLUG_LEN);
        }
    }

    #[test]
    fn test_link_hash_is_stable() {
        assert_eq!(link_hash("https://w.example/1"), link_hash("https://w.example/1"));
        assert_ne!(link_hash("https://w.example/1"), link_hash("https://w.example/2"));
        assert_eq!(link_hash("x").len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_storage_retries_then_gives_up() {
        let settings = IngestSettings {
            storage_retries: 2,
            ..IngestSettings::default()
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), UpsertError> = with_storage_retry(&settings, "lookup", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;

        assert!(matches!(
            result,
            Err(UpsertError::StorageUnavailable { retries: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_storage_recovers() {
        let settings = IngestSettings::default();
        let calls = AtomicU32::new(0);

        let result = with_storage_retry(&settings, "lookup", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_counts_as_unavailable() {
        let settings = IngestSettings {
            storage_retries: 0,
            write_timeout: Duration::from_millis(50),
            ..IngestSettings::default()
        };

        let result: Result<(), UpsertError> = with_storage_retry(&settings, "slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        match result {
            Err(UpsertError::StorageUnavailable { reason, .. }) => {
                assert!(reason.contains("slow timed out"))
            }
            other => panic!("Expected StorageUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_storage_errors_are_not_retried() {
        let settings = IngestSettings::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), UpsertError> = with_storage_retry(&settings, "lookup", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(matches!(result, Err(UpsertError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_success_is_reported() {
        let settings = IngestSettings {
            write_timeout: Duration::from_millis(50),
            ..IngestSettings::default()
        };
        let calls = AtomicU32::new(0);

        let result = storage_retry_tracking_timeouts(&settings, "insert_article", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<_, sqlx::Error>(ArticleInsert::LinkTaken)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, (ArticleInsert::LinkTaken, true));
    }

    #[tokio::test]
    async fn test_conflict_with_own_committed_insert_counts_as_new() {
        let db = test_db().await;
        let settings = IngestSettings::default();
        let a = article("https://w.example/1", "Hello");
        // The first attempt committed even though its timeout fired
        db.insert_article(&a, "hello").await.unwrap();

        let resolved = resolve_insert(&db, &settings, &a, "hello", ArticleInsert::LinkTaken, true)
            .await
            .unwrap();
        assert_eq!(resolved, InsertResolution::New);

        let resolved = resolve_insert(&db, &settings, &a, "hello", ArticleInsert::SlugTaken, true)
            .await
            .unwrap();
        assert_eq!(resolved, InsertResolution::New);
    }

    #[tokio::test]
    async fn test_conflict_without_timeout_is_a_duplicate() {
        let db = test_db().await;
        let settings = IngestSettings::default();
        let a = article("https://w.example/1", "Hello");
        db.insert_article(&a, "hello").await.unwrap();

        let resolved = resolve_insert(&db, &settings, &a, "hello", ArticleInsert::LinkTaken, false)
            .await
            .unwrap();
        assert_eq!(resolved, InsertResolution::Duplicate);
    }

    #[tokio::test]
    async fn test_conflict_with_other_row_after_timeout_is_kept() {
        let db = test_db().await;
        let settings = IngestSettings::default();
        let other = article("https://w.example/other", "Hello");
        db.insert_article(&other, "hello").await.unwrap();
        let mine = article("https://w.example/mine", "Hello");

        let resolved = resolve_insert(&db, &settings, &mine, "hello", ArticleInsert::SlugTaken, true)
            .await
            .unwrap();
        assert_eq!(resolved, InsertResolution::SlugTaken);
    }
}
