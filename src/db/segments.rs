//! `feed_segments` table: one row of covered ranges per feed.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::segments::{SegmentRepo, SegmentRow};
use crate::source::FeedId;

#[derive(Debug, sqlx::FromRow)]
struct SegmentRecord {
    feed_id: i64,
    title: String,
    original_title: String,
    segments: String,
}

impl From<SegmentRecord> for SegmentRow {
    fn from(value: SegmentRecord) -> Self {
        Self {
            feed_id: value.feed_id,
            title: value.title,
            original_title: value.original_title,
            segments: value.segments,
        }
    }
}

pub struct SqliteSegmentRepo {
    pool: SqlitePool,
}

impl SqliteSegmentRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SegmentRepo for SqliteSegmentRepo {
    async fn fetch(&self, feed_id: FeedId) -> Result<Option<SegmentRow>> {
        let row = sqlx::query_as::<_, SegmentRecord>(
            r#"
      SELECT feed_id, title, original_title, segments
      FROM feed_segments
      WHERE feed_id = ?1
      "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SegmentRow::from))
    }

    async fn upsert(&self, row: &SegmentRow) -> Result<()> {
        sqlx::query(
            r#"
      INSERT INTO feed_segments(feed_id, title, original_title, segments)
      VALUES (?1, ?2, ?3, ?4)
      ON CONFLICT(feed_id) DO UPDATE SET
        title = excluded.title,
        original_title = excluded.original_title,
        segments = excluded.segments
      "#,
        )
        .bind(row.feed_id)
        .bind(&row.title)
        .bind(&row.original_title)
        .bind(&row.segments)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn row(feed_id: FeedId, segments: &str) -> SegmentRow {
        SegmentRow {
            feed_id,
            title: "Chat".into(),
            original_title: "Chat (orig)".into(),
            segments: segments.into(),
        }
    }

    #[tokio::test]
    async fn fetch_missing_row_is_none() {
        let repo = SqliteSegmentRepo::new(memory_pool().await);
        assert!(repo.fetch(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_inserts_then_replaces() {
        let repo = SqliteSegmentRepo::new(memory_pool().await);

        repo.upsert(&row(-100, "[[0,0]]")).await.unwrap();
        repo.upsert(&row(-100, "[[951,1000]]")).await.unwrap();
        repo.upsert(&row(7, "[[1,2]]")).await.unwrap();

        assert_eq!(repo.fetch(-100).await.unwrap(), Some(row(-100, "[[951,1000]]")));
        assert_eq!(repo.fetch(7).await.unwrap(), Some(row(7, "[[1,2]]")));
    }
}
