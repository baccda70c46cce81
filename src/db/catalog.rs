//! `audio_files` table: the catalog of ingested audio messages.

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::SqlitePool;
use tracing::debug;

use crate::catalog::{AudioRecord, Catalog, Upserted};
use crate::error::Result;
use crate::source::{FeedId, MessageId};

#[derive(Debug, sqlx::FromRow)]
struct AudioRow {
    feed_id: i64,
    message_id: i64,
    date_s: i64,
    file_id: i64,
    title: Option<String>,
    performer: Option<String>,
    file_name: Option<String>,
    duration: i64,
    mime_type: Option<String>,
    size: i64,
    local_path: Option<String>,
    downloaded: bool,
}

impl From<AudioRow> for AudioRecord {
    fn from(value: AudioRow) -> Self {
        Self {
            feed_id: value.feed_id,
            message_id: value.message_id,
            date: DateTime::from_timestamp(value.date_s, 0).unwrap_or_default(),
            file_id: value.file_id,
            title: value.title,
            performer: value.performer,
            file_name: value.file_name,
            duration: u32::try_from(value.duration).unwrap_or(0),
            mime_type: value.mime_type,
            size: value.size,
            local_path: value.local_path,
            downloaded: value.downloaded,
        }
    }
}

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of catalogued records for `feed_id`.
    #[cfg(test)]
    pub async fn count(&self, feed_id: FeedId) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM audio_files WHERE feed_id = ?1")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn insert(&self, record: &AudioRecord) -> Result<()> {
        sqlx::query(
            r#"
      INSERT INTO audio_files(
        feed_id, message_id, date_s, file_id,
        title, performer, file_name, duration, mime_type,
        size, local_path, downloaded
      ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
      "#,
        )
        .bind(record.feed_id)
        .bind(record.message_id)
        .bind(record.date.timestamp())
        .bind(record.file_id)
        .bind(&record.title)
        .bind(&record.performer)
        .bind(&record.file_name)
        .bind(i64::from(record.duration))
        .bind(&record.mime_type)
        .bind(record.size)
        .bind(&record.local_path)
        .bind(record.downloaded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_transfer_state(&self, record: &AudioRecord) -> Result<()> {
        sqlx::query(
            r#"
      UPDATE audio_files
      SET size = ?3, local_path = ?4, downloaded = ?5
      WHERE feed_id = ?1 AND message_id = ?2
      "#,
        )
        .bind(record.feed_id)
        .bind(record.message_id)
        .bind(record.size)
        .bind(&record.local_path)
        .bind(record.downloaded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn upsert(&self, record: &AudioRecord) -> Result<Upserted> {
        let Some(mut existing) = self.get(record.feed_id, record.message_id).await? else {
            self.insert(record).await?;
            debug!(
                feed_id = record.feed_id,
                message_id = record.message_id,
                title = record.display_title(),
                "Catalogued audio"
            );
            return Ok(Upserted {
                record: record.clone(),
                existed: false,
                updated: true,
            });
        };

        let updated = record.is_newer_than(&existing);
        if updated {
            self.update_transfer_state(record).await?;
            existing.size = record.size;
            existing.local_path = record.local_path.clone();
            existing.downloaded = record.downloaded;
        }
        Ok(Upserted {
            record: existing,
            existed: true,
            updated,
        })
    }

    async fn get(&self, feed_id: FeedId, message_id: MessageId) -> Result<Option<AudioRecord>> {
        let row = sqlx::query_as::<_, AudioRow>(
            r#"
      SELECT feed_id, message_id, date_s, file_id,
             title, performer, file_name, duration, mime_type,
             size, local_path, downloaded
      FROM audio_files
      WHERE feed_id = ?1 AND message_id = ?2
      "#,
        )
        .bind(feed_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AudioRecord::from))
    }
}
