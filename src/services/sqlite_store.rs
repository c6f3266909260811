//! SQLite-backed `UploadMetadataStore`.
//!
//! One row per upload in `chunk_uploads`, one row per recorded chunk in
//! `chunk_upload_parts`, one row per recently assembled upload in
//! `chunk_upload_assembled`. The composite primary key on the parts table
//! makes `add_chunk_index` an atomic set-add. `mark_assembled` reports whether
//! this caller removed the upload row, which is what the receiver uses to
//! elect the single assembler of an upload.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

use crate::models::upload::{ChunkUploadMetadata, DeclaredUpload, UploadRow};
use crate::services::metadata_store::{UploadMetadataStore, ttl_from_secs};
use crate::services::UploadResult;

/// Schema, applied statement by statement by [`SqliteMetadataStore::migrate`].
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const SELECT_UPLOAD: &str = "SELECT upload_id, file_name, file_type, file_size, total_chunks, \
                             created_at, updated_at FROM chunk_uploads";

#[derive(Clone)]
pub struct SqliteMetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    ttl: Duration,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>, ttl_secs: u64) -> Self {
        Self {
            db,
            ttl: ttl_from_secs(ttl_secs),
        }
    }

    /// Create tables and indexes. Every statement is idempotent.
    pub async fn migrate(&self) -> UploadResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Oldest `updated_at` (unix ms) a live record may carry.
    fn cutoff_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.ttl.num_milliseconds()
    }

    async fn load_chunks(&self, upload_id: &str) -> UploadResult<BTreeSet<u32>> {
        let indices = sqlx::query_scalar::<_, i64>(
            "SELECT chunk_index FROM chunk_upload_parts WHERE upload_id = ? ORDER BY chunk_index",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(indices
            .into_iter()
            .filter_map(|i| u32::try_from(i).ok())
            .collect())
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, upload_id: &str, by: Duration) {
        sqlx::query(
            "UPDATE chunk_uploads SET updated_at = updated_at - ?, created_at = created_at - ? \
             WHERE upload_id = ?",
        )
        .bind(by.num_milliseconds())
        .bind(by.num_milliseconds())
        .bind(upload_id)
        .execute(&*self.db)
        .await
        .unwrap();
        sqlx::query("UPDATE chunk_upload_assembled SET assembled_at = assembled_at - ? WHERE upload_id = ?")
            .bind(by.num_milliseconds())
            .bind(upload_id)
            .execute(&*self.db)
            .await
            .unwrap();
    }
}

#[async_trait]
impl UploadMetadataStore for SqliteMetadataStore {
    async fn get(&self, upload_id: &str) -> UploadResult<Option<ChunkUploadMetadata>> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "{} WHERE upload_id = ? AND updated_at >= ?",
            SELECT_UPLOAD
        ))
        .bind(upload_id)
        .bind(self.cutoff_millis())
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => {
                let chunks = self.load_chunks(upload_id).await?;
                Ok(Some(row.into_metadata(chunks)))
            }
            None => Ok(None),
        }
    }

    async fn get_or_create(
        &self,
        upload_id: &str,
        declared: &DeclaredUpload,
    ) -> UploadResult<Option<ChunkUploadMetadata>> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db.begin().await?;

        let assembled = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM chunk_upload_assembled WHERE upload_id = ? AND assembled_at >= ?",
        )
        .bind(upload_id)
        .bind(self.cutoff_millis())
        .fetch_optional(&mut *tx)
        .await?;
        if assembled.is_some() {
            tx.commit().await?;
            return Ok(None);
        }

        // Replace an expired record rather than resurrecting its chunk set.
        let expired = sqlx::query("DELETE FROM chunk_uploads WHERE upload_id = ? AND updated_at < ?")
            .bind(upload_id)
            .bind(self.cutoff_millis())
            .execute(&mut *tx)
            .await?;
        if expired.rows_affected() > 0 {
            sqlx::query("DELETE FROM chunk_upload_parts WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO chunk_uploads (upload_id, file_name, file_type, file_size, total_chunks, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(upload_id) DO NOTHING",
        )
        .bind(upload_id)
        .bind(&declared.file_name)
        .bind(&declared.file_type)
        .bind(i64::try_from(declared.file_size).unwrap_or(i64::MAX))
        .bind(i64::from(declared.total_chunks))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, UploadRow>(&format!("{} WHERE upload_id = ?", SELECT_UPLOAD))
            .bind(upload_id)
            .fetch_one(&mut *tx)
            .await?;

        let indices = sqlx::query_scalar::<_, i64>(
            "SELECT chunk_index FROM chunk_upload_parts WHERE upload_id = ? ORDER BY chunk_index",
        )
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let chunks = indices
            .into_iter()
            .filter_map(|i| u32::try_from(i).ok())
            .collect();
        Ok(Some(row.into_metadata(chunks)))
    }

    async fn add_chunk_index(&self, upload_id: &str, chunk_index: u32) -> UploadResult<bool> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO chunk_upload_parts (upload_id, chunk_index, received_at) \
             SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM chunk_uploads WHERE upload_id = ?) \
             ON CONFLICT(upload_id, chunk_index) DO NOTHING",
        )
        .bind(upload_id)
        .bind(i64::from(chunk_index))
        .bind(now)
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE chunk_uploads SET updated_at = ? WHERE upload_id = ?")
            .bind(now)
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn mark_assembled(&self, upload_id: &str) -> UploadResult<bool> {
        let mut tx = self.db.begin().await?;

        let retired = sqlx::query("DELETE FROM chunk_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        if retired.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM chunk_upload_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO chunk_upload_assembled (upload_id, assembled_at) VALUES (?, ?) \
             ON CONFLICT(upload_id) DO UPDATE SET assembled_at = excluded.assembled_at",
        )
        .bind(upload_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn is_assembled(&self, upload_id: &str) -> UploadResult<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM chunk_upload_assembled WHERE upload_id = ? AND assembled_at >= ?",
        )
        .bind(upload_id)
        .bind(self.cutoff_millis())
        .fetch_optional(&*self.db)
        .await?;
        Ok(found.is_some())
    }

    async fn delete(&self, upload_id: &str) -> UploadResult<bool> {
        let mut tx = self.db.begin().await?;

        let removed = sqlx::query("DELETE FROM chunk_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM chunk_upload_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        let marker = sqlx::query("DELETE FROM chunk_upload_assembled WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(removed.rows_affected() == 1 || marker.rows_affected() == 1)
    }

    async fn expired_ids(&self) -> UploadResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT upload_id FROM chunk_uploads WHERE updated_at < ? ORDER BY updated_at ASC",
        )
        .bind(self.cutoff_millis())
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }

    async fn remove_expired(&self, upload_id: &str) -> UploadResult<Option<ChunkUploadMetadata>> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "{} WHERE upload_id = ? AND updated_at < ?",
            SELECT_UPLOAD
        ))
        .bind(upload_id)
        .bind(self.cutoff_millis())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let indices = sqlx::query_scalar::<_, i64>(
            "SELECT chunk_index FROM chunk_upload_parts WHERE upload_id = ? ORDER BY chunk_index",
        )
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunk_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunk_upload_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let chunks = indices
            .into_iter()
            .filter_map(|i| u32::try_from(i).ok())
            .collect();
        Ok(Some(row.into_metadata(chunks)))
    }

    async fn purge_assembled(&self) -> UploadResult<usize> {
        let dropped = sqlx::query("DELETE FROM chunk_upload_assembled WHERE assembled_at < ?")
            .bind(self.cutoff_millis())
            .execute(&*self.db)
            .await?;
        Ok(usize::try_from(dropped.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn ping(&self) -> UploadResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store(ttl_secs: u64) -> SqliteMetadataStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteMetadataStore::new(Arc::new(pool), ttl_secs);
        store.migrate().await.unwrap();
        store
    }

    fn declared() -> DeclaredUpload {
        DeclaredUpload {
            file_name: "clip.mp4".into(),
            file_type: "video/mp4".into(),
            file_size: 3 * 1024,
            total_chunks: 3,
        }
    }

    #[tokio::test]
    async fn migrate_is_repeatable() {
        let store = store(60).await;
        store.migrate().await.unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn records_chunks_idempotently() {
        let store = store(60).await;
        let meta = store.get_or_create("u1", &declared()).await.unwrap().unwrap();
        assert!(meta.uploaded_chunks.is_empty());

        assert!(store.add_chunk_index("u1", 2).await.unwrap());
        assert!(store.add_chunk_index("u1", 0).await.unwrap());
        assert!(!store.add_chunk_index("u1", 2).await.unwrap());

        let meta = store.get("u1").await.unwrap().unwrap();
        assert_eq!(meta.uploaded_chunks.into_iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(meta.file_name, "clip.mp4");
        assert_eq!(meta.total_chunks, 3);
    }

    #[tokio::test]
    async fn add_without_record_is_ignored() {
        let store = store(60).await;
        assert!(!store.add_chunk_index("ghost", 0).await.unwrap());
        assert!(store.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn existing_record_wins_over_new_declaration() {
        let store = store(60).await;
        store.get_or_create("u1", &declared()).await.unwrap();
        let mut other = declared();
        other.file_name = "other.mp4".into();
        let meta = store.get_or_create("u1", &other).await.unwrap().unwrap();
        assert_eq!(meta.file_name, "clip.mp4");
    }

    #[tokio::test]
    async fn mark_assembled_reports_single_winner() {
        let store = store(60).await;
        store.get_or_create("u1", &declared()).await.unwrap();
        store.add_chunk_index("u1", 0).await.unwrap();
        assert!(store.mark_assembled("u1").await.unwrap());
        assert!(!store.mark_assembled("u1").await.unwrap());

        assert!(store.get("u1").await.unwrap().is_none());
        assert!(store.is_assembled("u1").await.unwrap());
        assert!(store.get_or_create("u1", &declared()).await.unwrap().is_none());
        assert!(!store.add_chunk_index("u1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn delete_clears_parts_and_marker() {
        let store = store(60).await;
        store.get_or_create("u1", &declared()).await.unwrap();
        store.add_chunk_index("u1", 0).await.unwrap();
        store.mark_assembled("u1").await.unwrap();

        assert!(store.delete("u1").await.unwrap());
        assert!(!store.delete("u1").await.unwrap());

        let fresh = store.get_or_create("u1", &declared()).await.unwrap().unwrap();
        assert!(fresh.uploaded_chunks.is_empty());
    }

    #[tokio::test]
    async fn expired_records_and_markers_are_removed() {
        let store = store(60).await;
        store.get_or_create("old", &declared()).await.unwrap();
        store.add_chunk_index("old", 1).await.unwrap();
        store.get_or_create("fresh", &declared()).await.unwrap();
        store.get_or_create("done", &declared()).await.unwrap();
        store.mark_assembled("done").await.unwrap();
        store.backdate("old", Duration::seconds(300)).await;
        store.backdate("done", Duration::seconds(300)).await;

        assert!(store.get("old").await.unwrap().is_none());
        assert_eq!(store.expired_ids().await.unwrap(), vec!["old".to_string()]);

        let removed = store.remove_expired("old").await.unwrap().unwrap();
        assert_eq!(removed.upload_id, "old");
        assert!(removed.uploaded_chunks.contains(&1));
        assert!(store.remove_expired("old").await.unwrap().is_none());
        assert!(store.remove_expired("fresh").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());

        assert!(!store.is_assembled("done").await.unwrap());
        assert_eq!(store.purge_assembled().await.unwrap(), 1);
        assert!(store.expired_ids().await.unwrap().is_empty());
    }
}
