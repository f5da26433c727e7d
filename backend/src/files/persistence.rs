// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use couriercommon::{identifiers::AttachmentId, messages::ScanVerdict};
use sqlx::Row;

use super::{AttachmentRecord, FileServiceError, FileStore, PgFileStore};

#[async_trait]
impl FileStore for PgFileStore {
    async fn insert(&self, record: &AttachmentRecord) -> Result<(), FileServiceError> {
        sqlx::query(
            "INSERT INTO attachments
                (file_id, filename, file_size, mime_type, object_key, verdict,
                 created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.file_id)
        .bind(&record.filename)
        .bind(record.size as i64)
        .bind(&record.mime_type)
        .bind(&record.object_key)
        .bind(record.verdict.as_str())
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn get(
        &self,
        file_id: &AttachmentId,
    ) -> Result<Option<AttachmentRecord>, FileServiceError> {
        let row = sqlx::query(
            "SELECT file_id, filename, file_size, mime_type, object_key, verdict,
                    created_at, expires_at
                FROM attachments WHERE file_id = $1",
        )
        .bind(file_id)
        .fetch_optional(&self.db_pool)
        .await?;
        row.map(|row| {
            let verdict: String = row.try_get("verdict")?;
            let verdict = verdict
                .parse::<ScanVerdict>()
                .map_err(|e| sqlx::Error::Decode(e.into()))?;
            let size: i64 = row.try_get("file_size")?;
            Ok::<_, sqlx::Error>(AttachmentRecord {
                file_id: row.try_get("file_id")?,
                filename: row.try_get("filename")?,
                size: size as u64,
                mime_type: row.try_get("mime_type")?,
                object_key: row.try_get("object_key")?,
                verdict,
                created_at: row.try_get("created_at")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
        .map_err(Into::into)
    }

    async fn set_verdict(
        &self,
        file_id: &AttachmentId,
        verdict: ScanVerdict,
    ) -> Result<(), FileServiceError> {
        let result = sqlx::query("UPDATE attachments SET verdict = $1 WHERE file_id = $2")
            .bind(verdict.as_str())
            .bind(file_id)
            .execute(&self.db_pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(FileServiceError::NotFound);
        }
        Ok(())
    }
}
