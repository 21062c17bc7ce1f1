//! Attachment repository implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use lectern_core::{Attachment, AttachmentId, AttachmentRepository, Error, NewAttachment, Result};

use crate::retry::with_retry;
use crate::{from_millis, from_millis_opt, to_millis};

const ATTACHMENT_COLUMNS: &str = "id, filename, path, content_type, file_size, checksum, \
     extracted_text, extraction_confidence, extracted_at, created_at, updated_at";

/// Map a file extension to a MIME type for formats without magic bytes.
pub fn content_type_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "rst" => "text/x-rst",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        "odt" => "application/vnd.oasis.opendocument.text",
        "rtf" => "application/rtf",
        _ => return None,
    };
    Some(mime)
}

/// Detect a content type from magic bytes, falling back to the extension.
pub fn detect_content_type(path: &Path, data: &[u8]) -> Option<String> {
    // Office formats are zip containers; trust a specific extension over "application/zip".
    if let Some(kind) = infer::get(data) {
        if kind.mime_type() != "application/zip" {
            return Some(kind.mime_type().to_string());
        }
    }
    content_type_from_extension(path).map(str::to_string)
}

/// SQLite implementation of AttachmentRepository.
#[derive(Clone)]
pub struct SqliteAttachmentRepository {
    pool: SqlitePool,
}

impl SqliteAttachmentRepository {
    /// Create a new SqliteAttachmentRepository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up an attachment by its stored path.
    pub async fn get_by_path(&self, path: &str) -> Result<Option<Attachment>> {
        let pool = &self.pool;
        let sql = format!("SELECT {} FROM attachments WHERE path = ?", ATTACHMENT_COLUMNS);
        let sql = sql.as_str();
        let row = with_retry("attachment_get_by_path", || async move {
            sqlx::query(sql).bind(path).fetch_optional(pool).await
        })
        .await?;
        row.map(|r| parse_attachment_row(&r)).transpose()
    }
}

fn parse_attachment_row(row: &SqliteRow) -> Result<Attachment> {
    Ok(Attachment {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        path: row.try_get("path")?,
        content_type: row.try_get("content_type")?,
        file_size: row.try_get("file_size")?,
        checksum: row.try_get("checksum")?,
        extracted_text: row.try_get("extracted_text")?,
        extraction_confidence: row.try_get("extraction_confidence")?,
        extracted_at: from_millis_opt(row.try_get("extracted_at")?),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

#[async_trait]
impl AttachmentRepository for SqliteAttachmentRepository {
    async fn insert(&self, attachment: NewAttachment) -> Result<Attachment> {
        let pool = &self.pool;
        let now = to_millis(Utc::now());
        let sql = format!(
            "INSERT INTO attachments (filename, path, content_type, file_size, checksum, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {}",
            ATTACHMENT_COLUMNS
        );
        let sql = sql.as_str();
        let new = &attachment;
        let row = with_retry("attachment_insert", || async move {
            sqlx::query(sql)
                .bind(&new.filename)
                .bind(&new.path)
                .bind(&new.content_type)
                .bind(new.file_size)
                .bind(&new.checksum)
                .bind(now)
                .bind(now)
                .fetch_one(pool)
                .await
        })
        .await?;

        let attachment = parse_attachment_row(&row)?;
        debug!(
            subsystem = "database",
            component = "attachments",
            op = "insert",
            attachment_id = attachment.id,
            path = %attachment.path,
            "Attachment registered"
        );
        Ok(attachment)
    }

    async fn register_file(&self, path: &Path) -> Result<Attachment> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(Error::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let canonical = tokio::fs::canonicalize(path).await?;
        let stored_path = canonical.to_string_lossy().into_owned();
        if let Some(existing) = self.get_by_path(&stored_path).await? {
            return Ok(existing);
        }

        let data = tokio::fs::read(&canonical).await?;
        let checksum = hex::encode(Sha256::digest(&data));
        let filename = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| stored_path.clone());

        self.insert(NewAttachment {
            filename,
            path: stored_path,
            content_type: detect_content_type(&canonical, &data),
            file_size: i64::try_from(data.len()).unwrap_or(i64::MAX),
            checksum: Some(checksum),
        })
        .await
    }

    async fn get(&self, id: AttachmentId) -> Result<Option<Attachment>> {
        let pool = &self.pool;
        let sql = format!("SELECT {} FROM attachments WHERE id = ?", ATTACHMENT_COLUMNS);
        let sql = sql.as_str();
        let row = with_retry("attachment_get", || async move {
            sqlx::query(sql).bind(id).fetch_optional(pool).await
        })
        .await?;
        row.map(|r| parse_attachment_row(&r)).transpose()
    }

    async fn exists(&self, id: AttachmentId) -> Result<bool> {
        let pool = &self.pool;
        let found: Option<i64> = with_retry("attachment_exists", || async move {
            sqlx::query_scalar("SELECT 1 FROM attachments WHERE id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await
        })
        .await?;
        Ok(found.is_some())
    }

    async fn update_extraction(
        &self,
        id: AttachmentId,
        text: &str,
        confidence: f64,
    ) -> Result<()> {
        let pool = &self.pool;
        let now = to_millis(Utc::now());
        let result = with_retry("attachment_update_extraction", || async move {
            sqlx::query(
                "UPDATE attachments
                 SET extracted_text = ?, extraction_confidence = ?, extracted_at = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(text)
            .bind(confidence)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::AttachmentNotFound(id));
        }
        Ok(())
    }

    async fn list_unextracted(&self, limit: i64) -> Result<Vec<Attachment>> {
        let pool = &self.pool;
        let sql = format!(
            "SELECT {} FROM attachments WHERE extracted_text IS NULL ORDER BY created_at, id LIMIT ?",
            ATTACHMENT_COLUMNS
        );
        let sql = sql.as_str();
        let rows = with_retry("attachment_list_unextracted", || async move {
            sqlx::query(sql).bind(limit).fetch_all(pool).await
        })
        .await?;
        rows.iter().map(parse_attachment_row).collect()
    }
}
