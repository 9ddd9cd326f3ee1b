//! Content and content_setting database operations

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};

use crate::db::Database;
use crate::models::{Content, ContentSetting};

const CONTENT_COLUMNS: &str = "content_id, user_id, title, status, error, youtube_url, youtube_channel, prompt_format, product_info, category, created_at, updated_at";

fn row_to_content(row: &Row) -> SqliteResult<Content> {
    Ok(Content {
        content_id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        status: row.get(3)?,
        error: row.get(4)?,
        youtube_url: row.get(5)?,
        youtube_channel: row.get(6)?,
        prompt_format: row.get(7)?,
        product_info: row.get(8)?,
        category: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Insert a content row on an open connection or transaction
pub(super) fn write_content(conn: &Connection, content: &Content) -> SqliteResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO content ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            CONTENT_COLUMNS
        ),
        params![
            content.content_id,
            content.user_id,
            content.title,
            content.status,
            content.error,
            content.youtube_url,
            content.youtube_channel,
            content.prompt_format,
            content.product_info,
            content.category,
            content.created_at,
            content.updated_at,
        ],
    )?;
    Ok(())
}

/// Insert or update content settings on an open connection or transaction
pub(super) fn write_content_setting(conn: &Connection, setting: &ContentSetting, now: &str) -> SqliteResult<()> {
    conn.execute(
        "INSERT INTO content_setting
            (content_id, script_mode, media_mode, channel, tts_voice, tts_speed, tags, priority, settings, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(content_id) DO UPDATE SET
            script_mode = excluded.script_mode,
            media_mode = excluded.media_mode,
            channel = excluded.channel,
            tts_voice = excluded.tts_voice,
            tts_speed = excluded.tts_speed,
            tags = excluded.tags,
            priority = excluded.priority,
            settings = excluded.settings,
            updated_at = excluded.updated_at",
        params![
            setting.content_id,
            setting.script_mode,
            setting.media_mode,
            setting.channel,
            setting.tts_voice,
            setting.tts_speed,
            setting.tags,
            setting.priority,
            setting.settings,
            now,
        ],
    )?;
    Ok(())
}

impl Database {
    // ============================================
    // Content
    // ============================================

    /// Insert a content record
    pub fn insert_content(&self, content: &Content) -> SqliteResult<()> {
        let conn = self.conn.lock();
        write_content(&conn, content)
    }

    /// Get content by id
    pub fn get_content(&self, content_id: &str) -> SqliteResult<Option<Content>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM content WHERE content_id = ?1", CONTENT_COLUMNS),
            [content_id],
            row_to_content,
        )
        .optional()
    }

    /// Set status (and error) of a content
    pub fn set_content_status(
        &self,
        content_id: &str,
        status: &str,
        error: Option<&str>,
        now: &str,
    ) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE content SET status = ?1, error = ?2, updated_at = ?3 WHERE content_id = ?4",
            params![status, error, now, content_id],
        )
    }

    /// Mark a content as processing unless it was cancelled meanwhile
    pub fn mark_content_processing(&self, content_id: &str, now: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE content SET status = 'processing', error = NULL, updated_at = ?1
             WHERE content_id = ?2 AND status != 'cancelled'",
            params![now, content_id],
        )
    }

    /// Store the uploaded video URL
    pub fn set_youtube_url(&self, content_id: &str, url: &str, now: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE content SET youtube_url = ?1, updated_at = ?2 WHERE content_id = ?3",
            params![url, now, content_id],
        )
    }

    /// Fail content stuck in `processing` (all, or last updated before
    /// `cutoff`). Returns the ids that were failed.
    pub fn fail_processing_content(
        &self,
        error: &str,
        cutoff: Option<&str>,
        now: &str,
    ) -> SqliteResult<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT content_id FROM content
                 WHERE status = 'processing' AND (?1 IS NULL OR updated_at < ?1)",
            )?;
            stmt.query_map([cutoff], |row| row.get(0))?
                .collect::<SqliteResult<Vec<_>>>()?
        };

        tx.execute(
            "UPDATE content SET status = 'failed', error = ?1, updated_at = ?2
             WHERE status = 'processing' AND (?3 IS NULL OR updated_at < ?3)",
            params![error, now, cutoff],
        )?;

        tx.commit()?;
        Ok(ids)
    }

    /// Fail a single content that is mid-generation
    pub fn recover_content(&self, content_id: &str, error: &str, now: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE content SET status = 'failed', error = ?1, updated_at = ?2
             WHERE content_id = ?3 AND status IN ('script', 'video', 'processing')",
            params![error, now, content_id],
        )
    }

    /// Cancel a content that is pending or processing
    pub fn cancel_content(&self, content_id: &str, error: &str, now: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE content SET status = 'cancelled', error = ?1, updated_at = ?2
             WHERE content_id = ?3 AND status IN ('processing', 'pending')",
            params![error, now, content_id],
        )
    }

    /// Cancel pending/processing content derived from `source_id`
    pub fn cancel_derived_content(&self, source_id: &str, error: &str, now: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE content SET status = 'cancelled', error = ?1, updated_at = ?2
             WHERE source_content_id = ?3 AND status IN ('processing', 'pending')",
            params![error, now, source_id],
        )
    }

    // ============================================
    // Content settings
    // ============================================

    /// Insert or replace the generation settings of a content
    pub fn upsert_content_setting(&self, setting: &ContentSetting, now: &str) -> SqliteResult<()> {
        let conn = self.conn.lock();
        write_content_setting(&conn, setting, now)
    }

    /// Get the generation settings of a content
    pub fn get_content_setting(&self, content_id: &str) -> SqliteResult<Option<ContentSetting>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT content_id, script_mode, media_mode, channel, tts_voice, tts_speed, tags, priority, settings
             FROM content_setting WHERE content_id = ?1",
            [content_id],
            |row| {
                Ok(ContentSetting {
                    content_id: row.get(0)?,
                    script_mode: row.get(1)?,
                    media_mode: row.get(2)?,
                    channel: row.get(3)?,
                    tts_voice: row.get(4)?,
                    tts_speed: row.get(5)?,
                    tags: row.get(6)?,
                    priority: row.get(7)?,
                    settings: row.get(8)?,
                })
            },
        )
        .optional()
    }
}
