//! Video metadata: who published what, under which content id, with which
//! tags. Independent of the paid stream; nothing here is gated.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use streamverse_core::voucher::unix_now;

const RECENT_WINDOW_SECS: u64 = 7 * 24 * 3600;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("video with cid {0} already exists")]
    DuplicateCid(String),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required fields")]
    Missing,
    #[error("Invalid Ethereum address format")]
    BadAddress,
    #[error("Tags must be an array")]
    TagsNotArray,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: i64,
    pub public_address: String,
    pub title: String,
    pub description: Option<String>,
    pub cid: String,
    pub tags: Vec<String>,
    /// Unix seconds.
    pub created_at: u64,
    pub updated_at: u64,
}

/// Body of `POST /api/videos`, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVideo {
    pub public_address: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub cid: Option<String>,
    pub tags: Option<serde_json::Value>,
}

/// Body of `PUT /api/videos/{id}`. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidVideo {
    pub public_address: String,
    pub title: String,
    pub description: Option<String>,
    pub cid: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStats {
    pub total_videos: u64,
    pub unique_creators: u64,
    pub recent_videos: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

pub fn is_eth_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_tags(tags: Option<serde_json::Value>) -> Result<Option<Vec<String>>, ValidationError> {
    match tags {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => Ok(s),
                _ => Err(ValidationError::TagsNotArray),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(ValidationError::TagsNotArray),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

impl NewVideo {
    pub fn validate(self) -> Result<ValidVideo, ValidationError> {
        let (Some(public_address), Some(title), Some(cid)) = (
            non_empty(self.public_address),
            non_empty(self.title),
            non_empty(self.cid),
        ) else {
            return Err(ValidationError::Missing);
        };
        if !is_eth_address(&public_address) {
            return Err(ValidationError::BadAddress);
        }
        Ok(ValidVideo {
            public_address,
            title,
            description: self.description,
            cid,
            tags: parse_tags(self.tags)?.unwrap_or_default(),
        })
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `ESCAPE '\'`.
fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

const COLUMNS: &str =
    "id, public_address, title, description, cid, tags, created_at, updated_at";

fn row_to_video(row: &Row<'_>) -> rusqlite::Result<Video> {
    let tags: String = row.get(5)?;
    Ok(Video {
        id: row.get(0)?,
        public_address: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        cid: row.get(4)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at: row.get::<_, i64>(6)? as u64,
        updated_at: row.get::<_, i64>(7)? as u64,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub struct VideoStore {
    conn: Mutex<Connection>,
}

impl VideoStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS videos (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                public_address TEXT NOT NULL,
                title          TEXT NOT NULL,
                description    TEXT,
                cid            TEXT NOT NULL UNIQUE,
                tags           TEXT NOT NULL DEFAULT '[]',
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS videos_by_address ON videos (public_address);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create(&self, video: &ValidVideo) -> Result<Video, StoreError> {
        let now = unix_now() as i64;
        let tags = serde_json::to_string(&video.tags).unwrap_or_else(|_| "[]".into());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO videos (public_address, title, description, cid, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![
                video.public_address,
                video.title,
                video.description,
                video.cid,
                tags,
                now
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateCid(video.cid.clone())
            } else {
                StoreError::Sqlite(e)
            }
        })?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            &format!("SELECT {COLUMNS} FROM videos WHERE id = ?1"),
            [id],
            row_to_video,
        )?)
    }

    fn select(&self, filter: &str, params: impl rusqlite::Params) -> Result<Vec<Video>, StoreError> {
        self.select_window(filter, "", params)
    }

    fn select_window(
        &self,
        filter: &str,
        window: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Video>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM videos {filter} ORDER BY created_at ASC, id ASC {window}"
        ))?;
        let rows = stmt.query_map(params, row_to_video)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn all(&self) -> Result<Vec<Video>, StoreError> {
        self.select("", [])
    }

    /// `page` is 1-based.
    pub fn page(&self, page: u32, limit: u32) -> Result<(Vec<Video>, Pagination), StoreError> {
        let page = page.max(1);
        let limit = limit.max(1);
        let offset = (page as i64 - 1) * limit as i64;
        let videos = self.select_window("", "LIMIT ?1 OFFSET ?2", [limit as i64, offset])?;
        let total: i64 = self
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM videos", [], |r| r.get(0))?;
        let total = total as u64;
        Ok((
            videos,
            Pagination {
                page,
                limit,
                total,
                total_pages: total.div_ceil(limit as u64),
            },
        ))
    }

    pub fn by_id(&self, id: i64) -> Result<Option<Video>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM videos WHERE id = ?1"),
                [id],
                row_to_video,
            )
            .optional()?)
    }

    pub fn by_cid(&self, cid: &str) -> Result<Option<Video>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM videos WHERE cid = ?1"),
                [cid],
                row_to_video,
            )
            .optional()?)
    }

    pub fn by_address(&self, address: &str) -> Result<Vec<Video>, StoreError> {
        self.select("WHERE public_address = ?1 COLLATE NOCASE", [address])
    }

    pub fn by_tag(&self, tag: &str) -> Result<Vec<Video>, StoreError> {
        self.select(
            "WHERE EXISTS (SELECT 1 FROM json_each(videos.tags) WHERE json_each.value = ?1)",
            [tag],
        )
    }

    /// Case-insensitive substring match on the title.
    pub fn search(&self, term: &str) -> Result<Vec<Video>, StoreError> {
        self.select("WHERE title LIKE ?1 ESCAPE '\\'", [like_pattern(term)])
    }

    /// Apply `update`. `Ok(None)` when no such video.
    pub fn update(&self, id: i64, update: VideoUpdate) -> Result<Option<Video>, UpdateError> {
        let tags = parse_tags(update.tags).map_err(UpdateError::Invalid)?;
        let tags = tags.map(|t| serde_json::to_string(&t).unwrap_or_else(|_| "[]".into()));
        {
            let conn = self.conn.lock().unwrap();
            let changed = conn
                .execute(
                    "UPDATE videos SET
                        title       = COALESCE(?2, title),
                        description = COALESCE(?3, description),
                        tags        = COALESCE(?4, tags),
                        updated_at  = ?5
                     WHERE id = ?1",
                    rusqlite::params![id, update.title, update.description, tags, unix_now() as i64],
                )
                .map_err(StoreError::from)?;
            if changed == 0 {
                return Ok(None);
            }
        }
        Ok(self.by_id(id)?)
    }

    pub fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM videos WHERE id = ?1", [id])? > 0)
    }

    pub fn stats(&self) -> Result<VideoStats, StoreError> {
        let since = unix_now().saturating_sub(RECENT_WINDOW_SECS) as i64;
        let conn = self.conn.lock().unwrap();
        let (total, creators, recent): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(DISTINCT lower(public_address)),
                    COALESCE(SUM(created_at >= ?1), 0)
             FROM videos",
            [since],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        Ok(VideoStats {
            total_videos: total as u64,
            unique_creators: creators as u64,
            recent_videos: recent as u64,
        })
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Invalid(ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
