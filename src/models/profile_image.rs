//! Metadata of an uploaded profile image.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// The payload itself lives on disk; this is the row describing it.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct ProfileImage {
    /// Owning profile.
    pub username: String,

    /// Random id, replaced on every upload so clients can bust caches.
    pub image_id: i64,

    /// Filename the client sent in `Content-Disposition`.
    pub filename: String,

    pub content_type: String,

    pub size_bytes: i64,

    /// MD5 of the payload.
    pub etag: String,

    pub uploaded_at: DateTime<Utc>,
}
