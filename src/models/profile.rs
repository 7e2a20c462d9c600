//! A user profile and its free-form attributes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;

/// Row as stored; `attributes` is a JSON object serialized to text.
#[derive(Clone, FromRow, Debug)]
pub struct ProfileRow {
    pub username: String,
    pub attributes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A profile as returned to clients.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Profile {
    /// Unique handle, also the primary key.
    pub username: String,

    /// Arbitrary JSON object, updated with merge patches.
    pub attributes: Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ProfileRow> for Profile {
    type Error = serde_json::Error;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            username: row.username,
            attributes: serde_json::from_str(&row.attributes)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
