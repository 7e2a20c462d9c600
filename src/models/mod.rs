//! Data models for the profile store.
//!
//! These map to the `profiles` and `profile_images` tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod profile;
pub mod profile_image;
