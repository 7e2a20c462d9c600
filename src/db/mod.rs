//! Database plumbing: pool setup, migrations, transaction scopes and id
//! generation.

pub mod sqlite;
pub mod transaction;

use rand::Rng;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{collections::HashSet, ops::RangeInclusive};

/// Largest value that fits a signed 32-bit integer column.
pub const MAX_INT_ID: i64 = (1 << 31) - 1;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Execute a `;`-separated migration script statement by statement.
pub async fn run_migrations(db: &SqlitePool, sql: &str) -> Result<usize, sqlx::Error> {
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in &statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(statements.len())
}

/// Pick a random integer in `range` that is not in `used_ids`.
///
/// Returns `None` once every value of the range is taken.
pub fn generate_int_id(range: RangeInclusive<i64>, used_ids: &HashSet<i64>) -> Option<i64> {
    if range.is_empty() {
        return None;
    }
    // `None` means the span does not fit in a u64, which no id set can fill.
    let span = range.end().abs_diff(*range.start()).checked_add(1);
    let taken = used_ids.iter().filter(|id| range.contains(*id)).count() as u64;
    if span.is_some_and(|span| taken >= span) {
        return None;
    }

    let mut rng = rand::thread_rng();
    loop {
        let candidate = rng.gen_range(range.clone());
        if !used_ids.contains(&candidate) {
            return Some(candidate);
        }
    }
}
