//! src/services/profile_service.rs
//!
//! ProfileService: profile attributes and profile images backed by SQLite
//! for metadata and local disk for image payloads. Images are sharded beneath
//! `base_path/{shard}/{shard}/{username}/image`.
//!
//! Every multi-step write runs inside a commit-on-success scope so that a
//! failure part way leaves the database untouched.

use crate::{
    db::{
        MAX_INT_ID, generate_int_id,
        sqlite::{SqliteBackend, SqliteManagedConnection},
        transaction::{CommitOnSuccess, TransactionError},
    },
    models::{
        profile::{Profile, ProfileRow},
        profile_image::ProfileImage,
    },
    parsers::{merge_patch::apply_merge_patch, upload::UploadedFile},
};
use chrono::Utc;
use serde_json::{Value, json};
use sqlx::{Executor, SqlitePool, sqlite::Sqlite};
use std::{
    collections::HashSet,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("profile `{0}` not found")]
    ProfileNotFound(String),
    #[error("profile `{0}` already exists")]
    ProfileAlreadyExists(String),
    #[error("username `{name}` invalid: {reason}")]
    InvalidUsername { name: String, reason: String },
    #[error("profile `{0}` has no image")]
    ImageNotFound(String),
    #[error("invalid merge patch: {0}")]
    InvalidPatch(String),
    #[error("no free image id left")]
    ImageIdsExhausted,
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// ProfileService provides:
/// - Create / read / delete profiles
/// - Merge-patch profile attributes
/// - Upload, read and delete a profile image (payload on disk, metadata in SQLite)
#[derive(Clone)]
pub struct ProfileService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where image payloads are stored.
    pub base_path: PathBuf,
}

const USERNAME_MIN_LEN: usize = 2;
const USERNAME_MAX_LEN: usize = 30;
const IMAGE_FILE_NAME: &str = "image";

impl ProfileService {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Validate username format.
    ///
    /// - 2–30 characters
    /// - ASCII letters, digits, underscores and hyphens only
    ///
    /// Usernames become directory names, so nothing else gets through.
    fn ensure_username_safe(&self, name: &str) -> StorageResult<()> {
        let len = name.len();
        if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
            return Err(StorageError::InvalidUsername {
                name: name.to_string(),
                reason: format!(
                    "must be between {} and {} characters",
                    USERNAME_MIN_LEN, USERNAME_MAX_LEN
                ),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StorageError::InvalidUsername {
                name: name.to_string(),
                reason: "allowed characters are letters, digits, underscores and hyphens".into(),
            });
        }

        Ok(())
    }

    /// Generate two-level shard identifiers for a username.
    ///
    /// Uses MD5(username) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff).
    fn shards(username: &str) -> (String, String) {
        let digest = md5::compute(username);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn profile_dir(&self, username: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(username);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(username);
        path
    }

    fn image_path(&self, username: &str) -> PathBuf {
        self.profile_dir(username).join(IMAGE_FILE_NAME)
    }

    async fn acquire(&self) -> StorageResult<SqliteManagedConnection> {
        Ok(SqliteBackend::acquire(&self.db).await?)
    }

    /// Create an empty profile. Returns ProfileAlreadyExists on conflict.
    pub async fn create_profile(&self, username: &str) -> StorageResult<Profile> {
        self.ensure_username_safe(username)?;
        let now = Utc::now();

        match sqlx::query(
            "INSERT INTO profiles (username, attributes, created_at, updated_at)
             VALUES (?, '{}', ?, ?)",
        )
        .bind(username)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await
        {
            Ok(_) => {
                info!(username, "created profile");
                Ok(Profile {
                    username: username.to_string(),
                    attributes: json!({}),
                    created_at: now,
                    updated_at: now,
                })
            }
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::ProfileAlreadyExists(username.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    pub async fn get_profile(&self, username: &str) -> StorageResult<Profile> {
        self.ensure_username_safe(username)?;
        let row = fetch_profile_row(&*self.db, username).await?;
        Ok(Profile::try_from(row)?)
    }

    /// Apply an RFC 7396 merge patch to the profile attributes.
    ///
    /// The read-modify-write runs in a READ COMMITTED scope. The patch has to
    /// be an object; attributes always stay an object.
    pub async fn patch_profile(&self, username: &str, patch: Value) -> StorageResult<Profile> {
        self.ensure_username_safe(username)?;
        if !patch.is_object() {
            return Err(StorageError::InvalidPatch(
                "merge patch must be a JSON object".into(),
            ));
        }

        let mut conn = self.acquire().await?;
        let username = username.to_string();
        CommitOnSuccess::read_committed()
            .run(&mut conn, move |conn| {
                Box::pin(apply_attributes_patch(conn, username, patch))
            })
            .await
    }

    /// Store an uploaded image for a profile.
    ///
    /// - Writes the payload to a temporary file and fsyncs it.
    /// - Upserts the metadata row with a fresh image id.
    /// - Swaps the temporary file into place while the write lock is held,
    ///   keeping the previous image aside until the commit went through.
    ///
    /// When the transaction does not commit, the previous image is put back
    /// and the temporary file is removed.
    pub async fn upload_image(
        &self,
        username: &str,
        file: UploadedFile,
    ) -> StorageResult<ProfileImage> {
        self.ensure_username_safe(username)?;
        fetch_profile_row(&*self.db, username).await?;

        let file_path = self.image_path(username);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "image path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        write_synced(&tmp_path, &file.content).await?;

        let upload = PendingImage {
            username: username.to_string(),
            filename: file.name,
            content_type: file.content_type,
            size_bytes: file.content.len() as i64,
            etag: format!("{:x}", md5::compute(&file.content)),
            backup_path: parent.join(format!(".prev-{}", Uuid::new_v4())),
            tmp_path,
            file_path,
        };

        let result = self.commit_image(&upload).await;
        match &result {
            Ok(_) => {
                let _ = fs::remove_file(&upload.backup_path).await;
            }
            Err(_) => {
                let _ = fs::remove_file(&upload.tmp_path).await;
            }
        }
        result
    }

    /// Upsert the row and swap the files inside one commit-on-success scope.
    /// The on-disk image always matches the row that ends up committed.
    async fn commit_image(&self, upload: &PendingImage) -> StorageResult<ProfileImage> {
        let mut conn = self.acquire().await?;
        let tx = CommitOnSuccess::new();
        tx.enter(&mut conn).await?;

        let staged = store_image(&mut conn, upload).await;
        let closed = tx.exit(&mut conn, staged.is_ok()).await;

        match (staged, closed) {
            (Ok((image, _)), Ok(())) => {
                info!(username = %image.username, image_id = image.image_id, "stored profile image");
                Ok(image)
            }
            (Ok((_, replaced)), Err(err)) => {
                restore_previous_image(upload, replaced).await;
                Err(err.into())
            }
            (Err(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
        }
    }

    /// Image metadata plus an open handle on the payload.
    ///
    /// Returns ImageNotFound if the row exists but the file is gone.
    pub async fn open_image(&self, username: &str) -> StorageResult<(ProfileImage, File)> {
        self.ensure_username_safe(username)?;
        let image = fetch_image(&*self.db, username).await?;

        let file = File::open(self.image_path(username))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::ImageNotFound(username.to_string())
                } else {
                    StorageError::Io(err)
                }
            })?;

        Ok((image, file))
    }

    /// Remove the image row and then the payload.
    ///
    /// Prunes the shard directories left empty.
    pub async fn delete_image(&self, username: &str) -> StorageResult<ProfileImage> {
        self.ensure_username_safe(username)?;
        let mut conn = self.acquire().await?;
        let owner = username.to_string();
        let image = CommitOnSuccess::new()
            .run(&mut conn, move |conn| Box::pin(remove_image_row(conn, owner)))
            .await?;

        let file_path = self.image_path(username);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed image file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }

        Ok(image)
    }

    /// Delete a profile together with its image.
    ///
    /// Both rows go in one transaction; the files are removed afterwards,
    /// best effort.
    pub async fn delete_profile(&self, username: &str) -> StorageResult<()> {
        self.ensure_username_safe(username)?;
        let mut conn = self.acquire().await?;
        let owner = username.to_string();
        CommitOnSuccess::new()
            .run(&mut conn, move |conn| Box::pin(remove_profile_rows(conn, owner)))
            .await?;

        let dir = self.profile_dir(username);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => {
                if let Some(parent) = dir.parent() {
                    self.prune_empty_dirs(parent, &self.base_path).await;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!(
                "failed to remove profile directory {} after delete: {}",
                dir.display(),
                err
            ),
        }

        info!(username, "deleted profile");
        Ok(())
    }

    /// Recursively remove empty directories up to `stop` (exclusive).
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Everything needed to commit an uploaded image.
struct PendingImage {
    username: String,
    filename: String,
    content_type: String,
    size_bytes: i64,
    etag: String,
    tmp_path: PathBuf,
    file_path: PathBuf,
    /// Where the previous image waits until the commit.
    backup_path: PathBuf,
}

async fn fetch_profile_row<'e, E>(executor: E, username: &str) -> StorageResult<ProfileRow>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, ProfileRow>(
        "SELECT username, attributes, created_at, updated_at
         FROM profiles WHERE username = ?",
    )
    .bind(username)
    .fetch_one(executor)
    .await
    .map_err(|err| match err {
        sqlx::Error::RowNotFound => StorageError::ProfileNotFound(username.to_string()),
        other => StorageError::Sqlx(other),
    })
}

async fn fetch_image<'e, E>(executor: E, username: &str) -> StorageResult<ProfileImage>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, ProfileImage>(
        "SELECT username, image_id, filename, content_type, size_bytes, etag, uploaded_at
         FROM profile_images WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| StorageError::ImageNotFound(username.to_string()))
}

async fn apply_attributes_patch(
    conn: &mut SqliteManagedConnection,
    username: String,
    patch: Value,
) -> StorageResult<Profile> {
    let db = conn.backend_mut().connection().await?;
    let row = fetch_profile_row(&mut *db, &username).await?;

    let mut attributes: Value = serde_json::from_str(&row.attributes)?;
    apply_merge_patch(&mut attributes, &patch);
    let updated_at = Utc::now();

    sqlx::query("UPDATE profiles SET attributes = ?, updated_at = ? WHERE username = ?")
        .bind(attributes.to_string())
        .bind(updated_at)
        .bind(&username)
        .execute(&mut *db)
        .await?;

    debug!(username = %username, "patched profile attributes");
    Ok(Profile {
        username,
        attributes,
        created_at: row.created_at,
        updated_at,
    })
}

/// Upsert the image row, then move the previous image aside and the new one
/// into place. Returns the row and whether a previous image was moved aside.
async fn store_image(
    conn: &mut SqliteManagedConnection,
    upload: &PendingImage,
) -> StorageResult<(ProfileImage, bool)> {
    let db = conn.backend_mut().connection().await?;

    let previous: Option<i64> =
        sqlx::query_scalar("SELECT image_id FROM profile_images WHERE username = ?")
            .bind(&upload.username)
            .fetch_optional(&mut *db)
            .await?;
    let used: HashSet<i64> = previous.into_iter().collect();
    let image_id = generate_int_id(0..=MAX_INT_ID, &used).ok_or(StorageError::ImageIdsExhausted)?;

    let image = sqlx::query_as::<_, ProfileImage>(
        r#"
        INSERT INTO profile_images (
            username, image_id, filename, content_type, size_bytes, etag, uploaded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(username) DO UPDATE SET
            image_id = excluded.image_id,
            filename = excluded.filename,
            content_type = excluded.content_type,
            size_bytes = excluded.size_bytes,
            etag = excluded.etag,
            uploaded_at = excluded.uploaded_at
        RETURNING username, image_id, filename, content_type, size_bytes, etag, uploaded_at
        "#,
    )
    .bind(&upload.username)
    .bind(image_id)
    .bind(&upload.filename)
    .bind(&upload.content_type)
    .bind(upload.size_bytes)
    .bind(&upload.etag)
    .bind(Utc::now())
    .fetch_one(&mut *db)
    .await?;

    let replaced = match fs::rename(&upload.file_path, &upload.backup_path).await {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => return Err(StorageError::Io(err)),
    };
    if let Err(err) = fs::rename(&upload.tmp_path, &upload.file_path).await {
        if replaced {
            let _ = fs::rename(&upload.backup_path, &upload.file_path).await;
        }
        return Err(StorageError::Io(err));
    }

    debug!(username = %image.username, image_id, "swapped in new image");
    Ok((image, replaced))
}

/// Undo the file swap of [`store_image`] after its transaction was rolled
/// back.
async fn restore_previous_image(upload: &PendingImage, replaced: bool) {
    let restored = if replaced {
        fs::rename(&upload.backup_path, &upload.file_path).await
    } else {
        fs::remove_file(&upload.file_path).await
    };
    if let Err(err) = restored {
        warn!(
            path = %upload.file_path.display(),
            error = %err,
            "could not restore previous image"
        );
    }
}

async fn remove_image_row(
    conn: &mut SqliteManagedConnection,
    username: String,
) -> StorageResult<ProfileImage> {
    let db = conn.backend_mut().connection().await?;
    sqlx::query_as::<_, ProfileImage>(
        "DELETE FROM profile_images WHERE username = ?
         RETURNING username, image_id, filename, content_type, size_bytes, etag, uploaded_at",
    )
    .bind(&username)
    .fetch_optional(&mut *db)
    .await?
    .ok_or(StorageError::ImageNotFound(username))
}

async fn remove_profile_rows(
    conn: &mut SqliteManagedConnection,
    username: String,
) -> StorageResult<()> {
    let db = conn.backend_mut().connection().await?;
    sqlx::query("DELETE FROM profile_images WHERE username = ?")
        .bind(&username)
        .execute(&mut *db)
        .await?;

    let result = sqlx::query("DELETE FROM profiles WHERE username = ?")
        .bind(&username)
        .execute(&mut *db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::ProfileNotFound(username));
    }
    Ok(())
}

/// Write `content` to `path` and fsync it. The file is removed again if any
/// step fails.
async fn write_synced(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    let written = async {
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(path).await;
        return Err(err);
    }
    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
