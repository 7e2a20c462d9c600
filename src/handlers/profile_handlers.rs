//! HTTP handlers for profiles and profile images.
//! Image bodies are streamed out from disk; parsing and storage concerns live
//! in the extractors and `ProfileService`.

use crate::{
    errors::AppError,
    models::{profile::Profile, profile_image::ProfileImage},
    parsers::{
        UploadView,
        extract::{MergePatch, TypedUpload},
    },
    services::profile_service::ProfileService,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

/// Upload settings for `PUT /profiles/{username}/image`.
pub struct ProfileImageView;

impl UploadView for ProfileImageView {
    fn upload_media_types() -> Option<&'static [&'static str]> {
        Some(&["image/gif", "image/jpeg", "image/pjpeg", "image/png"])
    }
}

/// `PUT /profiles/{username}`: create an empty profile.
pub async fn create_profile(
    State(service): State<ProfileService>,
    Path(username): Path<String>,
) -> Result<(StatusCode, Json<Profile>), AppError> {
    let profile = service.create_profile(&username).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

/// `GET /profiles/{username}`
pub async fn get_profile(
    State(service): State<ProfileService>,
    Path(username): Path<String>,
) -> Result<Json<Profile>, AppError> {
    Ok(Json(service.get_profile(&username).await?))
}

/// `PATCH /profiles/{username}`: merge-patch the profile attributes.
pub async fn patch_profile(
    State(service): State<ProfileService>,
    Path(username): Path<String>,
    MergePatch(patch): MergePatch,
) -> Result<Json<Profile>, AppError> {
    Ok(Json(service.patch_profile(&username, patch).await?))
}

/// `DELETE /profiles/{username}`
pub async fn delete_profile(
    State(service): State<ProfileService>,
    Path(username): Path<String>,
) -> Result<StatusCode, AppError> {
    service.delete_profile(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /profiles/{username}/image`: raw image body with
/// `Content-Disposition: attachment; filename="..."`.
pub async fn upload_image(
    State(service): State<ProfileService>,
    Path(username): Path<String>,
    upload: TypedUpload<ProfileImageView>,
) -> Result<Response, AppError> {
    let image = service.upload_image(&username, upload.into_inner()).await?;

    let mut headers = HeaderMap::new();
    set_etag(&mut headers, &image);
    Ok((StatusCode::OK, headers, Json(image)).into_response())
}

/// `GET /profiles/{username}/image`: stream the stored image.
pub async fn get_image(
    State(service): State<ProfileService>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let (image, file) = service.open_image(&username).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    set_image_headers(response.headers_mut(), &image);
    Ok(response)
}

/// `DELETE /profiles/{username}/image`
pub async fn delete_image(
    State(service): State<ProfileService>,
    Path(username): Path<String>,
) -> Result<StatusCode, AppError> {
    service.delete_image(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn set_etag(headers: &mut HeaderMap, image: &ProfileImage) {
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", image.etag)) {
        headers.insert(header::ETAG, value);
    }
}

fn set_image_headers(headers: &mut HeaderMap, image: &ProfileImage) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&image.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(image.size_bytes.max(0) as u64),
    );
    set_etag(headers, image);
    if let Ok(value) = HeaderValue::from_str(&image.uploaded_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
