//! Defines routes for profile and profile image operations.
//!
//! ## Structure
//! - **Profile endpoints**
//!   - `PUT    /profiles/{username}`: create profile
//!   - `GET    /profiles/{username}`: fetch profile
//!   - `PATCH  /profiles/{username}`: merge-patch attributes (`application/merge-patch+json`)
//!   - `DELETE /profiles/{username}`: delete profile and image
//!
//! - **Image endpoints**
//!   - `PUT    /profiles/{username}/image`: upload image (raw body + `Content-Disposition`)
//!   - `GET    /profiles/{username}/image`: download image
//!   - `DELETE /profiles/{username}/image`: delete image

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        profile_handlers::{
            create_profile, delete_image, delete_profile, get_image, get_profile, patch_profile,
            upload_image,
        },
    },
    services::profile_service::ProfileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, put},
};

/// Build the router. `max_upload_bytes` caps request bodies on the image
/// upload route.
pub fn routes(max_upload_bytes: usize) -> Router<ProfileService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/profiles/{username}",
            put(create_profile)
                .get(get_profile)
                .patch(patch_profile)
                .delete(delete_profile),
        )
        .route(
            "/profiles/{username}/image",
            put(upload_image)
                .get(get_image)
                .delete(delete_image)
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (Router, TempDir) {
        let db = create_pool("sqlite::memory:", 1).await.unwrap();
        run_migrations(&db, include_str!("../../migrations/0001_init.sql"))
            .await
            .unwrap();
        let dir = TempDir::new().unwrap();
        let service = ProfileService::new(Arc::new(db), dir.path());
        (routes(1024).with_state(service), dir)
    }

    fn empty(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn upload(content_type: &str, filename: &str, body: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri("/profiles/ada/image")
            .header(header::CONTENT_TYPE, content_type)
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn profile_lifecycle() {
        let (app, _dir) = app().await;

        let res = app.clone().oneshot(empty("PUT", "/profiles/ada")).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);

        let res = app.clone().oneshot(empty("PUT", "/profiles/ada")).await.unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let patch = Request::builder()
            .method("PATCH")
            .uri("/profiles/ada")
            .header(header::CONTENT_TYPE, "application/merge-patch+json")
            .body(Body::from(json!({"bio": "analyst"}).to_string()))
            .unwrap();
        let res = app.clone().oneshot(patch).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["attributes"], json!({"bio": "analyst"}));

        let res = app.clone().oneshot(empty("DELETE", "/profiles/ada")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = app.oneshot(empty("GET", "/profiles/ada")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn patch_with_plain_json_is_unsupported() {
        let (app, _dir) = app().await;
        app.clone().oneshot(empty("PUT", "/profiles/ada")).await.unwrap();

        let patch = Request::builder()
            .method("PATCH")
            .uri("/profiles/ada")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let res = app.oneshot(patch).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn image_upload_and_download() {
        let (app, _dir) = app().await;
        app.clone().oneshot(empty("PUT", "/profiles/ada")).await.unwrap();

        let res = app
            .clone()
            .oneshot(upload("image/png", "me.PNG", b"pngbytes"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key(header::ETAG));

        let res = app.clone().oneshot(empty("GET", "/profiles/ada/image")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"pngbytes");

        let res = app.clone().oneshot(empty("DELETE", "/profiles/ada/image")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let res = app.oneshot(empty("GET", "/profiles/ada/image")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn image_upload_is_validated() {
        let (app, _dir) = app().await;
        app.clone().oneshot(empty("PUT", "/profiles/ada")).await.unwrap();

        let res = app
            .clone()
            .oneshot(upload("image/tiff", "me.tiff", b"x"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let res = app
            .clone()
            .oneshot(upload("image/png", "me.jpg", b"x"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(res).await["developer_message"].is_string());

        let res = app
            .oneshot(upload("image/png", "big.png", &[0u8; 2048]))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
