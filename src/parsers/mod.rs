//! Request body parsers.
//!
//! A parser declares the media type it handles and turns a raw body into a
//! typed value. Handlers never call parsers directly; they use the axum
//! extractors in [`extract`], which pick the parser by media type and run it
//! with a [`ParserContext`] describing the route.

pub mod extract;
pub mod merge_patch;
pub mod upload;

use axum::http::{HeaderMap, StatusCode, header};
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParserError {
    #[error("Unsupported media type \"{0}\" in request.")]
    UnsupportedMediaType(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    PayloadTooLarge(String),
}

impl ParserError {
    pub fn status(&self) -> StatusCode {
        match self {
            ParserError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ParserError::Parse(_) => StatusCode::BAD_REQUEST,
            ParserError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Per-route parser settings.
pub trait UploadView: Send + Sync + 'static {
    /// Media types the route accepts for uploads. `None` accepts any.
    fn upload_media_types() -> Option<&'static [&'static str]> {
        None
    }
}

/// Route with no upload restrictions.
pub struct AnyUpload;

impl UploadView for AnyUpload {}

/// What a parser gets to see besides the body.
#[derive(Clone, Copy)]
pub struct ParserContext<'a> {
    pub upload_media_types: Option<&'a [&'a str]>,
    pub headers: &'a HeaderMap,
}

impl<'a> ParserContext<'a> {
    pub fn new(headers: &'a HeaderMap) -> Self {
        Self {
            upload_media_types: None,
            headers,
        }
    }

    pub fn for_view<V: UploadView>(headers: &'a HeaderMap) -> Self {
        Self {
            upload_media_types: V::upload_media_types(),
            headers,
        }
    }
}

pub trait RequestParser {
    /// Media type pattern this parser accepts, wildcards allowed.
    const MEDIA_TYPE: &'static str;

    type Output;

    fn parse(
        &self,
        body: Bytes,
        media_type: &str,
        ctx: &ParserContext<'_>,
    ) -> Result<Self::Output, ParserError>;
}

/// Media type of a request, without parameters and lowercased.
///
/// Requests without a `Content-Type` are treated as
/// `application/octet-stream`.
pub fn request_media_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(base_media_type)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "application/octet-stream".into())
}

fn base_media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Whether a parser registered for `pattern` can handle `media_type`.
///
/// `*/*` matches everything and `type/*` matches any subtype. Parameters on
/// either side are ignored and the comparison is case-insensitive.
pub fn media_type_matches(pattern: &str, media_type: &str) -> bool {
    let pattern = base_media_type(pattern);
    let actual = base_media_type(media_type);

    let (pattern_main, pattern_sub) = pattern.split_once('/').unwrap_or((pattern.as_str(), ""));
    let (actual_main, actual_sub) = actual.split_once('/').unwrap_or((actual.as_str(), ""));

    (pattern_sub == "*" || pattern_sub == actual_sub)
        && (pattern_main == "*" || pattern_main == actual_main)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn wildcards_match() {
        assert!(media_type_matches("*/*", "image/png"));
        assert!(media_type_matches("image/*", "image/png"));
        assert!(!media_type_matches("image/*", "application/json"));
        assert!(media_type_matches(
            "application/merge-patch+json",
            "application/merge-patch+json; charset=utf-8"
        ));
        assert!(!media_type_matches("application/merge-patch+json", "application/json"));
    }

    #[test]
    fn parameters_are_ignored() {
        assert!(media_type_matches(
            "text/plain; charset=utf-8",
            "text/plain; charset=latin-1; format=flowed"
        ));
        assert!(media_type_matches("text/plain; charset=utf-8", "TEXT/Plain"));
        assert!(media_type_matches("image/png", "image/png; q=0.5"));
        assert!(!media_type_matches("text/plain; charset=utf-8", "text/html; charset=utf-8"));
    }

    #[test]
    fn request_media_type_strips_params() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_media_type(&headers), "application/octet-stream");

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Image/PNG; charset=binary"),
        );
        assert_eq!(request_media_type(&headers), "image/png");
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            ParserError::UnsupportedMediaType("image/tiff".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ParserError::UnsupportedMediaType("image/tiff".into()).to_string(),
            "Unsupported media type \"image/tiff\" in request."
        );
        assert_eq!(ParserError::Parse("bad".into()).status(), StatusCode::BAD_REQUEST);
    }
}
