//! axum extractors running the request parsers.

use super::{
    ParserContext, ParserError, RequestParser, UploadView, media_type_matches,
    merge_patch::MergePatchParser,
    request_media_type,
    upload::{TypedFileUploadParser, UploadedFile},
};
use crate::errors::AppError;
use axum::{
    extract::{FromRequest, Request},
    http::{StatusCode, header},
};
use bytes::Bytes;
use serde_json::Value;
use std::marker::PhantomData;

/// Request body taken as a single typed file, checked against `V`'s
/// accepted media types.
pub struct TypedUpload<V> {
    pub file: UploadedFile,
    _view: PhantomData<V>,
}

impl<V> TypedUpload<V> {
    pub fn into_inner(self) -> UploadedFile {
        self.file
    }
}

impl<S, V> FromRequest<S> for TypedUpload<V>
where
    S: Send + Sync,
    V: UploadView,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let headers = req.headers().clone();
        let media_type = request_media_type(&headers);
        if !media_type_matches(TypedFileUploadParser::MEDIA_TYPE, &media_type) {
            return Err(ParserError::UnsupportedMediaType(media_type).into());
        }

        let body = read_body(req, state).await?;
        let ctx = ParserContext::for_view::<V>(&headers);
        let file = TypedFileUploadParser.parse(body, &media_type, &ctx)?;
        Ok(Self {
            file,
            _view: PhantomData,
        })
    }
}

/// Body of an `application/merge-patch+json` request.
pub struct MergePatch(pub Value);

impl<S> FromRequest<S> for MergePatch
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let headers = req.headers().clone();
        let declared = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !media_type_matches(MergePatchParser::MEDIA_TYPE, &declared) {
            return Err(ParserError::UnsupportedMediaType(request_media_type(&headers)).into());
        }

        let body = read_body(req, state).await?;
        let value = MergePatchParser.parse(body, &declared, &ParserContext::new(&headers))?;
        Ok(MergePatch(value))
    }
}

async fn read_body<S: Send + Sync>(req: Request, state: &S) -> Result<Bytes, ParserError> {
    Bytes::from_request(req, state)
        .await
        .map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ParserError::PayloadTooLarge(rejection.body_text())
            } else {
                ParserError::Parse(rejection.body_text())
            }
        })
}
