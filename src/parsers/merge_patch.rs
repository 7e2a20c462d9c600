//! JSON merge patch documents (RFC 7396).

use super::{ParserContext, ParserError, RequestParser};
use bytes::Bytes;
use serde_json::{Map, Value};

pub const MERGE_PATCH_MEDIA_TYPE: &str = "application/merge-patch+json";

/// Decodes `application/merge-patch+json` bodies. The body is plain JSON;
/// only the media type differs.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergePatchParser;

impl RequestParser for MergePatchParser {
    const MEDIA_TYPE: &'static str = MERGE_PATCH_MEDIA_TYPE;

    type Output = Value;

    fn parse(
        &self,
        body: Bytes,
        _media_type: &str,
        _ctx: &ParserContext<'_>,
    ) -> Result<Value, ParserError> {
        serde_json::from_slice(&body)
            .map_err(|err| ParserError::Parse(format!("JSON parse error - {}", err)))
    }
}

/// Apply `patch` to `target` in place.
///
/// Object members set to `null` are removed, nested objects merge
/// recursively, anything else replaces what was there. A patch that is not an
/// object replaces the whole target.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_members) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_members) = target else {
        return;
    };

    for (key, value) in patch_members {
        if value.is_null() {
            target_members.remove(key);
        } else {
            let slot = target_members.entry(key.clone()).or_insert(Value::Null);
            apply_merge_patch(slot, value);
        }
    }
}
