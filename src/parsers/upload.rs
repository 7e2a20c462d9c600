//! Raw-body file uploads with content-type / extension checks.
//!
//! The whole request body is the file. The declared `Content-Type` has to be
//! one the route accepts, and the filename from `Content-Disposition` has to
//! carry an extension that fits that content type.

use super::{ParserContext, ParserError, RequestParser};
use axum::http::header;
use bytes::Bytes;

/// Known media types and the filename extensions they may use. Extensions
/// are lowercase; media types missing here accept any extension.
pub const FILE_EXTENSIONS: &[(&str, &[&str])] = &[
    ("image/gif", &[".gif"]),
    ("image/jpeg", &[".jpeg", ".jpg"]),
    ("image/pjpeg", &[".jpeg", ".jpg"]),
    ("image/png", &[".png"]),
];

const MISSING_FILENAME: &str = "Missing filename. Request should include a Content-Disposition header with a filename parameter.";

/// A file taken from a request body.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content_type: String,
    pub content: Bytes,
}

impl UploadedFile {
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TypedFileUploadParser;

impl TypedFileUploadParser {
    pub fn file_extensions(media_type: &str) -> Option<&'static [&'static str]> {
        FILE_EXTENSIONS
            .iter()
            .find(|(mt, _)| *mt == media_type)
            .map(|(_, exts)| *exts)
    }

    /// Filename from the `Content-Disposition` header. `filename*` wins over
    /// `filename` when both are present.
    pub fn filename(ctx: &ParserContext<'_>) -> Option<String> {
        let disposition = ctx
            .headers
            .get(header::CONTENT_DISPOSITION)?
            .to_str()
            .ok()?;
        let params = parse_header_params(disposition);

        let encoded = params
            .iter()
            .find(|(k, _)| k == "filename*")
            .and_then(|(_, v)| decode_extended_value(v));
        encoded.or_else(|| {
            params
                .into_iter()
                .find(|(k, _)| k == "filename")
                .map(|(_, v)| v)
        })
    }
}

impl RequestParser for TypedFileUploadParser {
    const MEDIA_TYPE: &'static str = "*/*";

    type Output = UploadedFile;

    fn parse(
        &self,
        body: Bytes,
        media_type: &str,
        ctx: &ParserContext<'_>,
    ) -> Result<UploadedFile, ParserError> {
        if let Some(allowed) = ctx.upload_media_types {
            if !allowed.contains(&media_type) {
                return Err(ParserError::UnsupportedMediaType(media_type.to_string()));
            }
        }

        let filename = Self::filename(ctx)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ParserError::Parse(MISSING_FILENAME.into()))?;

        if let Some(extensions) = Self::file_extensions(media_type) {
            let ext = match filename.rsplit_once('.') {
                Some((_, ext)) => format!(".{}", ext.to_ascii_lowercase()),
                None => String::new(),
            };
            if !extensions.contains(&ext.as_str()) {
                return Err(ParserError::Parse(format!(
                    "File extension does not match requested Content-type. Filename: \"{}\", Content-type: \"{}\"",
                    filename, media_type
                )));
            }
        }

        tracing::debug!(filename = %filename, media_type, size = body.len(), "parsed upload");
        Ok(UploadedFile {
            name: filename,
            content_type: media_type.to_string(),
            content: body,
        })
    }
}

/// Split a header value like `attachment; filename="a;b.png"` into
/// lowercased parameter names and values. `;` inside quotes does not split.
/// Values are unquoted only when quoted on both ends.
fn parse_header_params(value: &str) -> Vec<(String, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for c in value.chars() {
        match c {
            '\\' if in_quotes && !escaped => {
                escaped = true;
                current.push(c);
                continue;
            }
            '"' if !escaped => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                segments.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        escaped = false;
        current.push(c);
    }
    segments.push(current);

    segments
        .into_iter()
        .skip(1)
        .filter_map(|segment| {
            let (name, raw) = segment.split_once('=')?;
            let raw = raw.trim();
            let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
                raw[1..raw.len() - 1]
                    .replace("\\\\", "\\")
                    .replace("\\\"", "\"")
            } else {
                raw.to_string()
            };
            Some((name.trim().to_ascii_lowercase(), value))
        })
        .collect()
}

/// Decode an RFC 5987 `charset'language'percent-encoded` value.
fn decode_extended_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let _charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = parts.next()?;
    Some(percent_decode(encoded))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    const IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "application/octet-stream"];

    fn headers(disposition: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(disposition).unwrap(),
        );
        headers
    }

    fn parse(
        media_type: &str,
        disposition: &str,
        allowed: Option<&[&str]>,
    ) -> Result<UploadedFile, ParserError> {
        let headers = headers(disposition);
        let ctx = ParserContext {
            upload_media_types: allowed,
            headers: &headers,
        };
        TypedFileUploadParser.parse(Bytes::from_static(b"abcdefgh"), media_type, &ctx)
    }

    #[test]
    fn supported_type_is_parsed() {
        let file = parse(
            "image/png",
            r#"attachment; filename="file.PNG""#,
            Some(IMAGE_TYPES),
        )
        .unwrap();
        assert_eq!(file.name, "file.PNG");
        assert_eq!(file.content_type, "image/png");
        assert_eq!(&file.content[..], b"abcdefgh");
        assert_eq!(file.size(), 8);
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let err = parse(
            "image/tiff",
            r#"attachment; filename="file.tiff""#,
            Some(IMAGE_TYPES),
        )
        .unwrap_err();
        assert_eq!(err, ParserError::UnsupportedMediaType("image/tiff".into()));
    }

    #[test]
    fn unconstrained_type_accepts_any_extension() {
        // unbalanced quote is kept as part of the name
        let file = parse(
            "application/octet-stream",
            r#"attachment; filename="VIRUS.EXE"#,
            Some(IMAGE_TYPES),
        )
        .unwrap();
        assert_eq!(file.name, "\"VIRUS.EXE");
        assert_eq!(&file.content[..], b"abcdefgh");
    }

    #[test]
    fn mismatched_extension_is_rejected() {
        let err = parse(
            "image/png",
            r#"attachment; filename="file.jpg""#,
            Some(IMAGE_TYPES),
        )
        .unwrap_err();
        match err {
            ParserError::Parse(msg) => {
                assert!(msg.contains("file.jpg"));
                assert!(msg.contains("image/png"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn view_without_whitelist_accepts_known_type() {
        let file = parse("image/png", r#"attachment; filename="file.png""#, None).unwrap();
        assert_eq!(&file.content[..], b"abcdefgh");
    }

    #[test]
    fn view_without_whitelist_still_checks_extension() {
        let err = parse("image/png", r#"attachment; filename="file.jpg""#, None).unwrap_err();
        assert!(matches!(err, ParserError::Parse(_)));
    }

    #[test]
    fn unknown_type_without_whitelist_accepts_any_extension() {
        assert!(TypedFileUploadParser::file_extensions("application/json").is_none());
        let file = parse(
            "application/json",
            r#"attachment; filename="file.xyz""#,
            None,
        )
        .unwrap();
        assert_eq!(file.name, "file.xyz");
    }

    #[test]
    fn missing_extension_on_constrained_type_is_rejected() {
        let err = parse("image/gif", "attachment; filename=noext", None).unwrap_err();
        assert!(matches!(err, ParserError::Parse(_)));
    }

    #[test]
    fn missing_filename_is_a_parse_error() {
        let err = parse("image/png", "attachment", None).unwrap_err();
        assert_eq!(err, ParserError::Parse(MISSING_FILENAME.into()));

        let empty = HeaderMap::new();
        let ctx = ParserContext::new(&empty);
        let err = TypedFileUploadParser
            .parse(Bytes::new(), "image/png", &ctx)
            .unwrap_err();
        assert_eq!(err, ParserError::Parse(MISSING_FILENAME.into()));
    }

    #[test]
    fn extended_filename_wins() {
        let file = parse(
            "image/jpeg",
            r#"attachment; filename="fallback.jpg"; filename*=UTF-8''caf%C3%A9.JPG"#,
            None,
        )
        .unwrap();
        assert_eq!(file.name, "café.JPG");
    }

    #[test]
    fn quoted_semicolons_do_not_split() {
        let file = parse(
            "image/png",
            r#"attachment; filename="a;b \"c\".png""#,
            None,
        )
        .unwrap();
        assert_eq!(file.name, r#"a;b "c".png"#);
    }

    #[test]
    fn percent_escapes_need_two_hex_digits() {
        assert_eq!(percent_decode("%41%2e%+5%4"), "A.%+5%4");
        assert_eq!(percent_decode("a%20b%zz"), "a b%zz");
    }
}
