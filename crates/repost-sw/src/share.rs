//! Share-target interception.
//!
//! The OS share sheet POSTs a form to the dashboard's content route. The
//! worker lifts `title`, `text` and `url` out of the body, hands them to the
//! content intake if one is installed, and redirects the page to the intake
//! route with a `shared=true` marker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{header, HeaderValue, StatusCode};
use repost_net::{Request, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::{SwError, SwResult};

/// Content captured from one share-sheet submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub title: Option<String>,
    pub text: Option<String>,
    pub url: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl ShareRecord {
    fn empty() -> Self {
        Self {
            title: None,
            text: None,
            url: None,
            captured_at: Utc::now(),
        }
    }

    fn set_field(&mut self, name: &str, value: String) {
        let slot = match name {
            "title" => &mut self.title,
            "text" => &mut self.text,
            "url" => &mut self.url,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.text.is_none() && self.url.is_none()
    }
}

/// Receiver for shared content.
#[async_trait]
pub trait ContentIntake: Send + Sync {
    async fn store(&self, record: ShareRecord) -> SwResult<()>;
}

/// Extract a [`ShareRecord`] from a share-target POST.
pub fn parse_share_request(request: &Request) -> SwResult<ShareRecord> {
    let mime = request
        .mime_type()
        .ok_or_else(|| SwError::Share("missing or invalid content type".to_string()))?;
    let body = request.body.as_deref().unwrap_or_default();

    if mime.type_() == mime::APPLICATION && mime.subtype() == mime::WWW_FORM_URLENCODED {
        Ok(parse_urlencoded(body))
    } else if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA {
        let boundary = mime
            .get_param(mime::BOUNDARY)
            .ok_or_else(|| SwError::Share("multipart body without boundary".to_string()))?;
        parse_multipart(body, boundary.as_str())
    } else {
        Err(SwError::Share(format!(
            "unsupported share content type {}",
            mime.essence_str()
        )))
    }
}

fn parse_urlencoded(body: &[u8]) -> ShareRecord {
    let mut record = ShareRecord::empty();
    for (name, value) in url::form_urlencoded::parse(body) {
        record.set_field(&name, value.into_owned());
    }
    record
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn parse_multipart(body: &[u8], boundary: &str) -> SwResult<ShareRecord> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let malformed = |what: &str| SwError::Share(format!("malformed multipart body: {what}"));

    let mut pos = find(body, delimiter, 0).ok_or_else(|| malformed("no opening boundary"))?;
    let mut record = ShareRecord::empty();

    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            return Ok(record);
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err(malformed("boundary not followed by CRLF"));
        }
        pos += 2;

        let headers_end =
            find(body, b"\r\n\r\n", pos).ok_or_else(|| malformed("unterminated part headers"))?;
        let headers = std::str::from_utf8(&body[pos..headers_end])
            .map_err(|_| malformed("part headers are not UTF-8"))?;
        let content_start = headers_end + 4;

        let next = find(body, delimiter, content_start)
            .ok_or_else(|| malformed("no closing boundary"))?;
        let content_end = next
            .checked_sub(2)
            .filter(|&end| end >= content_start && &body[end..next] == b"\r\n")
            .ok_or_else(|| malformed("part not terminated by CRLF"))?;

        if let Some(name) = form_field_name(headers) {
            match std::str::from_utf8(&body[content_start..content_end]) {
                Ok(value) => record.set_field(&name, value.to_string()),
                Err(_) => debug!(field = %name, "Skipping non-UTF-8 share field"),
            }
        }

        pos = next;
    }
}

/// Name of a plain form field, `None` for file parts.
fn form_field_name(headers: &str) -> Option<String> {
    let disposition = headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-disposition")
            .then(|| value.trim())
    })?;

    let mut field = None;
    for param in disposition.split(';').skip(1) {
        let Some((key, value)) = param.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "filename" => return None,
            "name" => field = Some(value.to_string()),
            _ => {}
        }
    }
    field
}

fn see_other(request: &Request, location: &url::Url) -> SwResult<Response> {
    let location = HeaderValue::from_str(location.as_str())
        .map_err(|e| SwError::Share(format!("redirect target not a header value: {e}")))?;
    Ok(Response::new(request.url.clone(), StatusCode::SEE_OTHER)
        .with_header(header::LOCATION, location))
}

/// Handle a share-target POST and build the 303 redirect.
pub async fn handle_share_target(
    config: &WorkerConfig,
    intake: Option<&dyn ContentIntake>,
    request: &Request,
) -> SwResult<Response> {
    let record = match parse_share_request(request) {
        Ok(record) => record,
        Err(e) => {
            warn!(url = %request.url, error = %e, "Could not read shared content");
            return see_other(request, &config.share_redirect_url(false)?);
        }
    };

    info!(
        has_title = record.title.is_some(),
        has_text = record.text.is_some(),
        has_url = record.url.is_some(),
        "Received shared content"
    );

    match intake {
        Some(intake) => {
            if let Err(e) = intake.store(record).await {
                warn!(error = %e, "Content intake rejected shared content");
            }
        }
        None => debug!("No content intake installed, shared content discarded"),
    }

    see_other(request, &config.share_redirect_url(true)?)
}
