//! Synchronous conversion (`POST /convert/{category}`).
//!
//! The request is admitted (rate limit, then a per-client/global concurrency
//! permit), converted inline through the cache under the request timeout, and
//! answered with the converted bytes.

use std::str::FromStr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use axum::routing::post;
use kiln_core::{Category, ConversionRequest, ConvertError, ConvertedFile};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::{debug, info};

use crate::client::ClientId;
use crate::error::ServerError;
use crate::schemas::ErrorBody;
use crate::schemas::convert::UploadForm;
use crate::state::AppState;

pub static X_KILN_CACHE: &str = "x-kiln-cache";

/// RFC 5987 `attr-char` minus the alphanumerics.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/convert/{category}", post(convert))
}

pub fn parse_category(raw: &str) -> Result<Category, ConvertError> {
    Category::from_str(raw.trim())
        .map_err(|_| ConvertError::BadRequest(format!("unknown category '{raw}'; expected image, document or vector")))
}

/// Admit `client` or fail fast with `RateLimited`.
pub fn check_rate(state: &AppState, client: &ClientId) -> Result<(), ConvertError> {
    let decision = state.gate.check_rate(client.as_str());
    if decision.allowed {
        return Ok(());
    }
    Err(ConvertError::RateLimited {
        retry_after: decision.retry_after.unwrap_or(state.service.rate_window),
    })
}

/// Drain a multipart body into an [`UploadForm`].
pub async fn read_upload(mut multipart: Multipart) -> Result<UploadForm, ServerError> {
    let mut form = UploadForm::default();
    let mut saw_file = false;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                form.filename = field.file_name().unwrap_or_default().to_owned();
                form.file = field.bytes().await?;
                saw_file = true;
            }
            "to" => form.to = field.text().await?,
            "from" => form.from = Some(field.text().await?),
            "category" => form.category = Some(field.text().await?),
            "" => {}
            _ => {
                let value = field.text().await?;
                form.options.insert(name, value);
            }
        }
    }
    if !saw_file {
        return Err(ConvertError::BadRequest("missing file".into()).into());
    }
    if form.to.trim().is_empty() {
        return Err(ConvertError::BadRequest("missing target format 'to'".into()).into());
    }
    Ok(form)
}

impl UploadForm {
    pub fn into_request(self, category: Category, client: &ClientId) -> ConversionRequest {
        ConversionRequest {
            client: client.as_str().to_owned(),
            category,
            from: self.from,
            to: self.to,
            input: self.file,
            filename: self.filename,
            options: self.options,
        }
    }
}

/// `attachment; filename="..."; filename*=UTF-8''...` with an ASCII fallback
/// for clients that ignore the extended parameter.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' { c } else { '_' })
        .collect();
    let encoded = utf8_percent_encode(filename, ATTR_CHAR);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

/// Build a download response for a finished conversion.
pub fn file_response(file: ConvertedFile, filename: &str, cache_hit: bool) -> Result<Response, ServerError> {
    let header_value =
        |v: &str| HeaderValue::from_str(v).map_err(|e| ServerError::Internal(format!("invalid header value: {e}")));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, header_value(&file.mime)?)
        .header(header::CONTENT_DISPOSITION, header_value(&content_disposition(filename))?)
        .header(X_KILN_CACHE, if cache_hit { "hit" } else { "miss" })
        .body(Body::from(file.bytes))
        .map_err(|e| ServerError::Internal(e.to_string()))
}

/// Convert a file and return the result in the response body.
#[utoipa::path(
    post,
    path = "/convert/{category}",
    tag = "convert",
    params(("category" = String, Path, description = "image, document or vector")),
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Converted file bytes with Content-Type and Content-Disposition"),
        (status = 400, description = "Missing file or unsupported format", body = ErrorBody),
        (status = 413, description = "Upload too large", body = ErrorBody),
        (status = 422, description = "Conversion failed", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
        (status = 503, description = "Busy or tool unavailable", body = ErrorBody),
        (status = 504, description = "Timed out", body = ErrorBody),
    )
)]
pub async fn convert(
    State(state): State<Arc<AppState>>,
    client: ClientId,
    Path(category): Path<String>,
    multipart: Multipart,
) -> Result<Response, ServerError> {
    let category = parse_category(&category)?;
    check_rate(&state, &client)?;
    let permit = state
        .gate
        .acquire(client.as_str())
        .ok_or_else(|| ConvertError::Busy("concurrency limit reached; retry shortly".into()))?;

    let form = read_upload(multipart).await?;
    debug!(client = %client.as_str(), %category, to = %form.to, size = form.file.len(), "inline conversion");

    let request = form.into_request(category, &client);
    let result = state
        .scheduler
        .convert_inline(permit, request, state.service.request_timeout)
        .await?;

    info!(
        client = %client.as_str(),
        %category,
        cache_hit = result.cache_hit,
        size = result.file.bytes.len(),
        "inline conversion done"
    );
    file_response(result.file, &result.output_filename, result.cache_hit)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_disposition_encodes_non_ascii_names() {
        assert_eq!(
            content_disposition("résumé final.pdf"),
            "attachment; filename=\"r_sum_ final.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9%20final.pdf"
        );
        assert_eq!(
            content_disposition("a\"b.png"),
            "attachment; filename=\"a_b.png\"; filename*=UTF-8''a%22b.png"
        );
    }

    #[test]
    fn categories_parse_case_insensitively() {
        assert_eq!(parse_category("Image").unwrap(), Category::Image);
        assert!(parse_category("audio").unwrap_err().to_string().contains("unknown category"));
    }
}
