use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::{
    EditHandle, EditRequest, EditStatus, ErrorBody, SubmitBody, SubmitReceipt, SubmitResponse,
    StatusResponse,
};

#[derive(Debug, Error)]
pub enum EditError {
    #[error("too many requests")]
    Throttled { retry_after: Option<Duration> },
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("a submission is already in flight")]
    AlreadySubmitting,
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("no source image loaded")]
    NoSourceImage,
    #[error("invalid image payload: {0}")]
    InvalidImage(String),
    #[error("cancelled")]
    Cancelled,
}

/// Submit/poll contract shared by the remote service and the local simulator.
#[async_trait]
pub trait EditService: Send + Sync {
    async fn submit(&self, request: &EditRequest) -> Result<SubmitReceipt, EditError>;
    async fn status(&self, handle: &EditHandle) -> Result<EditStatus, EditError>;
}

pub struct RemoteEditService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RemoteEditService {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl EditService for RemoteEditService {
    async fn submit(&self, request: &EditRequest) -> Result<SubmitReceipt, EditError> {
        let image = request
            .image
            .to_data_uri()
            .ok_or_else(|| EditError::InvalidImage("source image not embedded".into()))?;
        let body = SubmitBody {
            prompt: request.prompt.clone(),
            image,
            parent_edit_uuid: request.parent_edit_id.clone(),
        };

        let url = format!("{}/edits", self.base_url);
        info!(url = %url, prompt = %request.prompt, "submitting edit");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EditError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers());
            warn!(?retry_after, "edit service throttled the submission");
            return Err(EditError::Throttled { retry_after });
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&body_text)
                .map(|b| b.detail)
                .unwrap_or_default();
            error!(%status, detail = %detail, "edit submission rejected");
            return Err(EditError::UploadFailed(detail));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| EditError::Transport(format!("parse error: {e}")))?;
        info!(edit_id = %parsed.edit_id, status = %parsed.status, "edit accepted");
        Ok(SubmitReceipt {
            handle: EditHandle::new(parsed.edit_id),
            message: parsed.message,
        })
    }

    async fn status(&self, handle: &EditHandle) -> Result<EditStatus, EditError> {
        let url = format!("{}/edits/{}", self.base_url, handle);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| EditError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EditError::Transport(format!("status={status}")));
        }
        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| EditError::Transport(format!("parse error: {e}")))?;
        Ok(parsed.into_status())
    }
}

/// Server wait hint on a 429: either delta-seconds or an HTTP-date.
fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let wait = at.with_timezone(&Utc) - Utc::now();
    wait.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    fn headers_with(value: &str) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, value.parse().unwrap());
        headers
    }

    #[test]
    fn retry_after_delta_seconds() {
        assert_eq!(
            parse_retry_after(&headers_with("2")),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn retry_after_http_date() {
        let at = Utc::now() + ChronoDuration::seconds(30);
        let wait = parse_retry_after(&headers_with(&at.to_rfc2822())).unwrap();
        assert!(wait <= Duration::from_secs(30));
        assert!(wait > Duration::from_secs(25));
    }

    #[test]
    fn retry_after_absent_or_garbage() {
        assert_eq!(parse_retry_after(&header::HeaderMap::new()), None);
        assert_eq!(parse_retry_after(&headers_with("soon")), None);
    }

    #[test]
    fn retry_after_date_in_the_past_yields_none() {
        let at = Utc::now() - ChronoDuration::seconds(30);
        assert_eq!(parse_retry_after(&headers_with(&at.to_rfc2822())), None);
    }
}
