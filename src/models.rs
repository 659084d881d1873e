use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::service::EditError;

/// A self-describing image payload. Everything that crosses the wire is an
/// embedded representation (data URI); `Url` is only an intermediate form
/// that must be resolved with [`ImagePayload::ensure_embedded`] first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    DataUri(String),
    Bytes { bytes: Bytes, mime: String },
    Url(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Svg,
    Unknown,
}

impl ImagePayload {
    pub fn is_embedded(&self) -> bool {
        !matches!(self, ImagePayload::Url(_))
    }

    /// Embedded representation suitable for the submit body. `None` for
    /// unresolved URL payloads.
    pub fn to_data_uri(&self) -> Option<String> {
        match self {
            ImagePayload::DataUri(uri) => Some(uri.clone()),
            ImagePayload::Bytes { bytes, mime } => Some(format!(
                "data:{};base64,{}",
                mime,
                base64::engine::general_purpose::STANDARD.encode(bytes)
            )),
            ImagePayload::Url(_) => None,
        }
    }

    /// Raw bytes and mime type of an embedded payload.
    pub fn to_bytes(&self) -> Option<(Bytes, String)> {
        match self {
            ImagePayload::Bytes { bytes, mime } => Some((bytes.clone(), mime.clone())),
            ImagePayload::DataUri(uri) => {
                let rest = uri.strip_prefix("data:")?;
                let (meta, data) = rest.split_once(',')?;
                let mime = meta
                    .split(';')
                    .next()
                    .filter(|m| !m.is_empty())
                    .unwrap_or("application/octet-stream");
                let decoded = base64::engine::general_purpose::STANDARD.decode(data).ok()?;
                Some((Bytes::from(decoded), mime.to_string()))
            }
            ImagePayload::Url(_) => None,
        }
    }

    /// Fetch a URL payload and convert it to an embedded one, so the
    /// submission path never depends on the lifetime of a remote object.
    /// Already-embedded payloads pass through unchanged.
    pub async fn ensure_embedded(self, client: &reqwest::Client) -> Result<ImagePayload, EditError> {
        let url = match self {
            ImagePayload::Url(url) => url,
            embedded => return Ok(embedded),
        };
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| EditError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EditError::Transport(format!(
                "image fetch failed: status={}",
                response.status()
            )));
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).to_string())
            .unwrap_or_else(|| "image/png".to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EditError::Transport(e.to_string()))?;
        Ok(ImagePayload::Bytes { bytes, mime })
    }

    /// Sniff the format from the base64 prefix of the embedded data.
    pub fn format(&self) -> ImageFormat {
        let encoded = match self {
            ImagePayload::DataUri(uri) => match uri.split_once(',') {
                Some((_, data)) => data.to_string(),
                None => return ImageFormat::Unknown,
            },
            ImagePayload::Bytes { bytes, .. } => {
                base64::engine::general_purpose::STANDARD.encode(&bytes[..bytes.len().min(16)])
            }
            ImagePayload::Url(_) => return ImageFormat::Unknown,
        };
        if encoded.starts_with("iVBORw0KGgo") {
            ImageFormat::Png
        } else if encoded.starts_with("/9j/") {
            ImageFormat::Jpeg
        } else if encoded.starts_with("PHN2Zy") {
            ImageFormat::Svg
        } else {
            ImageFormat::Unknown
        }
    }

    /// Checks that the payload is embedded, decodable, and non-empty. Used
    /// before a result image replaces a chain placeholder.
    pub fn validate(&self) -> Result<(), EditError> {
        match self {
            ImagePayload::Url(url) => Err(EditError::InvalidImage(format!(
                "payload not embedded: {url}"
            ))),
            ImagePayload::Bytes { bytes, .. } => {
                if bytes.is_empty() {
                    return Err(EditError::InvalidImage("empty image payload".into()));
                }
                Ok(())
            }
            ImagePayload::DataUri(_) => {
                let (bytes, _) = self
                    .to_bytes()
                    .ok_or_else(|| EditError::InvalidImage("malformed data URI".into()))?;
                if bytes.is_empty() {
                    return Err(EditError::InvalidImage("empty image payload".into()));
                }
                if self.format() == ImageFormat::Unknown {
                    warn!("result image has unrecognized format, keeping it anyway");
                }
                Ok(())
            }
        }
    }

    /// Truncated form for logging; never log a whole payload.
    pub fn preview(&self) -> String {
        let s = match self {
            ImagePayload::DataUri(uri) => uri.clone(),
            ImagePayload::Url(url) => return url.clone(),
            ImagePayload::Bytes { bytes, mime } => {
                return format!("<{} bytes, {}>", bytes.len(), mime)
            }
        };
        if s.len() > 50 {
            format!("{}...[{} chars total]", &s[..50], s.len())
        } else {
            s
        }
    }
}

/// Opaque identifier for one submitted edit, used to poll for the result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditHandle(String);

impl EditHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EditHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One submission: prompt + source image, optionally chained from a prior
/// edit's id.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub prompt: String,
    pub image: ImagePayload,
    pub parent_edit_id: Option<String>,
}

/// Returned by a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub handle: EditHandle,
    pub message: String,
}

/// Polled state of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditStatus {
    Processing {
        stage: String,
        progress: u8,
        message: String,
    },
    Completed {
        image: ImagePayload,
        message: String,
    },
    Failed {
        error: String,
    },
}

impl EditStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EditStatus::Processing { .. })
    }

    /// 0-100; defined as 100 once completed.
    pub fn progress_percent(&self) -> u8 {
        match self {
            EditStatus::Processing { progress, .. } => *progress,
            EditStatus::Completed { .. } => 100,
            EditStatus::Failed { .. } => 0,
        }
    }
}

/// One entry in the edit chain. `edit_id` is `None` for the original upload
/// and for in-flight placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub image: ImagePayload,
    pub edit_id: Option<String>,
}

impl Variant {
    pub fn original(image: ImagePayload) -> Self {
        Self { image, edit_id: None }
    }

    /// Provisional slot holding a copy of the source image until the real
    /// result arrives.
    pub fn placeholder(image: ImagePayload) -> Self {
        Self { image, edit_id: None }
    }
}

// --- Wire types for the remote editing service ---

#[derive(Debug, Serialize)]
pub struct SubmitBody {
    pub prompt: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_edit_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub edit_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: String,
    pub processing_stage: Option<String>,
    pub message: Option<String>,
    pub progress_percent: Option<u8>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub is_error: bool,
    pub edited_image_url: Option<String>,
}

impl StatusResponse {
    /// Collapse the wire shape into the tagged status the session consumes.
    pub fn into_status(self) -> EditStatus {
        if self.is_error {
            return EditStatus::Failed {
                error: self.message.unwrap_or_default(),
            };
        }
        if self.is_complete {
            let image = match self.edited_image_url {
                Some(uri) if uri.starts_with("data:") => ImagePayload::DataUri(uri),
                Some(url) => ImagePayload::Url(url),
                None => {
                    return EditStatus::Failed {
                        error: "completed edit carried no image".into(),
                    }
                }
            };
            return EditStatus::Completed {
                image,
                message: self.message.unwrap_or_default(),
            };
        }
        EditStatus::Processing {
            stage: self.processing_stage.unwrap_or_else(|| "processing".into()),
            progress: self.progress_percent.unwrap_or(0).min(100),
            message: self.message.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PNG_HEADER: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D,
    ];

    #[test]
    fn bytes_round_trip_through_data_uri() {
        let payload = ImagePayload::Bytes {
            bytes: Bytes::from_static(PNG_HEADER),
            mime: "image/png".into(),
        };
        let uri = payload.to_data_uri().unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));
        let (bytes, mime) = ImagePayload::DataUri(uri).to_bytes().unwrap();
        assert_eq!(&bytes[..], PNG_HEADER);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn format_sniffing() {
        let png = ImagePayload::Bytes {
            bytes: Bytes::from_static(PNG_HEADER),
            mime: "image/png".into(),
        };
        assert_eq!(png.format(), ImageFormat::Png);

        let svg_b64 =
            base64::engine::general_purpose::STANDARD.encode("<svg xmlns=\"x\"></svg>");
        let svg = ImagePayload::DataUri(format!("data:image/svg+xml;base64,{svg_b64}"));
        assert_eq!(svg.format(), ImageFormat::Svg);

        let url = ImagePayload::Url("https://example.com/a.png".into());
        assert_eq!(url.format(), ImageFormat::Unknown);
    }

    #[test]
    fn validate_rejects_url_and_garbage() {
        assert!(ImagePayload::Url("https://example.com/a.png".into())
            .validate()
            .is_err());
        assert!(ImagePayload::DataUri("data:image/png;base64,!!!not-base64!!!".into())
            .validate()
            .is_err());
        let empty = ImagePayload::Bytes {
            bytes: Bytes::new(),
            mime: "image/png".into(),
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn submit_body_omits_absent_parent_id() {
        let body = SubmitBody {
            prompt: "brighten eyes".into(),
            image: "data:image/png;base64,AA==".into(),
            parent_edit_uuid: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("parent_edit_uuid").is_none());
        assert_eq!(json["prompt"], "brighten eyes");
    }

    #[test]
    fn status_response_parses_a_sparse_payload() {
        let resp: StatusResponse = serde_json::from_str(
            r#"{"status":"processing","processing_stage":"analyzing","is_complete":false,"is_error":false}"#,
        )
        .unwrap();
        let status = resp.into_status();
        assert_eq!(status.progress_percent(), 0);
        assert!(!status.is_terminal());

        let err: ErrorBody = serde_json::from_str(r#"{"detail":"image too large"}"#).unwrap();
        assert_eq!(err.detail, "image too large");
    }

    #[test]
    fn status_conversion_prefers_error_over_complete() {
        let resp = StatusResponse {
            status: "failed".into(),
            processing_stage: None,
            message: Some("unsupported prompt".into()),
            progress_percent: None,
            is_complete: true,
            is_error: true,
            edited_image_url: None,
        };
        assert_eq!(
            resp.into_status(),
            EditStatus::Failed {
                error: "unsupported prompt".into()
            }
        );
    }

    #[test]
    fn status_conversion_completed_needs_an_image() {
        let resp = StatusResponse {
            status: "completed".into(),
            processing_stage: None,
            message: None,
            progress_percent: Some(100),
            is_complete: true,
            is_error: false,
            edited_image_url: None,
        };
        assert!(matches!(resp.into_status(), EditStatus::Failed { .. }));
    }

    #[test]
    fn status_conversion_processing_defaults() {
        let resp = StatusResponse {
            status: "processing".into(),
            processing_stage: Some("analyzing".into()),
            message: Some("working".into()),
            progress_percent: Some(130),
            is_complete: false,
            is_error: false,
            edited_image_url: None,
        };
        let status = resp.into_status();
        assert_eq!(status.progress_percent(), 100); // clamped
        assert!(!status.is_terminal());
    }
}
