use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::models::{EditHandle, EditRequest, EditStatus, ImagePayload, Variant};
use crate::service::{EditError, EditService};

const GENERIC_UPLOAD_ERROR: &str = "The edit could not be submitted.";
const GENERIC_EDIT_ERROR: &str = "The edit failed.";
const CONNECTION_LOST: &str = "Connection lost. Processing stopped.";

/// Timing constants of the state machine; defaults are the production
/// values, tests shrink them.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub max_submit_attempts: u32,
    pub upload_error_ttl: Duration,
    pub edit_error_ttl: Duration,
    pub nav_throttle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            backoff_base: Duration::from_millis(1500),
            max_submit_attempts: 3,
            upload_error_ttl: Duration::from_secs(8),
            edit_error_ttl: Duration::from_secs(5),
            nav_throttle: Duration::from_millis(100),
        }
    }
}

// All transitions go through the session itself; no out-of-band flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Submitting,
    Polling(EditHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Banner {
    Processing {
        stage: String,
        progress: u8,
        message: String,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Prev,
    Next,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub chain: Vec<Variant>,
    pub current_index: usize,
    pub prompt_text: String,
    pub banner: Option<Banner>,
    pub busy: bool,
}

struct Inner {
    chain: Vec<Variant>,
    current_index: usize,
    prompt_text: String,
    prompt_history: HashMap<usize, String>,
    current_edit_id: Option<String>,
    phase: Phase,
    /// Slot the in-flight placeholder occupies, if any.
    pending_index: Option<usize>,
    /// Bumped on every submission start and every reset. Tasks born under an
    /// older epoch must not mutate state.
    epoch: u64,
    banner: Option<Banner>,
    banner_epoch: u64,
    last_nav: Option<Instant>,
    poll_task: Option<JoinHandle<()>>,
    banner_task: Option<JoinHandle<()>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            chain: Vec::new(),
            current_index: 0,
            prompt_text: String::new(),
            prompt_history: HashMap::new(),
            current_edit_id: None,
            phase: Phase::Idle,
            pending_index: None,
            epoch: 0,
            banner: None,
            banner_epoch: 0,
            last_nav: None,
            poll_task: None,
            banner_task: None,
        }
    }

    fn teardown(&mut self) {
        self.epoch += 1;
        self.banner_epoch += 1;
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        if let Some(task) = self.banner_task.take() {
            task.abort();
        }
        self.chain.clear();
        self.prompt_history.clear();
        self.prompt_text.clear();
        self.current_edit_id = None;
        self.pending_index = None;
        self.current_index = 0;
        self.banner = None;
        self.phase = Phase::Idle;
        self.last_nav = None;
    }
}

/// Client-side orchestrator for one editing session: at most one in-flight
/// submission, throttle retry, polling to a terminal state, and chain
/// bookkeeping through every failure path.
pub struct EditSession {
    service: Arc<dyn EditService>,
    config: SessionConfig,
    client: reqwest::Client,
    inner: Arc<Mutex<Inner>>,
}

impl EditSession {
    pub fn new(service: Arc<dyn EditService>) -> Self {
        Self::with_config(service, SessionConfig::default())
    }

    pub fn with_config(service: Arc<dyn EditService>, config: SessionConfig) -> Self {
        Self {
            service,
            config,
            client: reqwest::Client::new(),
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Seeds the chain with the original upload, discarding prior content.
    pub fn load_original(&self, image: ImagePayload) {
        let mut inner = self.inner.lock();
        inner.teardown();
        info!(image = %image.preview(), "session started with original upload");
        inner.chain.push(Variant::original(image));
    }

    /// Submits an edit of the currently visible variant. Rejected while a
    /// previous submission is still in flight. On success the session is
    /// already polling when this returns.
    pub async fn submit(&self, prompt: &str) -> Result<EditHandle, EditError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EditError::EmptyPrompt);
        }

        let (source, parent, epoch) = {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::Idle {
                return Err(EditError::AlreadySubmitting);
            }
            if inner.chain.is_empty() {
                return Err(EditError::NoSourceImage);
            }
            let source_index = inner.current_index.min(inner.chain.len() - 1);
            let source = inner.chain[source_index].image.clone();
            let parent = inner.current_edit_id.clone();

            inner.epoch += 1;
            let epoch = inner.epoch;
            inner.prompt_history.insert(source_index, prompt.to_string());
            inner.chain.push(Variant::placeholder(source.clone()));
            inner.current_index = inner.chain.len() - 1;
            inner.pending_index = Some(inner.current_index);
            inner.phase = Phase::Submitting;
            // A clear task scheduled for an earlier failure banner must not
            // fire into this submission.
            inner.banner_epoch += 1;
            if let Some(task) = inner.banner_task.take() {
                task.abort();
            }
            inner.banner = Some(Banner::Processing {
                stage: "initializing".into(),
                progress: 0,
                message: "Submitting edit...".into(),
            });
            (source, parent, epoch)
        };

        let source = match source.ensure_embedded(&self.client).await {
            Ok(source) => source,
            Err(e) => {
                fail_pending(
                    &self.inner,
                    epoch,
                    GENERIC_UPLOAD_ERROR.into(),
                    self.config.upload_error_ttl,
                );
                return Err(EditError::UploadFailed(e.to_string()));
            }
        };

        let request = EditRequest {
            prompt: prompt.to_string(),
            image: source,
            parent_edit_id: parent,
        };

        let mut attempt = 0u32;
        let receipt = loop {
            attempt += 1;
            match self.service.submit(&request).await {
                Ok(receipt) => break receipt,
                Err(EditError::Throttled { retry_after })
                    if attempt < self.config.max_submit_attempts =>
                {
                    let wait = retry_after
                        .unwrap_or_else(|| self.config.backoff_base * 2u32.pow(attempt - 1));
                    info!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "throttled, backing off before retry"
                    );
                    sleep(wait).await;
                }
                Err(EditError::Throttled { .. }) => {
                    warn!(attempt, "throttle retries exhausted");
                    let message = "The editing service is busy. Please try again.".to_string();
                    fail_pending(
                        &self.inner,
                        epoch,
                        message.clone(),
                        self.config.upload_error_ttl,
                    );
                    return Err(EditError::UploadFailed(message));
                }
                Err(e) => {
                    let message = match &e {
                        EditError::UploadFailed(detail) if !detail.is_empty() => detail.clone(),
                        _ => GENERIC_UPLOAD_ERROR.to_string(),
                    };
                    fail_pending(
                        &self.inner,
                        epoch,
                        message.clone(),
                        self.config.upload_error_ttl,
                    );
                    return Err(EditError::UploadFailed(message));
                }
            }
        };

        let handle = receipt.handle.clone();
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                // Session was reset while the submission was in flight.
                return Err(EditError::Cancelled);
            }
            inner.phase = Phase::Polling(handle.clone());
            let task = tokio::spawn(poll_loop(
                Arc::clone(&self.service),
                self.client.clone(),
                self.config.clone(),
                Arc::clone(&self.inner),
                handle.clone(),
                epoch,
            ));
            inner.poll_task = Some(task);
        }
        info!(handle = %handle, "edit submitted, polling for result");
        Ok(handle)
    }

    /// Cyclic navigation over the chain; allowed while an edit is in flight.
    pub fn navigate(&self, direction: Direction) -> usize {
        let mut inner = self.inner.lock();
        if inner.chain.is_empty() {
            return 0;
        }
        let now = Instant::now();
        if let Some(last) = inner.last_nav {
            if now.duration_since(last) < self.config.nav_throttle {
                return inner.current_index;
            }
        }
        inner.last_nav = Some(now);
        let len = inner.chain.len();
        inner.current_index = match direction {
            Direction::Next => (inner.current_index + 1) % len,
            Direction::Prev => (inner.current_index + len - 1) % len,
        };
        inner.prompt_text = inner
            .prompt_history
            .get(&inner.current_index)
            .cloned()
            .unwrap_or_default();
        inner.current_index
    }

    pub fn set_prompt(&self, text: &str) {
        self.inner.lock().prompt_text = text.to_string();
    }

    /// Back to the initial empty state; no scheduled tick survives this.
    pub fn reset(&self) {
        self.inner.lock().teardown();
        info!("session reset");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            chain: inner.chain.clone(),
            current_index: inner.current_index,
            prompt_text: inner.prompt_text.clone(),
            banner: inner.banner.clone(),
            busy: inner.phase != Phase::Idle,
        }
    }
}

// Rolls the placeholder back and shows a timed failure banner. No-op when
// `epoch` is stale.
fn fail_pending(inner: &Arc<Mutex<Inner>>, epoch: u64, message: String, ttl: Duration) {
    let mut guard = inner.lock();
    if guard.epoch != epoch {
        return;
    }
    if let Some(index) = guard.pending_index.take() {
        if index < guard.chain.len() {
            guard.chain.remove(index);
        }
        guard.current_index = guard.chain.len().saturating_sub(1);
    }
    guard.phase = Phase::Idle;
    guard.poll_task = None;
    show_failure_banner(&mut guard, inner, message, ttl);
}

// Caller holds the lock.
fn show_failure_banner(
    guard: &mut parking_lot::MutexGuard<'_, Inner>,
    inner: &Arc<Mutex<Inner>>,
    message: String,
    ttl: Duration,
) {
    guard.banner = Some(Banner::Failed { message });
    guard.banner_epoch += 1;
    let banner_epoch = guard.banner_epoch;
    if let Some(task) = guard.banner_task.take() {
        task.abort();
    }
    let inner = Arc::clone(inner);
    guard.banner_task = Some(tokio::spawn(async move {
        sleep(ttl).await;
        let mut guard = inner.lock();
        if guard.banner_epoch == banner_epoch {
            guard.banner = None;
        }
    }));
}

/// Drives one handle to a terminal state on a fixed interval. The epoch is
/// checked before each request and again before acting on its response, so a
/// stale response from an abandoned handle never mutates newer state.
async fn poll_loop(
    service: Arc<dyn EditService>,
    client: reqwest::Client,
    config: SessionConfig,
    inner: Arc<Mutex<Inner>>,
    handle: EditHandle,
    epoch: u64,
) {
    loop {
        sleep(config.poll_interval).await;
        if inner.lock().epoch != epoch {
            return;
        }
        let status = service.status(&handle).await;
        if inner.lock().epoch != epoch {
            return;
        }
        match status {
            Err(e) => {
                // No retry on a transport failure while polling.
                warn!(handle = %handle, error = %e, "status poll failed, stopping");
                fail_pending(&inner, epoch, CONNECTION_LOST.into(), config.edit_error_ttl);
                return;
            }
            Ok(EditStatus::Failed { error }) => {
                let message = if error.is_empty() {
                    GENERIC_EDIT_ERROR.to_string()
                } else {
                    error
                };
                info!(handle = %handle, message = %message, "edit failed");
                fail_pending(&inner, epoch, message, config.edit_error_ttl);
                return;
            }
            Ok(EditStatus::Completed { image, .. }) => {
                // Preload and validate before touching the chain, so the
                // placeholder is only replaced by a renderable image.
                let image = match image.ensure_embedded(&client).await {
                    Ok(image) => image,
                    Err(e) => {
                        warn!(handle = %handle, error = %e, "result image fetch failed");
                        fail_pending(&inner, epoch, CONNECTION_LOST.into(), config.edit_error_ttl);
                        return;
                    }
                };
                if let Err(e) = image.validate() {
                    warn!(handle = %handle, error = %e, "result image rejected");
                    fail_pending(&inner, epoch, CONNECTION_LOST.into(), config.edit_error_ttl);
                    return;
                }
                let mut guard = inner.lock();
                if guard.epoch != epoch {
                    return;
                }
                if let Some(index) = guard.pending_index.take() {
                    info!(handle = %handle, image = %image.preview(), "edit completed");
                    guard.chain[index] = Variant {
                        image,
                        edit_id: Some(handle.as_str().to_string()),
                    };
                    guard.current_index = index;
                }
                guard.current_edit_id = Some(handle.as_str().to_string());
                guard.prompt_text.clear();
                guard.banner = None;
                guard.phase = Phase::Idle;
                guard.poll_task = None;
                return;
            }
            Ok(EditStatus::Processing {
                stage,
                progress,
                message,
            }) => {
                let mut guard = inner.lock();
                if guard.epoch != epoch {
                    return;
                }
                // Displayed progress never regresses.
                let shown = match &guard.banner {
                    Some(Banner::Processing { progress: prev, .. }) => progress.max(*prev),
                    _ => progress,
                };
                guard.banner = Some(Banner::Processing {
                    stage,
                    progress: shown,
                    message,
                });
            }
        }
    }
}
