use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};

use crate::models::{EditHandle, EditRequest, EditStatus, ImagePayload, SubmitReceipt};
use crate::service::{EditError, EditService};

const STAGES: [&str; 4] = ["initializing", "analyzing", "processing", "finalizing"];

/// Timing knobs; defaults match the real service's observed latency. Tests
/// shrink these.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub min_completion: Duration,
    pub max_completion: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            min_completion: Duration::from_secs(2),
            max_completion: Duration::from_secs(5),
        }
    }
}

struct SimJob {
    prompt: String,
    progress: u8,
    complete: bool,
    // Chosen once at acceptance so repeated polls resolve to the same image.
    result: ImagePayload,
}

/// In-memory stand-in for the remote editing service. Construct one per
/// consumer; the job table is owned by the instance, not process-wide.
#[derive(Clone)]
pub struct EditSimulator {
    jobs: Arc<Mutex<HashMap<String, SimJob>>>,
    config: SimulatorConfig,
}

impl EditSimulator {
    pub fn new() -> Self {
        Self::with_config(SimulatorConfig::default())
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Registers a job and schedules its background completion. The handle is
    /// unique per submission; unguessability is not a goal.
    pub fn accept_submission(&self, prompt: &str, _image: &ImagePayload) -> EditHandle {
        let key = format!(
            "mock-{}-{:08x}",
            Utc::now().timestamp_millis(),
            rand::thread_rng().gen::<u32>()
        );
        let pool = sample_images();
        let pick = rand::thread_rng().gen_range(0..pool.len());
        let delay = random_delay(&self.config);

        self.jobs.lock().insert(
            key.clone(),
            SimJob {
                prompt: prompt.to_string(),
                progress: 0,
                complete: false,
                result: pool[pick].clone(),
            },
        );
        info!(handle = %key, prompt = %prompt, delay_ms = delay.as_millis() as u64, "mock edit accepted");

        // Completes on its own even if nobody polls.
        let jobs = Arc::clone(&self.jobs);
        let timer_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(job) = jobs.lock().get_mut(&timer_key) {
                job.progress = 100;
                job.complete = true;
                debug!(handle = %timer_key, "mock edit completed by timer");
            }
        });

        EditHandle::new(key)
    }

    /// Progress also advances per query, so a fast poller can reach 100
    /// before the timer fires; whichever path gets there first wins.
    pub fn query_status(&self, handle: &EditHandle) -> EditStatus {
        let mut jobs = self.jobs.lock();
        let job = match jobs.get_mut(handle.as_str()) {
            Some(job) => job,
            None => {
                return EditStatus::Failed {
                    error: format!("job not found: {handle}"),
                }
            }
        };
        if job.complete {
            debug!(handle = %handle, prompt = %job.prompt, "mock edit already complete");
            return EditStatus::Completed {
                image: job.result.clone(),
                message: "Mock edit complete".into(),
            };
        }
        let increment: u8 = rand::thread_rng().gen_range(0..=25);
        job.progress = job.progress.saturating_add(increment).min(100);
        if job.progress >= 100 {
            job.complete = true;
        }
        let stage = STAGES[((job.progress / 25) as usize).min(STAGES.len() - 1)];
        EditStatus::Processing {
            stage: stage.to_string(),
            progress: job.progress,
            message: format!("Mock {stage}..."),
        }
    }

    /// Drops the job entry. No-op for unknown or already-removed handles.
    pub fn cleanup(&self, handle: &EditHandle) {
        self.jobs.lock().remove(handle.as_str());
    }

    #[cfg(test)]
    fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl Default for EditSimulator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EditService for EditSimulator {
    async fn submit(&self, request: &EditRequest) -> Result<SubmitReceipt, EditError> {
        if request.prompt.trim().is_empty() {
            return Err(EditError::UploadFailed("prompt must not be empty".into()));
        }
        if !request.image.is_embedded() {
            return Err(EditError::InvalidImage("source image not embedded".into()));
        }
        let handle = self.accept_submission(&request.prompt, &request.image);
        Ok(SubmitReceipt {
            handle,
            message: "Mock edit accepted".into(),
        })
    }

    async fn status(&self, handle: &EditHandle) -> Result<EditStatus, EditError> {
        Ok(self.query_status(handle))
    }
}

fn random_delay(config: &SimulatorConfig) -> Duration {
    if config.max_completion <= config.min_completion {
        return config.min_completion;
    }
    let span = (config.max_completion - config.min_completion).as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..=span);
    config.min_completion + Duration::from_millis(offset)
}

/// Fixed pool of sample result images: small generated SVGs carried as
/// base64 data URIs.
fn sample_images() -> Vec<ImagePayload> {
    ["#3B82F6", "#EF4444", "#10B981", "#F59E0B", "#8B5CF6"]
        .iter()
        .map(|color| {
            let svg = format!(
                r##"<svg width="400" height="300" xmlns="http://www.w3.org/2000/svg">
    <rect width="400" height="300" fill="{color}" />
    <text x="200" y="150" font-family="Arial, sans-serif" font-size="20"
          text-anchor="middle" fill="white">Edited photo</text>
</svg>"##
            );
            ImagePayload::DataUri(format!(
                "data:image/svg+xml;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(svg.as_bytes())
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageFormat;
    use pretty_assertions::assert_eq;

    fn source_image() -> ImagePayload {
        ImagePayload::DataUri("data:image/png;base64,iVBORw0KGgoAAAANSUhEUg==".into())
    }

    fn fast_simulator() -> EditSimulator {
        EditSimulator::with_config(SimulatorConfig {
            min_completion: Duration::from_millis(200),
            max_completion: Duration::from_millis(500),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_monotone_and_completion_sticks() {
        let sim = fast_simulator();
        let handle = sim.accept_submission("brighten eyes", &source_image());

        let mut last = 0u8;
        let mut completed_image = None;
        for _ in 0..60 {
            match sim.query_status(&handle) {
                EditStatus::Processing { progress, stage, .. } => {
                    assert!(progress >= last, "progress regressed: {last} -> {progress}");
                    assert!(STAGES.contains(&stage.as_str()));
                    last = progress;
                }
                EditStatus::Completed { image, .. } => {
                    assert_eq!(sim.query_status(&handle).progress_percent(), 100);
                    completed_image = Some(image);
                    break;
                }
                EditStatus::Failed { error } => panic!("unexpected failure: {error}"),
            }
        }
        let first = completed_image.expect("job never completed");

        // Completion and the chosen result are stable across further polls.
        match sim.query_status(&handle) {
            EditStatus::Completed { image, .. } => assert_eq!(image, first),
            other => panic!("completion did not stick: {other:?}"),
        }
        assert_eq!(first.format(), ImageFormat::Svg);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_completes_an_unpolled_job() {
        let sim = fast_simulator();
        let handle = sim.accept_submission("remove background", &source_image());

        tokio::time::sleep(Duration::from_secs(1)).await;
        match sim.query_status(&handle) {
            EditStatus::Completed { .. } => {}
            other => panic!("expected timer completion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handles_are_unique() {
        let sim = fast_simulator();
        let a = sim.accept_submission("one", &source_image());
        let b = sim.accept_submission("two", &source_image());
        assert_ne!(a, b);
        assert_eq!(sim.job_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_handle_is_a_failed_status() {
        let sim = fast_simulator();
        let status = sim.query_status(&EditHandle::new("mock-missing"));
        assert!(matches!(status, EditStatus::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_is_idempotent() {
        let sim = fast_simulator();
        let handle = sim.accept_submission("one", &source_image());
        sim.cleanup(&handle);
        sim.cleanup(&handle); // no-op, not an error
        assert_eq!(sim.job_count(), 0);
        assert!(matches!(
            sim.query_status(&handle),
            EditStatus::Failed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_empty_prompt_and_unembedded_image() {
        let sim = fast_simulator();
        let bad_prompt = EditRequest {
            prompt: "  ".into(),
            image: source_image(),
            parent_edit_id: None,
        };
        assert!(matches!(
            sim.submit(&bad_prompt).await,
            Err(EditError::UploadFailed(_))
        ));

        let bad_image = EditRequest {
            prompt: "brighten eyes".into(),
            image: ImagePayload::Url("https://example.com/a.png".into()),
            parent_edit_id: None,
        };
        assert!(matches!(
            sim.submit(&bad_image).await,
            Err(EditError::InvalidImage(_))
        ));
    }
}
