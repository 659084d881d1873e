use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use photoedit::{
    Banner, EditService, EditSession, EditSimulator, ImagePayload, RemoteEditService,
};
use tracing_subscriber::{fmt, EnvFilter};

/// One edit round-trip from the command line:
/// `photoedit <image-path> <prompt>`. Talks to the service at
/// `EDIT_API_BASE` (with `EDIT_API_KEY`), or to a local simulator when the
/// variable is unset.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let mut args = std::env::args().skip(1);
    let (path, prompt) = match (args.next(), args.next()) {
        (Some(path), Some(prompt)) => (path, prompt),
        _ => bail!("usage: photoedit <image-path> <prompt>"),
    };

    let service: Arc<dyn EditService> = match std::env::var("EDIT_API_BASE") {
        Ok(base) => {
            let api_key = std::env::var("EDIT_API_KEY").unwrap_or_default();
            tracing::info!(base = %base, "using remote editing service");
            Arc::new(RemoteEditService::new(base, api_key))
        }
        Err(_) => {
            tracing::info!("EDIT_API_BASE not set - using local mock editing service");
            Arc::new(EditSimulator::new())
        }
    };

    let bytes = std::fs::read(&path).with_context(|| format!("reading {path}"))?;
    let mime = match path.rsplit('.').next() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "image/png",
    };
    let image = ImagePayload::Bytes {
        bytes: bytes.into(),
        mime: mime.to_string(),
    };

    let session = EditSession::new(service);
    session.load_original(image);

    let handle = session.submit(&prompt).await?;
    tracing::info!(handle = %handle, prompt = %prompt, "edit submitted");

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let snap = session.snapshot();
        match snap.banner {
            Some(Banner::Processing {
                stage, progress, ..
            }) => tracing::info!(stage = %stage, progress, "processing"),
            Some(Banner::Failed { message }) => bail!("edit failed: {message}"),
            None => {}
        }
        if !snap.busy {
            break;
        }
    }

    let snap = session.snapshot();
    let result = &snap.chain[snap.current_index];
    tracing::info!(
        variants = snap.chain.len(),
        image = %result.image.preview(),
        "edit complete"
    );

    if let Some((bytes, mime)) = result.image.to_bytes() {
        let ext = match mime.as_str() {
            "image/jpeg" => "jpg",
            "image/svg+xml" => "svg",
            _ => "png",
        };
        let out = format!("edited.{ext}");
        std::fs::write(&out, &bytes).with_context(|| format!("writing {out}"))?;
        tracing::info!(path = %out, "result saved");
    }
    Ok(())
}
