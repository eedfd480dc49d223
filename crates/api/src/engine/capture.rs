//! The capture-processing lane.
//!
//! Converts a target's raw capture into the engine's hash input with the
//! external converter. On success the target is ready with the converted
//! artifact; on failure it is marked failed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crackq_core::path_safety::{validate, PathError, PathPolicy};
use crackq_core::types::DbId;
use crackq_db::models::queue::QueueItem;
use crackq_db::models::status::TargetStatus;
use crackq_db::models::target::Target;
use crackq_db::store::Store;
use crackq_events::{EventBus, NotificationKind, NotificationRequest};
use serde_json::json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::lanes::{HandlerOutcome, LaneHandler};
use crate::config::EngineConfig;

/// Raw capture extensions the converter accepts.
pub const CAPTURE_EXTENSIONS: &[&str] = &["pcap", "pcapng", "cap"];

/// File name of a target's converted hash input, relative to the capture
/// directory.
pub fn artifact_name(target_id: DbId) -> String {
    format!("target-{target_id}.hc22000")
}

#[derive(Debug, thiserror::Error)]
enum ConvertError {
    #[error("target has no raw capture")]
    NoCapture,

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("failed to run converter: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("converter failed: {0}")]
    Converter(String),
}

pub struct CaptureLane {
    store: Arc<dyn Store>,
    event_bus: Arc<EventBus>,
    converter: PathBuf,
    capture_dir: PathBuf,
}

impl CaptureLane {
    pub fn new(store: Arc<dyn Store>, event_bus: Arc<EventBus>, engine: &EngineConfig) -> Self {
        Self {
            store,
            event_bus,
            converter: engine.converter_bin.clone(),
            capture_dir: engine.capture_dir.clone(),
        }
    }

    /// Returns the artifact name, or `None` if shutdown interrupted the run.
    async fn convert(
        &self,
        target: &Target,
        shutdown: &CancellationToken,
    ) -> Result<Option<String>, ConvertError> {
        let raw = target.capture_path.as_deref().ok_or(ConvertError::NoCapture)?;
        let input = validate(
            Path::new(raw),
            &PathPolicy::input(&self.capture_dir, CAPTURE_EXTENSIONS),
        )?;
        let name = artifact_name(target.id);
        let output = validate(Path::new(&name), &PathPolicy::output(&self.capture_dir))?;

        let child = Command::new(&self.converter)
            .arg("-o")
            .arg(&output)
            .arg(&input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let result = tokio::select! {
            result = child.wait_with_output() => result?,
            // Dropping the child kills the converter.
            _ = shutdown.cancelled() => return Ok(None),
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            return Err(ConvertError::Converter(if stderr.is_empty() {
                format!("exit status {}", result.status)
            } else {
                stderr
            }));
        }

        let produced = tokio::fs::metadata(&output)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !produced {
            return Err(ConvertError::Converter(
                "no usable handshakes in capture".to_string(),
            ));
        }
        Ok(Some(name))
    }
}

#[async_trait]
impl LaneHandler for CaptureLane {
    async fn handle(&self, item: &QueueItem, shutdown: &CancellationToken) -> HandlerOutcome {
        let target_id = item.subject_id;
        let target = match self.store.find_target(target_id).await {
            Ok(Some(target)) if target.owner_id == item.owner_id => target,
            Ok(_) => {
                tracing::warn!(target_id, owner_id = item.owner_id, "Queued target not found");
                return HandlerOutcome::Done;
            }
            Err(e) => {
                tracing::error!(target_id, error = %e, "Failed to load target");
                return HandlerOutcome::Retry(Duration::from_secs(5));
            }
        };

        if let Err(e) = self
            .store
            .set_target_status(target_id, TargetStatus::Processing)
            .await
        {
            tracing::error!(target_id, error = %e, "Failed to mark target processing");
            return HandlerOutcome::Retry(Duration::from_secs(5));
        }

        let settled = match self.convert(&target, shutdown).await {
            Ok(Some(artifact)) => {
                let stored = self.store.set_artifact(target_id, &artifact).await;
                if stored.is_ok() {
                    tracing::info!(target_id, artifact = %artifact, "Capture processed");
                    self.event_bus.notify(
                        NotificationRequest::new(
                            NotificationKind::CaptureProcessed,
                            target.owner_id,
                            target_id,
                        )
                        .with_payload(json!({ "name": target.name })),
                    );
                }
                stored
            }
            Ok(None) => {
                tracing::info!(target_id, "Shutting down, capture conversion abandoned");
                if let Err(e) = self
                    .store
                    .set_target_status(target_id, TargetStatus::Ready)
                    .await
                {
                    tracing::warn!(target_id, error = %e, "Failed to release target on shutdown");
                }
                return HandlerOutcome::Retry(Duration::ZERO);
            }
            Err(e) => {
                tracing::warn!(target_id, error = %e, "Capture processing failed");
                self.store
                    .set_target_status(target_id, TargetStatus::Failed)
                    .await
            }
        };

        if let Err(e) = settled {
            tracing::error!(target_id, error = %e, "Failed to record capture result");
        }
        HandlerOutcome::Done
    }
}
