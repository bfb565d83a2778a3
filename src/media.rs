//! Local media and display surfaces.
//!
//! Capture and rendering sit outside negotiation; the orchestrator only
//! acquires a handle, hands it to the local session, and tells the display
//! which stream belongs where.

use crate::error::MediaError;
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// What to capture
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        // video only
        Self {
            video: true,
            audio: false,
        }
    }
}

/// An acquired local (or received remote) stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub label: String,
    pub video: bool,
    pub audio: bool,
}

#[async_trait]
pub trait MediaCaptureProvider: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaError>;

    async fn release_media(&self, handle: &MediaHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceId {
    LocalVideo,
    RemoteVideo,
}

/// Sink for streams; never feeds back into negotiation
pub trait DisplaySurface: Send + Sync {
    fn attach_stream(&self, surface: SurfaceId, media: &MediaHandle);

    fn clear(&self, surface: SurfaceId);
}

/// Capture device that hands out synthetic handles.
///
/// Can be told to fail, which stands in for a missing or denied camera.
#[derive(Default)]
pub struct SyntheticCapture {
    inner: Mutex<CaptureState>,
}

#[derive(Default)]
struct CaptureState {
    fail_with: Option<String>,
    active: Vec<String>,
    acquired_total: usize,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent acquisitions fail with `reason` (None restores the device)
    pub fn set_failure(&self, reason: Option<&str>) {
        self.inner.lock().fail_with = reason.map(str::to_owned);
    }

    /// Handles acquired and not yet released
    pub fn active_handles(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn acquired_total(&self) -> usize {
        self.inner.lock().acquired_total
    }
}

#[async_trait]
impl MediaCaptureProvider for SyntheticCapture {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaError> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.fail_with {
            return Err(MediaError(reason.clone()));
        }
        if !constraints.video && !constraints.audio {
            return Err(MediaError("constraints request neither audio nor video".into()));
        }

        let handle = MediaHandle {
            id: random_id(),
            label: "synthetic camera".into(),
            video: constraints.video,
            audio: constraints.audio,
        };
        inner.active.push(handle.id.clone());
        inner.acquired_total += 1;
        info!(
            media_id = %handle.id,
            video = handle.video,
            audio = handle.audio,
            "Using synthetic capture device"
        );
        Ok(handle)
    }

    async fn release_media(&self, handle: &MediaHandle) {
        let mut inner = self.inner.lock();
        inner.active.retain(|id| id != &handle.id);
        debug!(media_id = %handle.id, "Released local media");
    }
}

/// Display that logs attachments and remembers what is shown where
#[derive(Default)]
pub struct LogDisplay {
    attached: Mutex<HashMap<SurfaceId, MediaHandle>>,
}

impl LogDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn showing(&self, surface: SurfaceId) -> Option<MediaHandle> {
        self.attached.lock().get(&surface).cloned()
    }
}

impl DisplaySurface for LogDisplay {
    fn attach_stream(&self, surface: SurfaceId, media: &MediaHandle) {
        info!(?surface, media_id = %media.id, label = %media.label, "Stream attached");
        self.attached.lock().insert(surface, media.clone());
    }

    fn clear(&self, surface: SurfaceId) {
        if self.attached.lock().remove(&surface).is_some() {
            debug!(?surface, "Surface cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthetic_capture_tracks_handles() {
        let capture = SyntheticCapture::new();
        let h = capture
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap();
        assert!(h.video);
        assert!(!h.audio);
        assert_eq!(capture.active_handles(), 1);

        capture.release_media(&h).await;
        assert_eq!(capture.active_handles(), 0);
        assert_eq!(capture.acquired_total(), 1);
    }

    #[tokio::test]
    async fn synthetic_capture_can_fail() {
        let capture = SyntheticCapture::new();
        capture.set_failure(Some("NotAllowedError"));
        let err = capture
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.0, "NotAllowedError");

        capture.set_failure(None);
        assert!(capture
            .acquire_local_media(&MediaConstraints::default())
            .await
            .is_ok());
    }

    #[test]
    fn display_remembers_and_clears() {
        let display = LogDisplay::new();
        let h = MediaHandle {
            id: "m1".into(),
            label: "cam".into(),
            video: true,
            audio: false,
        };
        display.attach_stream(SurfaceId::LocalVideo, &h);
        assert_eq!(display.showing(SurfaceId::LocalVideo), Some(h));
        display.clear(SurfaceId::LocalVideo);
        assert!(display.showing(SurfaceId::LocalVideo).is_none());
    }
}
