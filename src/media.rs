//! Local media capture, modeled as a capability that can succeed or fail.
//!
//! The physical device layer lives outside this crate; it implements
//! [`MediaSource`] and hands back a [`LocalMedia`] handle. The handle is
//! exclusively owned by one call attempt and released exactly once by the
//! call teardown path, whichever exit is taken.

use crate::types::call::CallType;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    /// The user refused capture permission.
    #[error("capture permission denied")]
    AccessDenied,

    /// The device exists but could not be opened.
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

/// Provider of local audio/video capture.
///
/// `acquire` may await indefinitely on a user permission prompt; callers must
/// re-check call state after it resolves, since the call can be torn down
/// while the prompt is open.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, call_type: CallType) -> Result<Arc<LocalMedia>, MediaError>;
}

/// Handle to one local capture (an audio track, plus a video track for video
/// calls).
///
/// Mute and video flags are pure local state; toggling them produces no
/// signaling traffic.
pub struct LocalMedia {
    call_type: CallType,
    muted: AtomicBool,
    video_off: AtomicBool,
    released: AtomicBool,
}

impl LocalMedia {
    pub fn new(call_type: CallType) -> Arc<Self> {
        Arc::new(Self {
            call_type,
            muted: AtomicBool::new(false),
            // audio calls have no video track to enable
            video_off: AtomicBool::new(!call_type.has_video()),
            released: AtomicBool::new(false),
        })
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn has_video(&self) -> bool {
        self.call_type.has_video()
    }

    /// Flip the audio track's enabled flag. Returns the new muted state.
    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Relaxed)
    }

    /// Flip the video track's enabled flag. Returns the new off state.
    pub fn toggle_video(&self) -> bool {
        !self.video_off.fetch_xor(true, Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Relaxed)
    }

    pub fn is_video_off(&self) -> bool {
        self.video_off.load(Relaxed)
    }

    /// Release the capture. Idempotent; returns true only for the call that
    /// actually performed the release.
    pub fn release(&self) -> bool {
        !self.released.swap(true, Relaxed)
    }

    /// Whether the capture is still active.
    pub fn is_capturing(&self) -> bool {
        !self.released.load(Relaxed)
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("call_type", &self.call_type)
            .field("muted", &self.is_muted())
            .field("video_off", &self.is_video_off())
            .field("capturing", &self.is_capturing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_mute_twice_restores_state() {
        let media = LocalMedia::new(CallType::Audio);
        assert!(!media.is_muted());
        assert!(media.toggle_mute());
        assert!(!media.toggle_mute());
        assert!(!media.is_muted());
    }

    #[test]
    fn test_audio_call_starts_with_video_off() {
        let audio = LocalMedia::new(CallType::Audio);
        assert!(audio.is_video_off());

        let video = LocalMedia::new(CallType::Video);
        assert!(!video.is_video_off());
        assert!(video.toggle_video());
        assert!(video.is_video_off());
    }

    #[test]
    fn test_release_is_idempotent() {
        let media = LocalMedia::new(CallType::Audio);
        assert!(media.is_capturing());
        assert!(media.release());
        assert!(!media.release());
        assert!(!media.is_capturing());
    }
}
