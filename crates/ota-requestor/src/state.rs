use std::fmt;

use crate::error::OtaError;

/// Mirrors `OTAUpdateStateEnum`. `DownloadInProgress` is the state entered
/// the moment a download is kicked off (the downloader's `begin()` has been
/// called but no progress event has arrived yet); `Downloading` is entered
/// once the downloader reports its first `InProgress` event. Both must be
/// passed through on the way to `Applying` (spec.md §8 invariant 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OtaUpdateState {
    Unknown,
    Idle,
    Querying,
    DownloadInProgress,
    DelayedOnUserConsent,
    Downloading,
    Applying,
    DelayedOnApply,
    RollingBack,
}

impl fmt::Display for OtaUpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reason carried on every `StateTransition` event, mirroring
/// `OTAChangeReasonEnum` plus the handful of additional causes this crate
/// needs to explain a return to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Success,
    Failure,
    TimedOut,
    DelayByProvider,
    UserConsentNeeded,
    Cancelled,
}

/// Emitted on every state change; a host wires this to the cluster's
/// `StateTransition` event and the `update_state_progress` attribute.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub previous: OtaUpdateState,
    pub new: OtaUpdateState,
    pub reason: TransitionReason,
    pub last_error: Option<String>,
}

/// Tags a session connection attempt with what should happen once it
/// succeeds or fails, exactly as the original's `mOnConnectedAction` field.
/// `cancel_image_update()` clears this so a late `on_connected` /
/// `on_connection_failure` callback finds no matching action and is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedAction {
    QueryImage,
    ApplyUpdate,
    NotifyUpdateApplied,
}

/// Maps a failure to the `TransitionReason` recorded when the requestor
/// falls back to `Idle`, mirroring `MapErrorToIdleStateReason`.
pub fn map_error_to_idle_state_reason(error: &OtaError) -> TransitionReason {
    match error {
        OtaError::Timeout => TransitionReason::TimedOut,
        OtaError::Busy => TransitionReason::DelayByProvider,
        _ => TransitionReason::Failure,
    }
}
