use async_trait::async_trait;

use crate::error::OtaError;
use crate::provider::ProviderLocation;

/// Mandatory fields extracted from a `QueryImageResponse` carrying
/// `UpdateAvailable`, per `ExtractUpdateDescription`.
#[derive(Debug, Clone)]
pub struct UpdateDescription {
    pub software_version: u32,
    pub image_uri: String,
    pub update_token: Vec<u8>,
}

/// The three outcomes `QueryImageResponse.status` can carry.
#[derive(Debug, Clone)]
pub enum QueryImageStatus {
    UpdateAvailable { software_version: u32, image_uri: String, update_token: Option<Vec<u8>> },
    Busy { delay_seconds: u32 },
    NotAvailable,
}

/// What to do next after an `ApplyUpdateResponse`.
#[derive(Debug, Clone, Copy)]
pub enum ApplyUpdateAction {
    Proceed,
    AwaitNextAction { delay_seconds: u32 },
    Discontinue,
}

/// State reported by the bulk downloader as a transfer progresses, mirroring
/// `OTADownloader::State` as observed through `BDXDownloader::StateDelegate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    InProgress,
    Complete,
    Cancelled,
    TimedOut,
    Error,
}

/// Application policy collaborator (C7): consent, apply timing, and the
/// handful of outcome notifications spec.md §6 lists under "Application
/// (produced)". Pure notification/decision calls, not I/O, so this stays a
/// plain synchronous trait rather than `async_trait` — it mirrors the
/// fabric-table's `FabricTableDelegate` in that respect.
pub trait OtaRequestorDriver: Send + Sync {
    /// Whether this update requires explicit user consent before downloading.
    fn requires_user_consent(&self, update: &UpdateDescription) -> bool;
    fn update_available(&self, update: &UpdateDescription);
    fn update_discontinued(&self);
    fn update_downloaded(&self);
    /// `ApplyUpdateAction::Proceed` hands off to this: the application's own
    /// apply path (staging the image, scheduling a reboot) takes over.
    fn begin_apply(&self);
    fn update_confirmation_required(&self, update: &UpdateDescription);
    /// Invoked with the delay hint from a `Busy` QueryImageResponse.
    fn provider_busy(&self, delay_seconds: u32);
    fn handle_error(&self, error: &OtaError, state_at_error: crate::state::OtaUpdateState);
}

/// Block-based bulk transfer engine (C8). Genuine I/O, so `async_trait`
/// following the teacher's `CertificateProvider` collaborator pattern.
/// Progress/completion is reported back through `DownloadStateDelegate`
/// rather than this trait's return value, matching the original's
/// callback-driven `BDXDownloader`.
#[async_trait]
pub trait BulkDownloader: Send + Sync {
    async fn begin(&self, uri: &str, update_token: &[u8], target_version: u32) -> Result<(), OtaError>;
    async fn cancel(&self) -> Result<(), OtaError>;
}

/// Notified by the downloader as a transfer progresses. The requestor
/// implements this itself, mirroring `OTARequestor : BDXDownloader::StateDelegate`.
pub trait DownloadStateDelegate: Send + Sync {
    fn on_download_state_changed(&mut self, state: DownloadState);
    fn on_progress_changed(&mut self, percent: Option<u8>);
}

/// Session establishment plus the QueryImage/ApplyUpdate/NotifyUpdateApplied
/// RPCs, standing in for the original's `CASESessionManager` +
/// `OperationalDeviceProxy` pair. Not named as its own bullet in spec.md §6,
/// but required to realize "Establish session" / "Send QueryImage" / "Send
/// ApplyUpdateRequest" / "Send NotifyUpdateApplied" from spec.md §4.3 — see
/// DESIGN.md. Genuine I/O, so `async_trait`.
#[async_trait]
pub trait ProviderMessenger: Send + Sync {
    async fn connect(&self, provider: ProviderLocation) -> Result<(), OtaError>;
    async fn send_query_image(&self, provider: ProviderLocation) -> Result<QueryImageStatus, OtaError>;
    async fn send_apply_update(&self, provider: ProviderLocation, update_token: &[u8], new_version: u32) -> Result<ApplyUpdateAction, OtaError>;
    async fn send_notify_update_applied(&self, provider: ProviderLocation, update_token: &[u8], software_version: u32) -> Result<(), OtaError>;
    async fn disconnect(&self, provider: ProviderLocation);
}

/// Lifecycle events the host's runtime can notify the requestor of, per
/// `add_event_handler` in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    CommissioningComplete,
}

/// Dispatch-thread scheduling primitive (consumed, per spec.md §6). Not
/// exercised directly by `OtaRequestor`'s own async methods (which already
/// run as ordinary futures on whatever executor the host provides) but kept
/// as the trait boundary a host implements to post requestor-driven work
/// (timers for `DelayedOnApply`/`Busy` retries) back onto its dispatch
/// thread, matching `PlatformMgr().ScheduleWork`.
pub trait Runtime: Send + Sync {
    fn schedule(&self, job: Box<dyn FnOnce() + Send>);
    fn add_event_handler(&mut self, handler: Box<dyn FnMut(LifecycleEvent) + Send>);
}
