use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use device_storage::InMemoryStorage;
use fabric_ids::{FabricIndex, NodeId};
use ota_requestor::{
    ApplyUpdateAction, BulkDownloader, DownloadState, DownloadStateDelegate, OtaError,
    OtaRequestor, OtaRequestorDriver, OtaUpdateState, ProviderLocation, ProviderMessenger,
    QueryImageStatus, UpdateDescription,
};

#[derive(Default)]
struct DriverState {
    update_available: Mutex<Vec<UpdateDescription>>,
    discontinued: Mutex<u32>,
    downloaded: Mutex<u32>,
    begin_apply_calls: Mutex<u32>,
    confirmation_required: Mutex<u32>,
    busy_delays: Mutex<Vec<u32>>,
    errors: Mutex<Vec<String>>,
}

/// Shares `DriverState` between the boxed trait object handed to the
/// requestor and the test's own assertions, the same way the fabric table's
/// tests share a recording delegate via `Arc`.
#[derive(Clone, Default)]
struct DriverHandle(Arc<DriverState>);

impl OtaRequestorDriver for DriverHandle {
    fn requires_user_consent(&self, _update: &UpdateDescription) -> bool {
        false
    }
    fn update_available(&self, update: &UpdateDescription) {
        self.0.update_available.lock().unwrap().push(update.clone());
    }
    fn update_discontinued(&self) {
        *self.0.discontinued.lock().unwrap() += 1;
    }
    fn update_downloaded(&self) {
        *self.0.downloaded.lock().unwrap() += 1;
    }
    fn begin_apply(&self) {
        *self.0.begin_apply_calls.lock().unwrap() += 1;
    }
    fn update_confirmation_required(&self, _update: &UpdateDescription) {
        *self.0.confirmation_required.lock().unwrap() += 1;
    }
    fn provider_busy(&self, delay_seconds: u32) {
        self.0.busy_delays.lock().unwrap().push(delay_seconds);
    }
    fn handle_error(&self, error: &OtaError, _state_at_error: OtaUpdateState) {
        self.0.errors.lock().unwrap().push(error.to_string());
    }
}

#[derive(Default)]
struct DownloaderState {
    cancel_calls: Mutex<u32>,
}

#[derive(Clone, Default)]
struct DownloaderHandle(Arc<DownloaderState>);

#[async_trait]
impl BulkDownloader for DownloaderHandle {
    async fn begin(&self, _uri: &str, _update_token: &[u8], _target_version: u32) -> Result<(), OtaError> {
        Ok(())
    }
    async fn cancel(&self) -> Result<(), OtaError> {
        *self.0.cancel_calls.lock().unwrap() += 1;
        Ok(())
    }
}

struct ScriptedMessenger {
    query_status: Mutex<Option<QueryImageStatus>>,
    apply_action: Mutex<Option<ApplyUpdateAction>>,
}

impl ScriptedMessenger {
    fn new(query_status: QueryImageStatus) -> Self {
        Self { query_status: Mutex::new(Some(query_status)), apply_action: Mutex::new(Some(ApplyUpdateAction::Proceed)) }
    }
}

#[async_trait]
impl ProviderMessenger for ScriptedMessenger {
    async fn connect(&self, _provider: ProviderLocation) -> Result<(), OtaError> {
        Ok(())
    }
    async fn send_query_image(&self, _provider: ProviderLocation) -> Result<QueryImageStatus, OtaError> {
        self.query_status.lock().unwrap().take().ok_or(OtaError::Internal("query image called twice".into()))
    }
    async fn send_apply_update(&self, _provider: ProviderLocation, _update_token: &[u8], _new_version: u32) -> Result<ApplyUpdateAction, OtaError> {
        Ok(self.apply_action.lock().unwrap().take().unwrap_or(ApplyUpdateAction::Proceed))
    }
    async fn send_notify_update_applied(&self, _provider: ProviderLocation, _update_token: &[u8], _software_version: u32) -> Result<(), OtaError> {
        Ok(())
    }
    async fn disconnect(&self, _provider: ProviderLocation) {}
}

fn provider() -> ProviderLocation {
    ProviderLocation { fabric_index: FabricIndex::new(1).unwrap(), node_id: NodeId(0xDEAD_BEEF), endpoint: 0 }
}

fn update_available(version: u32) -> QueryImageStatus {
    QueryImageStatus::UpdateAvailable {
        software_version: version,
        image_uri: "bdx://provider/image.bin".into(),
        update_token: None,
    }
}

/// S4: the full happy path from an idle requestor through to a cleared
/// update record, per spec.md §8.
#[tokio::test]
async fn happy_path_query_download_apply_notify() {
    let driver = DriverHandle::default();
    let mut requestor = OtaRequestor::new(
        Box::new(InMemoryStorage::new()),
        Box::new(driver.clone()),
        Box::new(DownloaderHandle::default()),
        Box::new(ScriptedMessenger::new(update_available(7))),
        NodeId(0x1234_5678),
        1,
    );
    requestor.init();
    assert_eq!(requestor.state(), OtaUpdateState::Idle);

    requestor.set_current_provider_location(provider());
    requestor.trigger_immediate_query(provider().fabric_index).await.unwrap();
    assert_eq!(requestor.state(), OtaUpdateState::DownloadInProgress);

    requestor.on_download_state_changed(DownloadState::InProgress);
    assert_eq!(requestor.state(), OtaUpdateState::Downloading);
    requestor.on_progress_changed(Some(50));
    assert_eq!(requestor.update_progress(), Some(50));
    requestor.on_progress_changed(Some(100));
    assert_eq!(requestor.update_progress(), Some(100));

    requestor.on_download_state_changed(DownloadState::Complete);
    assert_eq!(requestor.state(), OtaUpdateState::Applying);
    assert_eq!(*driver.0.downloaded.lock().unwrap(), 1);

    requestor.apply_update().await.unwrap();
    assert_eq!(*driver.0.begin_apply_calls.lock().unwrap(), 1);

    requestor.notify_update_applied().await.unwrap();
    assert_eq!(requestor.state(), OtaUpdateState::Idle);
}

/// S5: a Busy QueryImageResponse returns the requestor to Idle and reports
/// the delay hint, without ever starting a download.
#[tokio::test]
async fn busy_provider_returns_to_idle_with_delay_hint() {
    let driver = DriverHandle::default();
    let mut requestor = OtaRequestor::new(
        Box::new(InMemoryStorage::new()),
        Box::new(driver.clone()),
        Box::new(DownloaderHandle::default()),
        Box::new(ScriptedMessenger::new(QueryImageStatus::Busy { delay_seconds: 600 })),
        NodeId(0xAAAA),
        1,
    );
    requestor.init();
    requestor.set_current_provider_location(provider());

    requestor.trigger_immediate_query(provider().fabric_index).await.unwrap();

    assert_eq!(requestor.state(), OtaUpdateState::Idle);
    assert_eq!(*driver.0.busy_delays.lock().unwrap(), vec![600]);
    assert_eq!(requestor.update_progress(), None);
}

/// S6: cancelling mid-download aborts the transfer and returns to Idle; a
/// stray progress callback arriving after cancellation is dropped.
#[tokio::test]
async fn cancel_mid_download_then_drops_stray_progress() {
    let driver = DriverHandle::default();
    let downloader = DownloaderHandle::default();
    let mut requestor = OtaRequestor::new(
        Box::new(InMemoryStorage::new()),
        Box::new(driver),
        Box::new(downloader.clone()),
        Box::new(ScriptedMessenger::new(update_available(9))),
        NodeId(0xBEEF),
        1,
    );
    requestor.init();
    requestor.set_current_provider_location(provider());

    requestor.trigger_immediate_query(provider().fabric_index).await.unwrap();
    requestor.on_download_state_changed(DownloadState::InProgress);
    requestor.on_progress_changed(Some(25));
    assert_eq!(requestor.update_progress(), Some(25));

    requestor.cancel_image_update().await.unwrap();
    assert_eq!(requestor.state(), OtaUpdateState::Idle);
    assert_eq!(requestor.update_progress(), None);
    assert_eq!(*downloader.0.cancel_calls.lock().unwrap(), 1);

    // A stray progress event from the now-cancelled transfer must be ignored.
    requestor.on_progress_changed(Some(50));
    assert_eq!(requestor.update_progress(), None);
    assert_eq!(requestor.state(), OtaUpdateState::Idle);
}
