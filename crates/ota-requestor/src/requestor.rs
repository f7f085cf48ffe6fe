use device_storage::PersistentStorage;
use fabric_ids::{FabricIndex, NodeId};
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::error::OtaError;
use crate::persistence;
use crate::provider::{DefaultProviderList, ProviderLocation};
use crate::state::{ConnectedAction, OtaUpdateState, StateTransition, TransitionReason, map_error_to_idle_state_reason};
use crate::token::generate_update_token;
use crate::traits::{ApplyUpdateAction, BulkDownloader, DownloadState, DownloadStateDelegate, OtaRequestorDriver, ProviderMessenger, QueryImageStatus, UpdateDescription};

/// Drives one device's OTA update lifecycle end to end: provider selection,
/// the Query/Download/Apply/Notify cycle, and the volatile + persisted state
/// that must survive a reboot mid-update. Collaborators (storage, driver,
/// downloader, messenger) are injected as trait objects, matching the
/// fabric table's `Box<dyn ...>` collaborator style.
pub struct OtaRequestor {
    state: OtaUpdateState,
    storage: Box<dyn PersistentStorage>,
    driver: Box<dyn OtaRequestorDriver>,
    downloader: Box<dyn BulkDownloader>,
    messenger: Box<dyn ProviderMessenger>,
    local_node_id: NodeId,
    current_version: u32,
    default_providers: DefaultProviderList,
    provider_location: Option<ProviderLocation>,
    connected_action: Option<ConnectedAction>,
    update_token: Option<Vec<u8>>,
    target_version: Option<u32>,
    image_uri: Option<String>,
    progress_percent: Option<u8>,
    last_error: Option<String>,
    last_transition: Option<StateTransition>,
}

impl OtaRequestor {
    pub fn new(
        storage: Box<dyn PersistentStorage>,
        driver: Box<dyn OtaRequestorDriver>,
        downloader: Box<dyn BulkDownloader>,
        messenger: Box<dyn ProviderMessenger>,
        local_node_id: NodeId,
        current_version: u32,
    ) -> Self {
        Self {
            state: OtaUpdateState::Unknown,
            storage,
            driver,
            downloader,
            messenger,
            local_node_id,
            current_version,
            default_providers: DefaultProviderList::new(),
            provider_location: None,
            connected_action: None,
            update_token: None,
            target_version: None,
            image_uri: None,
            progress_percent: None,
            last_error: None,
            last_transition: None,
        }
    }

    /// Loads persisted state best-effort and transitions `Unknown -> Idle`,
    /// mirroring `OTARequestor::Init`/`InitState`.
    pub fn init(&mut self) {
        self.default_providers = persistence::load_default_providers(self.storage.as_ref());
        if let Some((provider, target_version)) = persistence::load_current_provider(self.storage.as_ref()) {
            self.provider_location = Some(provider);
            self.target_version = Some(target_version);
        }
        self.update_token = persistence::load_update_token(self.storage.as_ref());
        self.record_transition(OtaUpdateState::Idle, TransitionReason::Success);
    }

    pub fn state(&self) -> OtaUpdateState {
        self.state
    }

    /// Alias kept distinct from `state()` because the original exposes both
    /// a cluster-attribute accessor (`GetState`) and a plain getter
    /// (`GetCurrentUpdateState`); both return the same value here.
    pub fn current_update_state(&self) -> OtaUpdateState {
        self.state
    }

    pub fn update_progress(&self) -> Option<u8> {
        self.progress_percent
    }

    pub fn provider_location(&self) -> Option<ProviderLocation> {
        self.provider_location
    }

    pub fn set_current_provider_location(&mut self, provider: ProviderLocation) {
        self.provider_location = Some(provider);
    }

    pub fn add_default_ota_provider(&mut self, provider: ProviderLocation) -> Result<(), OtaError> {
        self.default_providers.add(provider);
        persistence::save_default_providers(self.storage.as_mut(), &self.default_providers)?;
        Ok(())
    }

    pub fn clear_default_ota_provider_list(&mut self, fabric_index: FabricIndex) -> Result<(), OtaError> {
        self.default_providers.clear_fabric(fabric_index);
        persistence::save_default_providers(self.storage.as_mut(), &self.default_providers)?;
        Ok(())
    }

    fn record_transition(&mut self, new: OtaUpdateState, reason: TransitionReason) {
        let previous = self.state;
        self.state = new;
        info!(?previous, ?new, ?reason, "OTA requestor state transition");
        self.last_transition = Some(StateTransition { previous, new, reason, last_error: self.last_error.clone() });
    }

    /// Application-initiated entry point: select a provider for `fabric_index`
    /// (the explicit `provider_location` wins if already set) and start the
    /// Query cycle. Mirrors `TriggerImmediateQuery`.
    pub async fn trigger_immediate_query(&mut self, fabric_index: FabricIndex) -> Result<(), OtaError> {
        if self.state != OtaUpdateState::Idle {
            return Err(OtaError::IncorrectState);
        }
        let provider = self
            .provider_location
            .or_else(|| self.default_providers.find_for_fabric(fabric_index))
            .ok_or(OtaError::NotFound)?;
        self.provider_location = Some(provider);
        self.connected_action = Some(ConnectedAction::QueryImage);
        self.record_transition(OtaUpdateState::Querying, TransitionReason::Success);

        match self.messenger.connect(provider).await {
            Ok(()) => self.on_connected_query_image(provider).await,
            Err(err) => self.on_connection_failure(err),
        }
    }

    /// Wire-originated `AnnounceOTAProvider` command, mirroring
    /// `HandleAnnounceOTAProvider`: records the announced provider, then
    /// drives the same transition `trigger_immediate_query` does.
    pub async fn announce_ota_provider(&mut self, provider: ProviderLocation) -> Result<(), OtaError> {
        self.provider_location = Some(provider);
        self.trigger_immediate_query(provider.fabric_index).await
    }

    /// Hook for `Runtime::add_event_handler(LifecycleEvent::CommissioningComplete)`,
    /// mirroring `OnCommissioningCompleteRequestor` -> `TriggerImmediateQueryInternal`.
    pub async fn on_commissioning_complete(&mut self, fabric_index: FabricIndex) -> Result<(), OtaError> {
        self.trigger_immediate_query(fabric_index).await
    }

    async fn on_connected_query_image(&mut self, provider: ProviderLocation) -> Result<(), OtaError> {
        if self.connected_action != Some(ConnectedAction::QueryImage) {
            debug!("ignoring stale on_connected for QueryImage");
            return Ok(());
        }
        self.connected_action = None;
        match self.messenger.send_query_image(provider).await {
            Ok(status) => self.handle_query_image_response(status).await,
            Err(err) => self.fail_to_idle(err),
        }
    }

    async fn handle_query_image_response(&mut self, status: QueryImageStatus) -> Result<(), OtaError> {
        match status {
            QueryImageStatus::Busy { delay_seconds } => {
                self.record_transition(OtaUpdateState::Idle, TransitionReason::DelayByProvider);
                self.driver.provider_busy(delay_seconds);
                Ok(())
            }
            QueryImageStatus::NotAvailable => {
                self.record_transition(OtaUpdateState::Idle, TransitionReason::Success);
                self.driver.update_discontinued();
                Ok(())
            }
            QueryImageStatus::UpdateAvailable { software_version, image_uri, update_token } => {
                let token = match update_token {
                    Some(token) if !token.is_empty() && token.len() <= crate::token::MAX_UPDATE_TOKEN_LEN => token,
                    _ => generate_update_token(self.local_node_id, &mut OsRng).to_vec(),
                };
                if let Err(err) = persistence::save_update_token(self.storage.as_mut(), &token) {
                    warn!(%err, "failed to persist update token");
                }
                if let Some(provider) = self.provider_location {
                    if let Err(err) = persistence::save_current_provider(self.storage.as_mut(), &provider, software_version) {
                        warn!(%err, "failed to persist current provider/target version");
                    }
                }
                self.update_token = Some(token.clone());
                self.target_version = Some(software_version);
                self.image_uri = Some(image_uri.clone());

                let update = UpdateDescription { software_version, image_uri, update_token: token };
                self.driver.update_available(&update);

                if self.driver.requires_user_consent(&update) {
                    self.record_transition(OtaUpdateState::DelayedOnUserConsent, TransitionReason::UserConsentNeeded);
                    self.driver.update_confirmation_required(&update);
                    Ok(())
                } else {
                    self.begin_download().await
                }
            }
        }
    }

    /// Driver-initiated transition out of `DelayedOnUserConsent` once consent
    /// has been granted, mirroring `DownloadUpdate`.
    pub async fn download_update(&mut self) -> Result<(), OtaError> {
        if self.state != OtaUpdateState::DelayedOnUserConsent {
            return Err(OtaError::IncorrectState);
        }
        self.begin_download().await
    }

    /// Mirrors `DownloadUpdateDelayedOnUserConsent`.
    pub fn download_update_delayed_on_user_consent(&mut self) {
        self.record_transition(OtaUpdateState::DelayedOnUserConsent, TransitionReason::UserConsentNeeded);
    }

    async fn begin_download(&mut self) -> Result<(), OtaError> {
        let uri = self.image_uri.clone().ok_or(OtaError::IncorrectState)?;
        let token = self.update_token.clone().ok_or(OtaError::IncorrectState)?;
        let target_version = self.target_version.ok_or(OtaError::IncorrectState)?;

        self.record_transition(OtaUpdateState::DownloadInProgress, TransitionReason::Success);
        match self.downloader.begin(&uri, &token, target_version).await {
            Ok(()) => Ok(()),
            Err(err) => self.fail_to_idle(err),
        }
    }

    fn fail_to_idle(&mut self, err: OtaError) -> Result<(), OtaError> {
        self.last_error = Some(err.to_string());
        self.record_transition(OtaUpdateState::Idle, map_error_to_idle_state_reason(&err));
        self.driver.handle_error(&err, OtaUpdateState::Idle);
        Err(err)
    }

    fn on_connection_failure(&mut self, err: OtaError) -> Result<(), OtaError> {
        if self.connected_action.is_none() {
            debug!("ignoring stale on_connection_failure");
            return Ok(());
        }
        self.connected_action = None;
        self.fail_to_idle(err)
    }

    /// Initiates the Apply exchange, mirroring `ApplyUpdate`. Normally called
    /// automatically once a download completes (see
    /// `DownloadStateDelegate::on_download_state_changed`), but exposed
    /// publicly so a driver can retry after `DelayedOnApply`.
    pub async fn apply_update(&mut self) -> Result<(), OtaError> {
        if self.state != OtaUpdateState::Applying {
            return Err(OtaError::IncorrectState);
        }
        let provider = self.provider_location.ok_or(OtaError::IncorrectState)?;
        self.connected_action = Some(ConnectedAction::ApplyUpdate);
        match self.messenger.connect(provider).await {
            Ok(()) => self.on_connected_apply_update(provider).await,
            Err(err) => self.on_connection_failure(err),
        }
    }

    async fn on_connected_apply_update(&mut self, provider: ProviderLocation) -> Result<(), OtaError> {
        if self.connected_action != Some(ConnectedAction::ApplyUpdate) {
            debug!("ignoring stale on_connected for ApplyUpdate");
            return Ok(());
        }
        self.connected_action = None;
        let token = self.update_token.clone().ok_or(OtaError::IncorrectState)?;
        let target_version = self.target_version.ok_or(OtaError::IncorrectState)?;

        match self.messenger.send_apply_update(provider, &token, target_version).await {
            Ok(ApplyUpdateAction::Proceed) => {
                self.driver.begin_apply();
                Ok(())
            }
            Ok(ApplyUpdateAction::AwaitNextAction { delay_seconds }) => {
                self.record_transition(OtaUpdateState::DelayedOnApply, TransitionReason::DelayByProvider);
                self.driver.provider_busy(delay_seconds);
                Ok(())
            }
            Ok(ApplyUpdateAction::Discontinue) => {
                self.clear_update_record();
                self.record_transition(OtaUpdateState::Idle, TransitionReason::Success);
                Ok(())
            }
            Err(err) => self.fail_to_idle(err),
        }
    }

    /// Sends `NotifyUpdateApplied` after a successful reboot with the new
    /// image, then clears the persisted update record regardless of the
    /// response, mirroring step 7 of spec.md §4.3.
    pub async fn notify_update_applied(&mut self) -> Result<(), OtaError> {
        let provider = self.provider_location.ok_or(OtaError::IncorrectState)?;
        let token = self.update_token.clone().ok_or(OtaError::IncorrectState)?;
        let software_version = self.current_version;

        self.connected_action = Some(ConnectedAction::NotifyUpdateApplied);
        let result = match self.messenger.connect(provider).await {
            Ok(()) => self.messenger.send_notify_update_applied(provider, &token, software_version).await,
            Err(err) => Err(err),
        };
        self.connected_action = None;

        self.clear_update_record();
        self.record_transition(OtaUpdateState::Idle, TransitionReason::Success);
        result
    }

    fn clear_update_record(&mut self) {
        persistence::clear_update_token(self.storage.as_mut());
        persistence::clear_current_provider(self.storage.as_mut());
        self.update_token = None;
        self.target_version = None;
        self.image_uri = None;
    }

    /// The only universal cancellation, mirroring `CancelImageUpdate`: aborts
    /// any in-flight download, clears the provider location and connected-
    /// action tag (so late callbacks are dropped), and returns to `Idle`.
    pub async fn cancel_image_update(&mut self) -> Result<(), OtaError> {
        let _ = self.downloader.cancel().await;
        self.connected_action = None;
        self.provider_location = None;
        self.image_uri = None;
        self.progress_percent = None;
        self.record_transition(OtaUpdateState::Idle, TransitionReason::Cancelled);
        Ok(())
    }
}

impl DownloadStateDelegate for OtaRequestor {
    fn on_download_state_changed(&mut self, state: DownloadState) {
        match state {
            DownloadState::InProgress => {
                if self.state == OtaUpdateState::DownloadInProgress {
                    self.record_transition(OtaUpdateState::Downloading, TransitionReason::Success);
                }
            }
            DownloadState::Complete => {
                self.record_transition(OtaUpdateState::Applying, TransitionReason::Success);
                self.driver.update_downloaded();
            }
            DownloadState::Cancelled => {
                self.progress_percent = None;
                self.record_transition(OtaUpdateState::Idle, TransitionReason::Cancelled);
            }
            DownloadState::TimedOut => {
                self.fail_to_idle(OtaError::Timeout).ok();
            }
            DownloadState::Error => {
                self.fail_to_idle(OtaError::NetworkError("bulk download reported an error".into())).ok();
            }
        }
    }

    /// Stray progress after the download has left an in-progress state
    /// (e.g. following `cancel_image_update()`) is silently dropped, per
    /// spec.md §8 scenario S6.
    fn on_progress_changed(&mut self, percent: Option<u8>) {
        if self.state != OtaUpdateState::Downloading && self.state != OtaUpdateState::DownloadInProgress {
            debug!("ignoring stray download progress outside an active download");
            return;
        }
        self.progress_percent = percent.map(|p| p.min(100));
    }
}
