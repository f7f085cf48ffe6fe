//! OTA Requestor: provider selection, the Query/Download/Apply/Notify
//! lifecycle, and the update-record persistence that survives a reboot
//! mid-update.

mod error;
mod persistence;
mod provider;
mod requestor;
mod state;
mod token;
mod traits;

pub use error::OtaError;
pub use persistence::{KEY_CURRENT_PROVIDER, KEY_DEFAULT_PROVIDERS, KEY_UPDATE_TOKEN};
pub use provider::{DefaultProviderList, ProviderLocation};
pub use requestor::OtaRequestor;
pub use state::{ConnectedAction, OtaUpdateState, StateTransition, TransitionReason};
pub use token::{MAX_UPDATE_TOKEN_LEN, generate_update_token};
pub use traits::{
    ApplyUpdateAction, BulkDownloader, DownloadState, DownloadStateDelegate, LifecycleEvent,
    OtaRequestorDriver, ProviderMessenger, QueryImageStatus, Runtime, UpdateDescription,
};
