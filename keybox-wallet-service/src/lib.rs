//! Keybox wallet service
//!
//! Ties the recovery core to its collaborators: the remote authority (f8e),
//! the chain data source and the encrypted local store. Each account has a
//! single writer; status reads go through watch channels and never wait on
//! the writer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod config;
pub mod locks;
pub mod recovery;
pub mod refresher;
pub mod registry;
pub mod rotation;
pub mod signer;
pub mod store;
pub mod sweep;

pub use cancel::CancelToken;
pub use config::ServiceConfig;
pub use locks::AccountLocks;
pub use recovery::{RecoveryService, RecoveryStatus};
pub use refresher::{ForegroundRefresher, RefresherHandle};
pub use registry::{CreatedAction, PrivilegedActionRegistry};
pub use rotation::{load_active_keybox, KeyRotationService};
#[cfg(any(test, feature = "test-helpers"))]
pub use signer::FakeSigner;
pub use signer::{verify_signed, PsbtSigner};
pub use store::{run_blocking, MemoryStore, SqliteStore, WalletStore};
pub use sweep::SweepService;
