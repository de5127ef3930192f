// Authentication module
// Manages the token pair lifecycle: storage, scheduled renewal and teardown

mod manager;
mod refresh;
mod scheduler;
pub mod storage;
mod store;
mod types;

pub use manager::{SessionManager, UnauthorizedHandler};
pub use scheduler::{renewal_delay, RenewalScheduler};
pub use store::CredentialStore;
pub use types::{IssuedTokens, RenewalOutcome, StorageScope, TokenPair};
