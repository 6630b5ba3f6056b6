//! Certificate-based tunnel authentication.
//!
//! The tunnel and the control channel authenticate with a local Ed25519
//! keypair and a short-lived certificate issued for it. The certificate is
//! obtained through the running tunnel process, which holds its own API
//! session for that purpose.
//!
//! - [`CertificateAuthenticator`]: load, refresh, regenerate, clear
//! - [`CredentialStore`]: where keys and certificate live
//!   ([`FileCredentialStore`], [`MemoryCredentialStore`])
//! - [`SessionForker`]: source of fresh API sessions when the tunnel's
//!   session expires
//!
//! # Refresh outcomes
//!
//! | Tunnel reply                | Result                                   |
//! |-----------------------------|------------------------------------------|
//! | `ok(data?)`                 | certificate stored, re-read from store   |
//! | `errorSessionExpired`       | fork session, push selector, retry once  |
//! | `errorNeedKeyRegeneration`  | `NeedNewKeys`, not recovered             |
//! | `errorTooManyCertRequests`  | `RefreshWasRateLimited`, refused locally until the hint elapses |
//! | `error(message)`            | `Provider(message)`                      |

mod authenticator;
mod error;
mod session;
mod store;
mod types;

pub use authenticator::CertificateAuthenticator;
pub use error::{CertAuthError, StoreError, WontRefreshReason};
pub use session::{ConfiguredSessionForker, ForkedSession, SessionForker};
pub use store::{
    CERTIFICATE_FILE, CredentialStore, FileCredentialStore, KEYS_FILE, MemoryCredentialStore,
};
pub use types::{AuthenticationData, CertAuthState, Certificate, VpnKeys};
