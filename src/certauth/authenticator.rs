//! Certificate authenticator.
//!
//! Loads the keypair and certificate from the credential store and, when
//! allowed, asks the tunnel process for a new certificate:
//!
//! ```text
//! idle ──► loading(should_refresh) ──► loaded(keys, certificate)
//!                                  └─► failed(error)
//! ```
//!
//! An expired certificate that is still present is handed out with a
//! warning; the control channel validates it during its handshake and
//! reports certificate errors that trigger a forced refresh.

use super::error::{CertAuthError, WontRefreshReason};
use super::session::SessionForker;
use super::store::CredentialStore;
use super::types::{AuthenticationData, CertAuthState, Certificate, VpnKeys};
use crate::intent::VpnFeatures;
use crate::retry::{Attempt, RetryPolicy, retry};
use crate::stream::{StatePublisher, Subscription};
use crate::tunnel::{ProviderMessenger, ProviderRequest, ProviderResponse};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    Cached { should_refresh_if_missing: bool },
    ForceRefresh,
    RegenerateKeys,
}

impl LoadMode {
    fn should_refresh(self) -> bool {
        match self {
            LoadMode::Cached {
                should_refresh_if_missing,
            } => should_refresh_if_missing,
            LoadMode::ForceRefresh | LoadMode::RegenerateKeys => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimit {
    until: Instant,
    retry_after: Duration,
}

/// Owns the local credentials and drives certificate refreshes.
#[derive(Clone)]
pub struct CertificateAuthenticator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    messenger: Arc<dyn ProviderMessenger>,
    forker: Arc<dyn SessionForker>,
    state: StatePublisher<CertAuthState>,
    load_lock: tokio::sync::Mutex<()>,
    rate_limit: Mutex<Option<RateLimit>>,
    generation: watch::Sender<u64>,
}

impl CertificateAuthenticator {
    /// Authenticator over a store, the tunnel's provider channel and a
    /// session forker.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        messenger: Arc<dyn ProviderMessenger>,
        forker: Arc<dyn SessionForker>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                store,
                messenger,
                forker,
                state: StatePublisher::new(CertAuthState::Idle),
                load_lock: tokio::sync::Mutex::new(()),
                rate_limit: Mutex::new(None),
                generation,
            }),
        }
    }

    /// Load credentials, refreshing the certificate if it is missing and
    /// `should_refresh_if_missing` allows it.
    pub async fn load_authentication_data(
        &self,
        features: &VpnFeatures,
        should_refresh_if_missing: bool,
    ) -> Result<AuthenticationData, CertAuthError> {
        self.run(
            features,
            LoadMode::Cached {
                should_refresh_if_missing,
            },
        )
        .await
    }

    /// Request a new certificate even if one is stored.
    pub async fn refresh_certificate(
        &self,
        features: &VpnFeatures,
    ) -> Result<AuthenticationData, CertAuthError> {
        self.run(features, LoadMode::ForceRefresh).await
    }

    /// Replace the keypair and fetch a certificate for it.
    pub async fn regenerate_keys(
        &self,
        features: &VpnFeatures,
    ) -> Result<AuthenticationData, CertAuthError> {
        self.run(features, LoadMode::RegenerateKeys).await
    }

    /// Stop tunnel-side refreshes and delete stored credentials.
    pub async fn clear_credentials(&self) -> Result<(), CertAuthError> {
        self.cancel();
        let _guard = self.inner.load_lock.lock().await;

        match self
            .inner
            .messenger
            .send_provider_message(ProviderRequest::CancelRefreshes)
            .await
        {
            Ok(ProviderResponse::Ok(_)) => debug!("Tunnel refreshes cancelled"),
            Ok(other) => warn!("Tunnel did not cancel refreshes: {:?}", other),
            Err(e) => warn!("Could not cancel tunnel refreshes: {}", e),
        }

        self.inner.store.clear()?;
        *self.inner.rate_limit() = None;
        self.inner.state.publish_if_changed(CertAuthState::Idle);
        info!("Credentials cleared");
        Ok(())
    }

    /// Abort any in-flight load or refresh and return to idle.
    pub fn cancel(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
        if self.inner.state.publish_if_changed(CertAuthState::Idle) {
            debug!("Certificate authenticator cancelled");
        }
    }

    /// Latest state.
    pub fn state(&self) -> CertAuthState {
        self.inner.state.current()
    }

    /// Stream of states, starting with the current one.
    pub fn subscribe(&self) -> Subscription<CertAuthState> {
        self.inner.state.subscribe()
    }

    async fn run(
        &self,
        features: &VpnFeatures,
        mode: LoadMode,
    ) -> Result<AuthenticationData, CertAuthError> {
        let mut cancelled = self.inner.generation.subscribe();
        let generation = *cancelled.borrow_and_update();

        tokio::select! {
            biased;
            _ = wait_for_cancel(&mut cancelled) => {
                debug!("Credential load cancelled");
                Err(CertAuthError::Cancelled)
            }
            result = self.inner.load(features, mode, generation) => result,
        }
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<u64>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl Inner {
    fn rate_limit(&self) -> MutexGuard<'_, Option<RateLimit>> {
        self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, generation: u64, state: CertAuthState) {
        if *self.generation.borrow() == generation {
            self.state.publish(state);
        }
    }

    async fn load(
        &self,
        features: &VpnFeatures,
        mode: LoadMode,
        generation: u64,
    ) -> Result<AuthenticationData, CertAuthError> {
        let _guard = self.load_lock.lock().await;
        self.publish(
            generation,
            CertAuthState::Loading {
                should_refresh_if_missing: mode.should_refresh(),
            },
        );

        let result = self.load_locked(features, mode).await;
        match &result {
            Ok(data) => {
                info!(
                    "Authentication data loaded, certificate valid until {}",
                    data.certificate.valid_until
                );
                self.publish(generation, CertAuthState::Loaded(data.clone()));
            }
            Err(e) => {
                warn!("Failed to load authentication data: {}", e);
                self.publish(generation, CertAuthState::Failed(e.clone()));
            }
        }
        result
    }

    async fn load_locked(
        &self,
        features: &VpnFeatures,
        mode: LoadMode,
    ) -> Result<AuthenticationData, CertAuthError> {
        let stored_keys = match mode {
            LoadMode::RegenerateKeys => None,
            _ => self.store.load_keys()?,
        };
        let (keys, regenerated) = match stored_keys {
            Some(keys) => (keys, false),
            None => {
                info!("Generating new keypair");
                let keys = VpnKeys::generate()?;
                self.store.store_keys(&keys)?;
                self.store.clear_certificate()?;
                (keys, true)
            }
        };

        let stored = if regenerated || mode == LoadMode::ForceRefresh {
            None
        } else {
            self.store.load_certificate()?
        };

        let certificate = match stored {
            Some(certificate) => {
                if certificate.is_expired(Utc::now()) {
                    warn!(
                        "Stored certificate expired at {}; the control channel will request renewal",
                        certificate.valid_until
                    );
                }
                certificate
            }
            None => {
                if !mode.should_refresh() {
                    let reason = if regenerated {
                        WontRefreshReason::KeysRegenerated
                    } else {
                        WontRefreshReason::CertificateMissing
                    };
                    return Err(CertAuthError::WontRefresh(reason));
                }
                self.refresh(features).await?
            }
        };

        Ok(AuthenticationData { keys, certificate })
    }

    fn check_rate_limit(&self) -> Result<(), CertAuthError> {
        let mut rate_limit = self.rate_limit();
        if let Some(limit) = *rate_limit {
            if Instant::now() < limit.until {
                debug!("Refusing certificate refresh until the rate limit expires");
                return Err(CertAuthError::RefreshWasRateLimited {
                    retry_after: Some(limit.retry_after),
                });
            }
            *rate_limit = None;
        }
        Ok(())
    }

    async fn refresh(&self, features: &VpnFeatures) -> Result<Certificate, CertAuthError> {
        self.check_rate_limit()?;

        // A second attempt only follows an expired session, after a new one
        // has been pushed to the tunnel process.
        retry(RetryPolicy::once_more(), move |attempt| async move {
            if attempt > 1 {
                self.push_new_session().await.map_err(Attempt::Fail)?;
            }

            info!("Requesting certificate refresh (attempt {})", attempt);
            let response = self
                .messenger
                .send_provider_message(ProviderRequest::RefreshCertificate {
                    features: features.clone(),
                })
                .await
                .map_err(|e| Attempt::Fail(CertAuthError::Ipc(e.to_string())))?;

            match response {
                ProviderResponse::Ok(payload) => self.store_refreshed(payload).map_err(Attempt::Fail),
                ProviderResponse::ErrorSessionExpired => {
                    warn!("Tunnel process API session expired");
                    Err(Attempt::Retry(CertAuthError::SessionExpired))
                }
                ProviderResponse::ErrorNeedKeyRegeneration => {
                    error!("Tunnel process requested key regeneration; keys should already exist");
                    Err(Attempt::Fail(CertAuthError::NeedNewKeys))
                }
                ProviderResponse::ErrorTooManyCertRequests { retry_after } => {
                    warn!("Certificate refresh rate limited, retry after {:?}", retry_after);
                    if let Some(delay) = retry_after {
                        *self.rate_limit() = Some(RateLimit {
                            until: Instant::now() + delay,
                            retry_after: delay,
                        });
                    }
                    Err(Attempt::Fail(CertAuthError::RefreshWasRateLimited { retry_after }))
                }
                ProviderResponse::Error(message) => {
                    Err(Attempt::Fail(CertAuthError::Provider(message)))
                }
            }
        })
        .await
    }

    fn store_refreshed(&self, payload: Option<Vec<u8>>) -> Result<Certificate, CertAuthError> {
        if let Some(payload) = payload {
            let certificate: Certificate = serde_json::from_slice(&payload)
                .map_err(|e| CertAuthError::Provider(format!("unreadable certificate: {e}")))?;
            self.store.store_certificate(&certificate)?;
        }
        self.store.load_certificate()?.ok_or_else(|| {
            CertAuthError::Provider("refresh succeeded but no certificate was stored".into())
        })
    }

    async fn push_new_session(&self) -> Result<(), CertAuthError> {
        let session = self.forker.fork_session().await?;
        info!("Pushing forked API session to tunnel process");

        let response = self
            .messenger
            .send_provider_message(ProviderRequest::SetApiSelector {
                selector: session.selector,
                session_cookie: session.session_cookie,
            })
            .await
            .map_err(|e| CertAuthError::Ipc(e.to_string()))?;
        if let ProviderResponse::Error(message) = response {
            return Err(CertAuthError::SessionFork(message));
        }

        match self
            .messenger
            .send_provider_message(ProviderRequest::RestartRefreshes)
            .await
        {
            Ok(ProviderResponse::Ok(_)) => {}
            Ok(other) => warn!("Tunnel did not restart refreshes: {:?}", other),
            Err(e) => warn!("Could not restart tunnel refreshes: {}", e),
        }
        Ok(())
    }
}
