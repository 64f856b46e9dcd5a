use crate::config::Settings;
use crate::credentials::Credential;
use crate::credentials::CredentialStore;
use crate::manager::ConnectionContextManager;
use crate::mitm::MitmState;
use crate::ntlm::NtlmEngine;
use crate::pattern::HostPattern;
use crate::tls::TlsTrust;
use crate::upstream::UpstreamRouter;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared state behind both listeners: the immutable settings snapshot, the
/// credential store, the connection-context manager, and the shutdown signal.
pub(crate) struct ProxyState {
    settings: Settings,
    router: UpstreamRouter,
    trust: TlsTrust,
    engine: Arc<dyn NtlmEngine>,
    /// Copy-on-write snapshot: readers clone the `Arc`, the single writer
    /// (config API) swaps in a new store.
    credentials: RwLock<Arc<CredentialStore>>,
    contexts: ConnectionContextManager,
    mitm: std::sync::Mutex<Option<Arc<MitmState>>>,
    mitm_ca_dir: PathBuf,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials and engine internals stay out of debug output.
        f.debug_struct("ProxyState").finish_non_exhaustive()
    }
}

impl ProxyState {
    pub(crate) fn new(
        settings: Settings,
        engine: Arc<dyn NtlmEngine>,
        mitm_ca_dir: PathBuf,
    ) -> Result<Self> {
        let router = UpstreamRouter::from_settings(&settings);
        let trust = TlsTrust::from_settings(&settings)?;
        Ok(Self {
            settings,
            router,
            trust,
            engine,
            credentials: RwLock::new(Arc::new(CredentialStore::default())),
            contexts: ConnectionContextManager::default(),
            mitm: std::sync::Mutex::new(None),
            mitm_ca_dir,
            shutdown: CancellationToken::new(),
        })
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn router(&self) -> &UpstreamRouter {
        &self.router
    }

    pub(crate) fn trust(&self) -> &TlsTrust {
        &self.trust
    }

    pub(crate) fn engine(&self) -> &dyn NtlmEngine {
        self.engine.as_ref()
    }

    pub(crate) fn contexts(&self) -> &ConnectionContextManager {
        &self.contexts
    }

    /// Consistent snapshot of the credential store for one request; config
    /// mutations never affect a request that already picked its credentials.
    pub(crate) async fn credentials(&self) -> Arc<CredentialStore> {
        self.credentials.read().await.clone()
    }

    /// Upsert `credential` for every pattern. Reconfiguration alone never
    /// forces re-authentication on existing connections; new credentials take
    /// effect when the origin next demands a handshake.
    pub(crate) async fn configure_hosts(
        &self,
        patterns: Vec<HostPattern>,
        credential: Credential,
    ) {
        let rendered: Vec<&str> = patterns.iter().map(HostPattern::as_str).collect();
        info!(
            "configured credentials (patterns={rendered:?}, sso={})",
            credential.is_sso()
        );
        let mut guard = self.credentials.write().await;
        let mut next = CredentialStore::clone(&guard);
        for pattern in patterns {
            next.upsert(pattern, credential.clone());
        }
        *guard = Arc::new(next);
    }

    /// Remove all credentials and tear down all non-config contexts and
    /// tunnels. Teardown completes before the caller (the config API) writes
    /// its response, which its own context survives by construction.
    pub(crate) async fn reset(&self, reason: &str) {
        {
            let mut guard = self.credentials.write().await;
            *guard = Arc::new(CredentialStore::default());
        }
        self.contexts.remove_all(reason).await;
        self.contexts.remove_all_tunnels(reason).await;
        info!("proxy state reset (reason={reason})");
    }

    /// TLS-termination state for intercepted CONNECT targets, created on
    /// first use so plain-HTTP deployments never touch the CA directory.
    pub(crate) fn mitm_state(&self) -> Result<Arc<MitmState>> {
        let mut guard = self
            .mitm
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }
        let state = Arc::new(MitmState::new(&self.mitm_ca_dir)?);
        *guard = Some(state.clone());
        Ok(state)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn begin_shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }

    pub(crate) fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::test_state::proxy_state_for_tests;
    use pretty_assertions::assert_eq;

    fn settings() -> Settings {
        Settings {
            reject_unauthorized: true,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn configure_hosts_updates_the_snapshot() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let before = state.credentials().await;

        state
            .configure_hosts(
                vec![HostPattern::parse("example.com").unwrap()],
                Credential::Sso,
            )
            .await;

        let after = state.credentials().await;
        assert_eq!(before.is_empty(), true);
        assert_eq!(after.is_configured("example.com", 80), true);
        // The old snapshot is untouched: in-flight requests keep their view.
        assert_eq!(before.is_configured("example.com", 80), false);
    }

    #[tokio::test]
    async fn reset_clears_credentials_and_contexts() {
        let (state, _dir) = proxy_state_for_tests(settings());
        state
            .configure_hosts(
                vec![HostPattern::parse("example.com").unwrap()],
                Credential::Sso,
            )
            .await;
        state.contexts().get_or_create("127.0.0.1:6001", false).await;
        state.contexts().get_or_create("127.0.0.1:6002", true).await;

        state.reset("reset requested").await;

        assert_eq!(state.credentials().await.is_empty(), true);
        assert_eq!(state.contexts().context_count().await, 1);
        assert!(state.contexts().lookup("127.0.0.1:6002").await.is_some());
    }

    #[tokio::test]
    async fn reconfiguring_does_not_touch_contexts() {
        let (state, _dir) = proxy_state_for_tests(settings());
        state.contexts().get_or_create("127.0.0.1:6003", false).await;

        state
            .configure_hosts(
                vec![HostPattern::parse("example.com").unwrap()],
                Credential::Sso,
            )
            .await;

        assert_eq!(state.contexts().context_count().await, 1);
    }
}
