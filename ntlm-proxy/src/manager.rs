use crate::context::ConnectionContext;
use crate::state::ProxyState;
use crate::target::CompleteUrl;
use crate::tls::TlsTrust;
use crate::upstream::UntrackedClient;
use crate::upstream::UpstreamRouter;
use rama_core::Service;
use rama_core::extensions::ExtensionsRef;
use rama_net::stream::SocketInfo;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// Owns every [`ConnectionContext`] and every opaque CONNECT tunnel.
///
/// The manager is the single mediator between downstream socket lifetime and
/// context teardown: the connection-tracking service registers a context when
/// a socket is accepted and removes it when the connection task completes, so
/// neither the context nor the socket holds a strong reference to the other.
#[derive(Default)]
pub(crate) struct ConnectionContextManager {
    contexts: Mutex<HashMap<String, Arc<ConnectionContext>>>,
    tunnels: Mutex<HashMap<String, CancellationToken>>,
}

impl ConnectionContextManager {
    /// Context for a downstream peer, created on first sight.
    pub(crate) async fn get_or_create(
        &self,
        client_address: &str,
        config_api: bool,
    ) -> Arc<ConnectionContext> {
        let mut contexts = self.contexts.lock().await;
        contexts
            .entry(client_address.to_string())
            .or_insert_with(|| {
                debug!("creating connection context (client={client_address}, config_api={config_api})");
                Arc::new(ConnectionContext::new(
                    client_address.to_string(),
                    config_api,
                ))
            })
            .clone()
    }

    pub(crate) async fn lookup(&self, client_address: &str) -> Option<Arc<ConnectionContext>> {
        let contexts = self.contexts.lock().await;
        contexts.get(client_address).cloned()
    }

    pub(crate) async fn remove(&self, client_address: &str, reason: &str) {
        let removed = {
            let mut contexts = self.contexts.lock().await;
            contexts.remove(client_address)
        };
        if let Some(context) = removed {
            context.destroy(reason);
        }
    }

    /// Destroy every tracked context except the ones serving config-API
    /// traffic, which must stay alive so the request that triggered the
    /// teardown can still be answered.
    pub(crate) async fn remove_all(&self, reason: &str) {
        let removed = {
            let mut contexts = self.contexts.lock().await;
            let mut removed = Vec::new();
            contexts.retain(|_, context| {
                if context.is_config_api() {
                    true
                } else {
                    removed.push(context.clone());
                    false
                }
            });
            removed
        };
        if !removed.is_empty() {
            info!("destroying {} connection context(s) (reason={reason})", removed.len());
        }
        for context in removed {
            context.destroy(reason);
        }
    }

    /// Track an opaque CONNECT tunnel; the returned token cancels its splice.
    pub(crate) async fn register_tunnel(&self, client_address: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tunnels = self.tunnels.lock().await;
        tunnels.insert(client_address.to_string(), token.clone());
        token
    }

    pub(crate) async fn remove_tunnel(&self, client_address: &str) {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(token) = tunnels.remove(client_address) {
            token.cancel();
        }
    }

    pub(crate) async fn remove_all_tunnels(&self, reason: &str) {
        let drained = {
            let mut tunnels = self.tunnels.lock().await;
            std::mem::take(&mut *tunnels)
        };
        if !drained.is_empty() {
            info!("ending {} tunnel(s) (reason={reason})", drained.len());
        }
        for (_, token) in drained {
            token.cancel();
        }
    }

    /// Ephemeral upstream client outside the tracked tables; `reset` cannot
    /// tear it down mid-response, which makes it safe for config-API traffic.
    pub(crate) fn untracked_client(
        &self,
        router: &UpstreamRouter,
        trust: &TlsTrust,
        target: CompleteUrl,
    ) -> UntrackedClient {
        UntrackedClient::new(router, trust, target)
    }

    #[cfg(test)]
    pub(crate) async fn context_count(&self) -> usize {
        self.contexts.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn tunnel_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }
}

/// Stream-level service wrapping the HTTP server: registers a connection
/// context when a downstream socket is accepted and removes it when the
/// connection's serve future completes (i.e. the socket closed).
pub(crate) struct TrackConnections<S> {
    state: Arc<ProxyState>,
    config_api: bool,
    inner: S,
}

impl<S> TrackConnections<S> {
    pub(crate) fn new(state: Arc<ProxyState>, config_api: bool, inner: S) -> Self {
        Self {
            state,
            config_api,
            inner,
        }
    }
}

impl<S, Input> Service<Input> for TrackConnections<S>
where
    S: Service<Input>,
    Input: ExtensionsRef + Send + 'static,
{
    type Output = S::Output;
    type Error = S::Error;

    async fn serve(&self, input: Input) -> Result<Self::Output, Self::Error> {
        let client_address = input
            .extensions()
            .get::<SocketInfo>()
            .map(|info| info.peer_addr().to_string());

        if let Some(client) = &client_address {
            self.state
                .contexts()
                .get_or_create(client, self.config_api)
                .await;
        }

        let result = self.inner.serve(input).await;

        if let Some(client) = &client_address {
            self.state
                .contexts()
                .remove(client, "downstream connection closed")
                .await;
        }

        result
    }
}
