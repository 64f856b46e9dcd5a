use crate::config;
use crate::config::Settings;
use crate::config_api;
use crate::http_proxy;
use crate::ntlm::NtlmEngine;
use crate::ports;
use crate::ports::PortsFile;
use crate::state::ProxyState;
use anyhow::Context;
use anyhow::Result;
use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

const NTLM_PROXY_DEFAULT_PORT: u16 = 3000;
const CONFIG_API_DEFAULT_PORT: u16 = 3001;

/// Grace period between aborting the NTLM proxy listener and the config API
/// listener on `quit`, so the final config-API response can flush.
const CONFIG_API_DRAIN: Duration = Duration::from_millis(100);

/// Ensures a process-wide rustls crypto provider is installed; rustls cannot
/// auto-select one when multiple providers are linked into the binary.
pub(crate) fn ensure_rustls_crypto_provider() {
    static RUSTLS_PROVIDER_INIT: Once = Once::new();
    RUSTLS_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[derive(Debug)]
struct ReservedListeners {
    ntlm: Mutex<Option<StdTcpListener>>,
    api: Mutex<Option<StdTcpListener>>,
}

impl ReservedListeners {
    fn new(ntlm: StdTcpListener, api: StdTcpListener) -> Self {
        Self {
            ntlm: Mutex::new(Some(ntlm)),
            api: Mutex::new(Some(api)),
        }
    }

    fn take_ntlm(&self) -> Option<StdTcpListener> {
        let mut guard = self
            .ntlm
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.take()
    }

    fn take_api(&self) -> Option<StdTcpListener> {
        let mut guard = self
            .api
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.take()
    }
}

#[derive(Default)]
pub struct NtlmProxyBuilder {
    engine: Option<Arc<dyn NtlmEngine>>,
    settings: Option<Settings>,
    data_dir: Option<PathBuf>,
    ntlm_addr: Option<SocketAddr>,
    api_addr: Option<SocketAddr>,
}

impl NtlmProxyBuilder {
    /// The NTLM engine is an external collaborator and therefore mandatory.
    pub fn engine<E>(mut self, engine: E) -> Self
    where
        E: NtlmEngine,
    {
        self.engine = Some(Arc::new(engine));
        self
    }

    pub fn engine_arc(mut self, engine: Arc<dyn NtlmEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Override the environment snapshot (tests, embedding hosts).
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Override the user data directory holding the ports file and CA cache.
    pub fn data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = Some(data_dir);
        self
    }

    pub fn ntlm_proxy_addr(mut self, addr: SocketAddr) -> Self {
        self.ntlm_addr = Some(addr);
        self
    }

    pub fn config_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    /// Resolve the listen addresses, bind both listeners (a bind failure here
    /// is fatal for the host process), and assemble the proxy.
    pub fn build(self) -> Result<NtlmProxy> {
        let engine = self.engine.context(
            "NtlmProxyBuilder requires an NTLM engine; supply one via builder.engine(...)",
        )?;
        let settings = self.settings.unwrap_or_else(Settings::from_env);

        let ntlm_addr = resolve_requested_addr(
            self.ntlm_addr,
            settings.ntlm_proxy_url.as_deref(),
            NTLM_PROXY_DEFAULT_PORT,
        )?;
        let api_addr = resolve_requested_addr(
            self.api_addr,
            settings.config_api_url.as_deref(),
            CONFIG_API_DEFAULT_PORT,
        )?;

        let ntlm_listener = bind_listener("NTLM proxy", ntlm_addr)?;
        let api_listener = bind_listener("config API", api_addr)?;
        let ntlm_addr = ntlm_listener
            .local_addr()
            .context("failed to read NTLM proxy listener address")?;
        let api_addr = api_listener
            .local_addr()
            .context("failed to read config API listener address")?;

        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => ports::user_data_dir()?,
        };
        let state = Arc::new(ProxyState::new(
            settings,
            engine,
            data_dir.join(".mitm-ca"),
        )?);

        Ok(NtlmProxy {
            state,
            ntlm_addr,
            api_addr,
            data_dir,
            reserved: Arc::new(ReservedListeners::new(ntlm_listener, api_listener)),
        })
    }
}

/// Listener address resolution: builder override, then the environment URL,
/// then a loopback ephemeral port.
fn resolve_requested_addr(
    override_addr: Option<SocketAddr>,
    env_url: Option<&str>,
    default_port: u16,
) -> Result<SocketAddr> {
    if let Some(addr) = override_addr {
        return Ok(addr);
    }
    match env_url {
        Some(url) => config::resolve_bind_addr(url, default_port),
        None => Ok(SocketAddr::from(([127, 0, 0, 1], 0))),
    }
}

fn bind_listener(name: &str, addr: SocketAddr) -> Result<StdTcpListener> {
    StdTcpListener::bind(addr).with_context(|| format!("failed to bind {name} listener on {addr}"))
}

/// The assembled proxy: both listeners bound, state ready, not yet serving.
pub struct NtlmProxy {
    state: Arc<ProxyState>,
    ntlm_addr: SocketAddr,
    api_addr: SocketAddr,
    data_dir: PathBuf,
    reserved: Arc<ReservedListeners>,
}

impl std::fmt::Debug for NtlmProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmProxy")
            .field("ntlm_addr", &self.ntlm_addr)
            .field("api_addr", &self.api_addr)
            .finish_non_exhaustive()
    }
}

impl NtlmProxy {
    pub fn builder() -> NtlmProxyBuilder {
        NtlmProxyBuilder::default()
    }

    pub fn ntlm_proxy_addr(&self) -> SocketAddr {
        self.ntlm_addr
    }

    pub fn config_api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn ntlm_proxy_url(&self) -> String {
        format!("http://{}", self.ntlm_addr)
    }

    pub fn config_api_url(&self) -> String {
        format!("http://{}", self.api_addr)
    }

    pub fn ports_file(&self) -> PortsFile {
        PortsFile {
            config_api_url: self.config_api_url(),
            ntlm_proxy_url: self.ntlm_proxy_url(),
        }
    }

    /// Start both listeners, write the ports file, and hand back the running
    /// handle. The host emits the returned URLs on stdout.
    pub async fn run(&self) -> Result<NtlmProxyHandle> {
        ensure_rustls_crypto_provider();

        let ntlm_listener = self.reserved.take_ntlm();
        let api_listener = self.reserved.take_api();

        let ntlm_state = self.state.clone();
        let ntlm_addr = self.ntlm_addr;
        let ntlm_task = tokio::spawn(async move {
            match ntlm_listener {
                Some(listener) => {
                    http_proxy::run_ntlm_proxy_with_std_listener(ntlm_state, listener).await
                }
                None => http_proxy::run_ntlm_proxy(ntlm_state, ntlm_addr).await,
            }
        });

        let api_state = self.state.clone();
        let api_addr = self.api_addr;
        let api_task = tokio::spawn(async move {
            match api_listener {
                Some(listener) => {
                    config_api::run_config_api_with_std_listener(api_state, listener).await
                }
                None => config_api::run_config_api(api_state, api_addr).await,
            }
        });

        let ports_path = ports::write_ports_file(&self.data_dir, &self.ports_file())?;
        info!(
            "proxy started (ntlm={}, config_api={})",
            self.ntlm_proxy_url(),
            self.config_api_url()
        );

        Ok(NtlmProxyHandle {
            state: self.state.clone(),
            ntlm_task: Some(ntlm_task),
            api_task: Some(api_task),
            ports_path: Some(ports_path),
            completed: false,
        })
    }
}

pub struct NtlmProxyHandle {
    state: Arc<ProxyState>,
    ntlm_task: Option<JoinHandle<Result<()>>>,
    api_task: Option<JoinHandle<Result<()>>>,
    ports_path: Option<PathBuf>,
    completed: bool,
}

impl NtlmProxyHandle {
    /// Serve until `POST /quit` (or a listener failure). Returns `Ok(())` on
    /// graceful shutdown; the host maps errors to a non-zero exit code.
    pub async fn wait(mut self) -> Result<()> {
        let shutdown = self.state.shutdown_token();
        let mut ntlm_task = self.ntlm_task.take().context("missing NTLM proxy task")?;
        let mut api_task = self.api_task.take().context("missing config API task")?;

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                // Stop accepting downstream connections immediately, but let
                // the final quit/reset response flush before the config API
                // listener goes away.
                abort_task(&mut ntlm_task).await;
                tokio::time::sleep(CONFIG_API_DRAIN).await;
                abort_task(&mut api_task).await;
                Ok(())
            }
            res = &mut ntlm_task => {
                abort_task(&mut api_task).await;
                flatten_join(res)
            }
            res = &mut api_task => {
                abort_task(&mut ntlm_task).await;
                flatten_join(res)
            }
        };

        self.finish();
        result
    }

    /// Programmatic shutdown: tear everything down without a `/quit` call.
    pub async fn shutdown(mut self) -> Result<()> {
        self.state.contexts().remove_all("proxy is shutting down").await;
        self.state
            .contexts()
            .remove_all_tunnels("proxy is shutting down")
            .await;
        if let Some(mut task) = self.ntlm_task.take() {
            abort_task(&mut task).await;
        }
        if let Some(mut task) = self.api_task.take() {
            abort_task(&mut task).await;
        }
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        if let Some(path) = self.ports_path.take() {
            ports::delete_ports_file(&path);
        }
        self.completed = true;
    }
}

async fn abort_task(task: &mut JoinHandle<Result<()>>) {
    task.abort();
    let _ = task.await;
}

fn flatten_join(res: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(anyhow::anyhow!("listener task panicked: {err}")),
    }
}

impl Drop for NtlmProxyHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(path) = self.ports_path.take() {
            ports::delete_ports_file(&path);
        }
        let ntlm_task = self.ntlm_task.take();
        let api_task = self.api_task.take();
        tokio::spawn(async move {
            if let Some(mut task) = ntlm_task {
                abort_task(&mut task).await;
            }
            if let Some(mut task) = api_task {
                abort_task(&mut task).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ntlm::test_engine::StubNtlmEngine;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn test_settings() -> Settings {
        Settings {
            reject_unauthorized: true,
            workstation: "TESTWS".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn builder_requires_an_engine() {
        let result = NtlmProxy::builder().settings(test_settings()).build();

        assert!(result.is_err());
    }

    #[test]
    fn builder_reserves_loopback_ephemeral_ports() {
        let dir = tempdir().unwrap();
        let proxy = NtlmProxy::builder()
            .engine(StubNtlmEngine)
            .settings(test_settings())
            .data_dir(dir.path().to_path_buf())
            .build()
            .unwrap();

        assert!(proxy.ntlm_proxy_addr().ip().is_loopback());
        assert!(proxy.config_api_addr().ip().is_loopback());
        assert_ne!(proxy.ntlm_proxy_addr().port(), 0);
        assert_ne!(proxy.config_api_addr().port(), 0);
        assert_ne!(proxy.ntlm_proxy_addr().port(), proxy.config_api_addr().port());
    }

    #[test]
    fn builder_honors_environment_bind_urls() {
        let dir = tempdir().unwrap();
        // Ephemeral reservation first, to find two ports that are free.
        let probe_a = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let probe_b = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let ntlm_port = probe_a.local_addr().unwrap().port();
        let api_port = probe_b.local_addr().unwrap().port();
        drop(probe_a);
        drop(probe_b);

        let settings = Settings {
            ntlm_proxy_url: Some(format!("http://127.0.0.1:{ntlm_port}")),
            config_api_url: Some(format!("http://127.0.0.1:{api_port}")),
            ..test_settings()
        };
        let proxy = NtlmProxy::builder()
            .engine(StubNtlmEngine)
            .settings(settings)
            .data_dir(dir.path().to_path_buf())
            .build()
            .unwrap();

        assert_eq!(proxy.ntlm_proxy_addr().port(), ntlm_port);
        assert_eq!(proxy.config_api_addr().port(), api_port);
    }

    #[test]
    fn bind_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let taken = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let result = NtlmProxy::builder()
            .engine(StubNtlmEngine)
            .settings(test_settings())
            .data_dir(dir.path().to_path_buf())
            .ntlm_proxy_addr(addr)
            .build();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_writes_and_shutdown_removes_the_ports_file() {
        let dir = tempdir().unwrap();
        let proxy = NtlmProxy::builder()
            .engine(StubNtlmEngine)
            .settings(test_settings())
            .data_dir(dir.path().to_path_buf())
            .build()
            .unwrap();

        let handle = proxy.run().await.unwrap();
        let path = ports::ports_file_path(dir.path());
        let ports = ports::read_ports_file(&path).unwrap();
        assert_eq!(ports.ntlm_proxy_url, proxy.ntlm_proxy_url());
        assert_eq!(ports.config_api_url, proxy.config_api_url());

        handle.shutdown().await.unwrap();
        assert!(!path.exists());
    }
}
