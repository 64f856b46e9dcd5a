use crate::credentials::Credential;
use crate::credentials::ExplicitCredentials;
use crate::credentials::NtlmVersion;
use crate::manager::TrackConnections;
use crate::pattern::HostPattern;
use crate::responses::json_error;
use crate::responses::json_response;
use crate::responses::text_response;
use crate::state::ProxyState;
use anyhow::Context as _;
use anyhow::Result;
use rama_core::Layer;
use rama_core::error::OpaqueError;
use rama_core::layer::AddInputExtensionLayer;
use rama_core::rt::Executor;
use rama_core::service::service_fn;
use rama_http::Request;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http_backend::server::HttpServer;
use rama_tcp::server::TcpListener;
use serde::Deserialize;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use tracing::info;
use tracing::warn;

const CONFIG_BODY_LIMIT: usize = 64 * 1024;

pub(crate) async fn run_config_api(state: Arc<ProxyState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::build()
        .bind(addr)
        .await
        // See `http_proxy.rs` for why `BoxError` is wrapped before anyhow.
        .map_err(OpaqueError::from)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("bind config API: {addr}"))?;

    run_config_api_with_listener(state, listener).await
}

pub(crate) async fn run_config_api_with_std_listener(
    state: Arc<ProxyState>,
    listener: StdTcpListener,
) -> Result<()> {
    let listener =
        TcpListener::try_from(listener).context("convert std listener to config API listener")?;
    run_config_api_with_listener(state, listener).await
}

async fn run_config_api_with_listener(
    state: Arc<ProxyState>,
    listener: TcpListener,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("read config API listener local addr")?;

    let handler_state = state.clone();
    let http_service = HttpServer::auto(Executor::new()).service(service_fn(move |req| {
        let state = handler_state.clone();
        async move { handle_config_request(state, req).await }
    }));

    info!("config API listening on {addr}");

    // Config-API connections are tracked too, flagged so `reset`/`quit` leave
    // them alive while tearing everything else down.
    let service = TrackConnections::new(
        state.clone(),
        true,
        AddInputExtensionLayer::new(state).into_layer(http_service),
    );
    listener.serve(service).await;
    Ok(())
}

async fn handle_config_request(
    state: Arc<ProxyState>,
    req: Request,
) -> Result<Response, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match (method.as_str(), path.as_str()) {
        ("GET", "/alive") => json_response(&AliveResponse {
            status: "ok",
            version: ProxyState::version(),
        }),
        ("POST", "/ntlm-config") => match read_json_body::<NtlmConfigRequest>(req).await {
            Ok(body) => apply_ntlm_config(&state, body).await,
            Err(message) => json_error(StatusCode::BAD_REQUEST, &message),
        },
        ("POST", "/ntlm-sso-config") => match read_json_body::<NtlmSsoConfigRequest>(req).await {
            Ok(body) => apply_ntlm_sso_config(&state, body).await,
            Err(message) => json_error(StatusCode::BAD_REQUEST, &message),
        },
        ("POST", "/reset") => {
            state.reset("reset requested via config API").await;
            json_response(&StatusResponse { status: "ok" })
        }
        ("POST", "/quit") => {
            info!("quit requested via config API");
            state
                .contexts()
                .remove_all("proxy is shutting down")
                .await;
            state
                .contexts()
                .remove_all_tunnels("proxy is shutting down")
                .await;
            state.begin_shutdown();
            json_response(&StatusResponse { status: "ok" })
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn apply_ntlm_config(state: &Arc<ProxyState>, body: NtlmConfigRequest) -> Response {
    let ntlm_version = match body.ntlm_version {
        None => NtlmVersion::V2,
        Some(value) => match NtlmVersion::from_wire(value) {
            Some(version) => version,
            None => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    &format!("ntlmVersion must be 1 or 2, got {value}"),
                );
            }
        },
    };
    if body.username.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "username must not be empty");
    }

    let patterns = match parse_host_patterns(&body.ntlm_hosts) {
        Ok(patterns) => patterns,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, &message),
    };

    let credential = Credential::Explicit(ExplicitCredentials {
        username: body.username,
        password: body.password,
        domain: body.domain,
        workstation: body.workstation,
        ntlm_version,
    });
    state.configure_hosts(patterns, credential).await;
    json_response(&StatusResponse { status: "ok" })
}

async fn apply_ntlm_sso_config(state: &Arc<ProxyState>, body: NtlmSsoConfigRequest) -> Response {
    if !cfg!(windows) {
        warn!("rejecting SSO configuration: not supported on this platform");
        return json_error(
            StatusCode::BAD_REQUEST,
            "SSO is only supported on Windows",
        );
    }

    let patterns = match parse_host_patterns(&body.ntlm_hosts) {
        Ok(patterns) => patterns,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, &message),
    };

    state.configure_hosts(patterns, Credential::Sso).await;
    json_response(&StatusResponse { status: "ok" })
}

fn parse_host_patterns(hosts: &[String]) -> Result<Vec<HostPattern>, String> {
    if hosts.is_empty() {
        return Err("ntlmHosts must not be empty".to_string());
    }
    hosts
        .iter()
        .map(|host| HostPattern::parse(host).map_err(|err| format!("invalid ntlmHosts entry: {err}")))
        .collect()
}

/// Drain the request body (bounded) and deserialize it as JSON.
async fn read_json_body<T: for<'de> Deserialize<'de>>(req: Request) -> Result<T, String> {
    let mut body = req.into_body();
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = match body.chunk().await {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("failed to read config body: {err}");
                return Err("invalid body".to_string());
            }
        };
        let Some(chunk) = chunk else {
            break;
        };

        if buf.len().saturating_add(chunk.len()) > CONFIG_BODY_LIMIT {
            return Err("body too large".to_string());
        }
        buf.extend_from_slice(&chunk);
    }

    if buf.is_empty() {
        return Err("missing body".to_string());
    }
    serde_json::from_slice(&buf).map_err(|err| format!("invalid json: {err}"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NtlmConfigRequest {
    ntlm_hosts: Vec<String>,
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    workstation: Option<String>,
    #[serde(default)]
    ntlm_version: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NtlmSsoConfigRequest {
    ntlm_hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AliveResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Settings;
    use crate::state::test_state::proxy_state_for_tests;
    use pretty_assertions::assert_eq;
    use rama_http::Body;
    use rama_http::Method;

    fn settings() -> Settings {
        Settings {
            reject_unauthorized: true,
            ..Settings::default()
        }
    }

    fn post(path: &str, body: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn alive_reports_version() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = Request::builder()
            .method(Method::GET)
            .uri("/alive")
            .body(Body::empty())
            .unwrap();

        let resp = handle_config_request(state, req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ntlm_config_upserts_credentials() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = post(
            "/ntlm-config",
            r#"{
                "ntlmHosts": ["files.intranet", "*.corp", "api.host:8080"],
                "username": "nisse",
                "password": "manpower",
                "domain": "mptst",
                "ntlmVersion": 2
            }"#,
        );

        let resp = handle_config_request(state.clone(), req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let store = state.credentials().await;
        assert_eq!(store.len(), 3);
        assert!(store.is_configured("files.intranet", 80));
        assert!(store.is_configured("www.corp", 443));
        assert!(store.is_configured("api.host", 8080));
        assert!(!store.is_configured("api.host", 9090));
    }

    #[tokio::test]
    async fn ntlm_config_rejects_empty_host_list() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = post(
            "/ntlm-config",
            r#"{"ntlmHosts": [], "username": "nisse", "password": "x"}"#,
        );

        let resp = handle_config_request(state, req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ntlm_config_rejects_hosts_with_scheme_or_path() {
        let (state, _dir) = proxy_state_for_tests(settings());
        for bad in ["http://files.intranet", "files.intranet/path"] {
            let req = post(
                "/ntlm-config",
                &format!(r#"{{"ntlmHosts": ["{bad}"], "username": "nisse", "password": "x"}}"#),
            );
            let resp = handle_config_request(state.clone(), req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{bad}");
        }
    }

    #[tokio::test]
    async fn ntlm_config_rejects_wildcard_pattern_with_port() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = post(
            "/ntlm-config",
            r#"{"ntlmHosts": ["*.intranet:8080"], "username": "nisse", "password": "x"}"#,
        );

        let resp = handle_config_request(state, req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ntlm_config_rejects_bad_ntlm_version() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = post(
            "/ntlm-config",
            r#"{"ntlmHosts": ["h"], "username": "nisse", "password": "x", "ntlmVersion": 3}"#,
        );

        let resp = handle_config_request(state, req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_is_a_400() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = post("/ntlm-config", "{not json");

        let resp = handle_config_request(state, req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn sso_config_is_rejected_off_windows() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = post("/ntlm-sso-config", r#"{"ntlmHosts": ["*.intranet"]}"#);

        let resp = handle_config_request(state, req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reset_clears_store_and_non_config_contexts() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = post(
            "/ntlm-config",
            r#"{"ntlmHosts": ["files.intranet"], "username": "nisse", "password": "x"}"#,
        );
        handle_config_request(state.clone(), req).await.unwrap();
        state.contexts().get_or_create("127.0.0.1:7001", false).await;
        state.contexts().get_or_create("127.0.0.1:7002", true).await;

        let resp = handle_config_request(
            state.clone(),
            post("/reset", ""),
        )
        .await
        .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.credentials().await.is_empty(), true);
        assert_eq!(state.contexts().context_count().await, 1);
    }

    #[tokio::test]
    async fn quit_triggers_the_shutdown_signal() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let token = state.shutdown_token();

        let resp = handle_config_request(state, post("/quit", "")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn unknown_route_is_a_404() {
        let (state, _dir) = proxy_state_for_tests(settings());
        let req = Request::builder()
            .method(Method::GET)
            .uri("/nope")
            .body(Body::empty())
            .unwrap();

        let resp = handle_config_request(state, req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
