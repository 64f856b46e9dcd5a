use crate::manager::TrackConnections;
use crate::mitm;
use crate::responses::downstream_abort_response;
use crate::responses::text_response;
use crate::state::ProxyState;
use crate::target::CompleteUrl;
use crate::target::Scheme;
use crate::target::normalize_host;
use crate::upstream::UpstreamRoute;
use anyhow::Context as _;
use anyhow::Result;
use rama_core::Layer;
use rama_core::Service;
use rama_core::error::BoxError;
use rama_core::error::ErrorExt as _;
use rama_core::error::OpaqueError;
use rama_core::extensions::ExtensionsMut;
use rama_core::extensions::ExtensionsRef;
use rama_core::layer::AddInputExtensionLayer;
use rama_core::rt::Executor;
use rama_core::service::service_fn;
use rama_http::Body;
use rama_http::HeaderMap;
use rama_http::HeaderName;
use rama_http::Request;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::header;
use rama_http::layer::remove_header::RemoveResponseHeaderLayer;
use rama_http::matcher::MethodMatcher;
use rama_http_backend::client::proxy::layer::HttpProxyConnector;
use rama_http_backend::server::HttpServer;
use rama_http_backend::server::layer::upgrade::UpgradeLayer;
use rama_http_backend::server::layer::upgrade::Upgraded;
use rama_net::Protocol;
use rama_net::client::ConnectorService;
use rama_net::client::EstablishedClientConnection;
use rama_net::http::RequestContext;
use rama_net::proxy::ProxyRequest;
use rama_net::proxy::ProxyTarget;
use rama_net::proxy::StreamForwardService;
use rama_net::stream::SocketInfo;
use rama_tcp::client::Request as TcpRequest;
use rama_tcp::client::service::TcpConnector;
use rama_tcp::server::TcpListener;
use rama_tls_rustls::client::TlsConnectorDataBuilder;
use rama_tls_rustls::client::TlsConnectorLayer;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Route decided at CONNECT time: terminate TLS for NTLM-configured targets,
/// splice bytes opaquely otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectRoute {
    Intercept,
    Passthrough,
}

pub(crate) async fn run_ntlm_proxy(state: Arc<ProxyState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::build()
        .bind(addr)
        .await
        // Rama's `BoxError` lacks an explicit `'static` bound, so it doesn't
        // satisfy `anyhow::Context`; wrap it in `OpaqueError` first.
        .map_err(OpaqueError::from)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("bind NTLM proxy: {addr}"))?;

    run_ntlm_proxy_with_listener(state, listener).await
}

pub(crate) async fn run_ntlm_proxy_with_std_listener(
    state: Arc<ProxyState>,
    listener: StdTcpListener,
) -> Result<()> {
    let listener =
        TcpListener::try_from(listener).context("convert std listener to NTLM proxy listener")?;
    run_ntlm_proxy_with_listener(state, listener).await
}

async fn run_ntlm_proxy_with_listener(
    state: Arc<ProxyState>,
    listener: TcpListener,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("read NTLM proxy listener local addr")?;

    let http_service = HttpServer::auto(Executor::new()).service(
        (
            UpgradeLayer::new(
                MethodMatcher::CONNECT,
                service_fn(connect_accept),
                service_fn(connect_upgrade),
            ),
            RemoveResponseHeaderLayer::hop_by_hop(),
        )
            .into_layer(service_fn(plain_proxy)),
    );

    info!("NTLM proxy listening on {addr}");

    let service = TrackConnections::new(
        state.clone(),
        false,
        AddInputExtensionLayer::new(state).into_layer(http_service),
    );
    listener.serve(service).await;
    Ok(())
}

/// Non-CONNECT proxy requests: resolve the target, pick credentials, and run
/// the exchange on the caller's pinned context.
async fn plain_proxy(mut req: Request) -> Result<Response, Infallible> {
    let Some(state) = req.extensions().get::<Arc<ProxyState>>().cloned() else {
        error!("missing proxy state");
        return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "error"));
    };

    let authority = match RequestContext::try_from(&req).map(|ctx| ctx.host_with_port()) {
        Ok(authority) => authority,
        Err(err) => {
            warn!("missing host: {err}");
            return Ok(text_response(StatusCode::BAD_REQUEST, "missing host"));
        }
    };
    let scheme = if req.uri().scheme_str() == Some("https") {
        Scheme::Https
    } else {
        Scheme::Http
    };
    let target = match CompleteUrl::from_host_port(
        &authority.host.to_string(),
        Some(authority.port),
        scheme,
    ) {
        Ok(target) => target,
        Err(err) => {
            warn!("invalid target host: {err}");
            return Ok(text_response(StatusCode::BAD_REQUEST, "invalid host"));
        }
    };

    remove_hop_by_hop_request_headers(req.headers_mut());
    Ok(intercept_request(&state, &target, req).await)
}

/// Shared interceptor entry for plain proxy requests and decrypted MITM
/// requests: one pinned context per downstream socket, credential lookup by
/// pattern precedence, NTLM handshake on 401 challenges.
pub(crate) async fn intercept_request(
    state: &Arc<ProxyState>,
    target: &CompleteUrl,
    req: Request,
) -> Response {
    let Some(client) = client_address(&req) else {
        // Contexts are keyed by the downstream peer address; without it the
        // pinning invariant cannot hold.
        error!("missing downstream socket info; dropping request");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "error");
    };

    let context = state.contexts().get_or_create(&client, false).await;
    let store = state.credentials().await;
    let credential = store.lookup(target.host(), target.port()).cloned();

    let method = req.method().clone();
    let host = target.host_with_port();
    if credential.is_some() {
        debug!("request to configured host (client={client}, host={host}, method={method})");
    }

    let deps = crate::context::ExchangeDeps {
        router: state.router(),
        trust: state.trust(),
        engine: state.engine(),
        credential: credential.as_ref(),
        workstation: &state.settings().workstation,
    };

    match context.exchange(&deps, target, req).await {
        Ok(resp) => resp,
        Err(failure) => {
            let via_proxy = state.router().resolve(target).is_via_proxy();
            warn!("upstream exchange failed (client={client}, host={host}, error={failure})");
            match failure.response_status(via_proxy) {
                Some(status) => text_response(status, "upstream failure"),
                None => {
                    // Direct path: mirror the upstream abort to the client by
                    // tearing the downstream connection down.
                    context.destroy("upstream socket aborted");
                    downstream_abort_response("upstream socket aborted")
                }
            }
        }
    }
}

/// CONNECT handling: always answer 200, then either terminate TLS (target is
/// NTLM-configured) or splice the raw byte stream.
async fn connect_accept(mut req: Request) -> Result<(Response, Request), Response> {
    let Some(state) = req.extensions().get::<Arc<ProxyState>>().cloned() else {
        error!("missing proxy state");
        return Err(text_response(StatusCode::INTERNAL_SERVER_ERROR, "error"));
    };

    let authority = match RequestContext::try_from(&req).map(|ctx| ctx.host_with_port()) {
        Ok(authority) => authority,
        Err(err) => {
            warn!("CONNECT missing authority: {err}");
            return Err(text_response(StatusCode::BAD_REQUEST, "missing authority"));
        }
    };

    let host = normalize_host(&authority.host.to_string());
    if host.is_empty() {
        return Err(text_response(StatusCode::BAD_REQUEST, "invalid host"));
    }

    let store = state.credentials().await;
    let route = if store.is_configured(&host, authority.port) {
        ConnectRoute::Intercept
    } else {
        ConnectRoute::Passthrough
    };
    let client = client_address(&req).unwrap_or_default();
    debug!("CONNECT accepted (client={client}, host={host}:{port}, route={route:?})", port = authority.port);

    req.extensions_mut().insert(ProxyTarget(authority));
    req.extensions_mut().insert(route);

    Ok((
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty())),
        req,
    ))
}

async fn connect_upgrade(upgraded: Upgraded) -> Result<(), Infallible> {
    match upgraded.extensions().get::<ConnectRoute>().copied() {
        Some(ConnectRoute::Intercept) => {
            if let Err(err) = mitm::mitm_tunnel(upgraded).await {
                warn!("mitm tunnel failed: {err:#}");
            }
        }
        Some(ConnectRoute::Passthrough) => {
            if let Err(err) = passthrough_tunnel(upgraded).await {
                warn!("tunnel error: {err}");
            }
        }
        None => warn!("CONNECT upgrade without a route decision"),
    }
    Ok(())
}

/// Opaque byte pipe to the target (or through the upstream proxy via
/// CONNECT). No plaintext is inspected; lifetime ends when either side closes
/// or the tunnel is torn down by `reset`/shutdown.
async fn passthrough_tunnel(upgraded: Upgraded) -> Result<(), BoxError> {
    let state = upgraded
        .extensions()
        .get::<Arc<ProxyState>>()
        .cloned()
        .ok_or_else(|| OpaqueError::from_display("missing proxy state").into_boxed())?;
    let authority = upgraded
        .extensions()
        .get::<ProxyTarget>()
        .map(|target| target.0.clone())
        .ok_or_else(|| OpaqueError::from_display("missing forward authority").into_boxed())?;
    let client = client_address(&upgraded);

    let target = CompleteUrl::from_host_port(
        &authority.host.to_string(),
        Some(authority.port),
        Scheme::Https,
    )
    .map_err(|err| OpaqueError::from_display(err.to_string()).into_boxed())?;

    let mut extensions = upgraded.extensions().clone();
    if let UpstreamRoute::Via(proxy) = state.router().resolve(&target) {
        extensions.insert(proxy);
    }

    let req = TcpRequest::new_with_extensions(authority.clone(), extensions)
        .with_protocol(Protocol::HTTPS);
    let proxy_connector = HttpProxyConnector::optional(TcpConnector::new());
    let tls_config = TlsConnectorDataBuilder::new()
        .with_alpn_protocols_http_auto()
        .build();
    let connector = TlsConnectorLayer::tunnel(None)
        .with_connector_data(tls_config)
        .into_layer(proxy_connector);
    let EstablishedClientConnection { conn: target_stream, .. } =
        connector.connect(req).await.map_err(|err| {
            OpaqueError::from_boxed(err)
                .with_context(|| format!("establish CONNECT tunnel to {authority}"))
                .into_boxed()
        })?;

    let tunnel_key = client.clone().unwrap_or_default();
    let token = state.contexts().register_tunnel(&tunnel_key).await;

    let proxy_req = ProxyRequest {
        source: upgraded,
        target: target_stream,
    };
    let forward_service = StreamForwardService::default();
    let forward = forward_service.serve(proxy_req);
    let result = tokio::select! {
        _ = token.cancelled() => {
            debug!("ssl tunnel torn down (client={tunnel_key}, target={authority})");
            Ok(())
        }
        res = forward => res.map(|_| ()).map_err(|err| {
            OpaqueError::from_boxed(err.into())
                .with_context(|| format!("forward CONNECT tunnel to {authority}"))
                .into_boxed()
        }),
    };
    state.contexts().remove_tunnel(&tunnel_key).await;
    result
}

pub(crate) fn client_address<T: ExtensionsRef>(input: &T) -> Option<String> {
    input
        .extensions()
        .get::<SocketInfo>()
        .map(|info| info.peer_addr().to_string())
}

pub(crate) fn remove_hop_by_hop_request_headers(headers: &mut HeaderMap) {
    while let Some(raw_connection) = headers.get(header::CONNECTION).cloned() {
        headers.remove(header::CONNECTION);
        if let Ok(raw_connection) = raw_connection.to_str() {
            let connection_headers: Vec<String> = raw_connection
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned)
                .collect();
            for token in connection_headers {
                if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                    headers.remove(name);
                }
            }
        }
    }
    for name in [
        &header::KEEP_ALIVE,
        &header::PROXY_CONNECTION,
        &header::PROXY_AUTHORIZATION,
        &header::TRAILER,
        &header::TRANSFER_ENCODING,
        &header::UPGRADE,
    ] {
        headers.remove(name);
    }

    // 0x74,0x65 is ASCII "te" (the HTTP TE hop-by-hop header).
    if let Ok(short_hop_header_name) = HeaderName::from_bytes(&[0x74, 0x65]) {
        headers.remove(short_hop_header_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Settings;
    use crate::credentials::Credential;
    use crate::pattern::HostPattern;
    use crate::state::test_state::proxy_state_for_tests;
    use pretty_assertions::assert_eq;
    use rama_http::HeaderValue;
    use rama_http::Method;

    fn settings() -> Settings {
        Settings {
            reject_unauthorized: true,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn connect_accept_marks_configured_hosts_for_interception() {
        let (state, _dir) = proxy_state_for_tests(settings());
        state
            .configure_hosts(
                vec![HostPattern::parse("secure.intranet").unwrap()],
                Credential::Sso,
            )
            .await;

        let mut req = Request::builder()
            .method(Method::CONNECT)
            .uri("https://secure.intranet:443")
            .header("host", "secure.intranet:443")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(state);

        let (response, req) = connect_accept(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            req.extensions().get::<ConnectRoute>(),
            Some(&ConnectRoute::Intercept)
        );
    }

    #[tokio::test]
    async fn connect_accept_marks_unconfigured_hosts_for_passthrough() {
        let (state, _dir) = proxy_state_for_tests(settings());

        let mut req = Request::builder()
            .method(Method::CONNECT)
            .uri("https://public.example:443")
            .header("host", "public.example:443")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(state);

        let (response, req) = connect_accept(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            req.extensions().get::<ConnectRoute>(),
            Some(&ConnectRoute::Passthrough)
        );
    }

    #[tokio::test]
    async fn plain_proxy_rejects_requests_without_state() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://example.com/get")
            .body(Body::empty())
            .unwrap();

        let resp = plain_proxy(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn remove_hop_by_hop_request_headers_keeps_end_to_end_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONNECTION,
            HeaderValue::from_static("x-hop, keep-alive"),
        );
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert(
            header::PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic abc"),
        );
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("NTLM abc"),
        );
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));

        remove_hop_by_hop_request_headers(&mut headers);

        assert_eq!(headers.get(header::CONNECTION), None);
        assert_eq!(headers.get("x-hop"), None);
        assert_eq!(headers.get(header::PROXY_AUTHORIZATION), None);
        assert_eq!(
            headers.get(header::AUTHORIZATION),
            Some(&HeaderValue::from_static("NTLM abc"))
        );
        assert_eq!(
            headers.get(header::HOST),
            Some(&HeaderValue::from_static("example.com"))
        );
    }
}
