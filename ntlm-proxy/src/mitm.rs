use crate::certs::MitmCertificateAuthority;
use crate::http_proxy::intercept_request;
use crate::responses::text_response;
use crate::state::ProxyState;
use crate::target::CompleteUrl;
use crate::target::Scheme;
use crate::target::normalize_host;
use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use rama_core::Layer;
use rama_core::Service;
use rama_core::extensions::ExtensionsRef;
use rama_core::rt::Executor;
use rama_core::service::service_fn;
use rama_http::HeaderValue;
use rama_http::Request;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::Uri;
use rama_http::header::HOST;
use rama_http::layer::remove_header::RemoveRequestHeaderLayer;
use rama_http::layer::remove_header::RemoveResponseHeaderLayer;
use rama_http_backend::server::HttpServer;
use rama_http_backend::server::layer::upgrade::Upgraded;
use rama_net::proxy::ProxyTarget;
use rama_tls_rustls::server::TlsAcceptorData;
use rama_tls_rustls::server::TlsAcceptorLayer;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// TLS-termination state for intercepted CONNECT targets: the managed CA that
/// issues per-host leaf certificates.
pub(crate) struct MitmState {
    ca: MitmCertificateAuthority,
}

impl std::fmt::Debug for MitmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // CA material stays out of logs.
        f.debug_struct("MitmState").finish_non_exhaustive()
    }
}

impl MitmState {
    pub(crate) fn new(ca_dir: &Path) -> Result<Self> {
        Ok(Self {
            ca: MitmCertificateAuthority::load_or_create(ca_dir)?,
        })
    }

    fn tls_acceptor_data_for_host(&self, host: &str) -> Result<TlsAcceptorData> {
        self.ca.tls_acceptor_data_for_host(host)
    }
}

struct MitmTunnelContext {
    state: Arc<ProxyState>,
    target_host: String,
    target_port: u16,
}

/// Terminate an upgraded CONNECT stream with a generated leaf cert and feed
/// the decrypted inner requests through the NTLM interceptor. The inner
/// requests carry the original downstream socket info, so they share the
/// connection context (and pinned upstream socket) of the CONNECT itself.
pub(crate) async fn mitm_tunnel(upgraded: Upgraded) -> Result<()> {
    let state = upgraded
        .extensions()
        .get::<Arc<ProxyState>>()
        .cloned()
        .context("missing proxy state")?;
    let target = upgraded
        .extensions()
        .get::<ProxyTarget>()
        .context("missing proxy target")?
        .0
        .clone();
    let target_host = normalize_host(&target.host.to_string());
    let target_port = target.port;

    let mitm = state.mitm_state()?;
    let acceptor_data = mitm.tls_acceptor_data_for_host(&target_host)?;

    let executor = upgraded
        .extensions()
        .get::<Executor>()
        .cloned()
        .unwrap_or_default();

    let tunnel_ctx = Arc::new(MitmTunnelContext {
        state,
        target_host,
        target_port,
    });

    let http_service = HttpServer::auto(executor).service(
        (
            RemoveResponseHeaderLayer::hop_by_hop(),
            RemoveRequestHeaderLayer::hop_by_hop(),
        )
            .into_layer(service_fn({
                let tunnel_ctx = tunnel_ctx.clone();
                move |req| {
                    let tunnel_ctx = tunnel_ctx.clone();
                    async move { handle_mitm_request(req, tunnel_ctx).await }
                }
            })),
    );

    let https_service = TlsAcceptorLayer::new(acceptor_data)
        .with_store_client_hello(true)
        .into_layer(http_service);

    https_service
        .serve(upgraded)
        .await
        .map_err(|err| anyhow!("mitm serve error: {err}"))?;
    Ok(())
}

async fn handle_mitm_request(
    req: Request,
    tunnel_ctx: Arc<MitmTunnelContext>,
) -> Result<Response, std::convert::Infallible> {
    let response = match forward_inner_request(req, &tunnel_ctx).await {
        Ok(resp) => resp,
        Err(err) => {
            warn!("mitm request handling failed: {err:#}");
            text_response(StatusCode::BAD_GATEWAY, "mitm upstream error")
        }
    };
    Ok(response)
}

async fn forward_inner_request(
    req: Request,
    tunnel_ctx: &MitmTunnelContext,
) -> Result<Response> {
    if req.method().as_str() == "CONNECT" {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "CONNECT not supported inside an intercepted tunnel",
        ));
    }

    // The inner request's Host must agree with the CONNECT authority; a
    // mismatch would let a client smuggle requests for other origins through
    // an authenticated tunnel.
    if let Some(request_host) = extract_request_host(&req) {
        let normalized = normalize_host(&request_host);
        if !normalized.is_empty() && normalized != tunnel_ctx.target_host {
            warn!(
                "mitm host mismatch (target={}, request_host={normalized})",
                tunnel_ctx.target_host
            );
            return Ok(text_response(StatusCode::BAD_REQUEST, "host mismatch"));
        }
    }

    let target = CompleteUrl::from_host_port(
        &tunnel_ctx.target_host,
        Some(tunnel_ctx.target_port),
        Scheme::Https,
    )?;

    let (mut parts, body) = req.into_parts();
    let authority = authority_header_value(&tunnel_ctx.target_host, tunnel_ctx.target_port);
    let path = parts
        .uri
        .path_and_query()
        .map(rama_http::uri::PathAndQuery::as_str)
        .unwrap_or("/")
        .to_string();
    parts.uri = build_https_uri(&authority, &path)?;
    parts.headers.insert(HOST, HeaderValue::from_str(&authority)?);
    let req = Request::from_parts(parts, body);

    Ok(intercept_request(&tunnel_ctx.state, &target, req).await)
}

fn extract_request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

fn authority_header_value(host: &str, port: u16) -> String {
    if host.contains(':') {
        if port == 443 {
            format!("[{host}]")
        } else {
            format!("[{host}]:{port}")
        }
    } else if port == 443 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

fn build_https_uri(authority: &str, path: &str) -> Result<Uri> {
    let target = format!("https://{authority}{path}");
    Ok(target.parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn authority_header_value_elides_default_port() {
        assert_eq!(authority_header_value("example.com", 443), "example.com");
        assert_eq!(
            authority_header_value("example.com", 8443),
            "example.com:8443"
        );
        assert_eq!(authority_header_value("::1", 443), "[::1]");
        assert_eq!(authority_header_value("::1", 8443), "[::1]:8443");
    }

    #[test]
    fn build_https_uri_combines_authority_and_path() {
        let uri = build_https_uri("example.com:8443", "/api?q=1").unwrap();

        assert_eq!(uri.to_string(), "https://example.com:8443/api?q=1");
    }
}
