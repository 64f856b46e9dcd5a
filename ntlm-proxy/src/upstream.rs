use crate::config::Settings;
use crate::noproxy::NoProxyRules;
use crate::target::CompleteUrl;
use crate::tls::TlsTrust;
use rama_core::Layer;
use rama_core::Service;
use rama_core::error::BoxError;
use rama_core::error::OpaqueError;
use rama_core::extensions::ExtensionsMut;
use rama_core::extensions::ExtensionsRef;
use rama_core::service::BoxService;
use rama_http::Body;
use rama_http::Request;
use rama_http::Response;
use rama_http::layer::version_adapter::RequestVersionAdapter;
use rama_http_backend::client::HttpClientService;
use rama_http_backend::client::HttpConnector;
use rama_http_backend::client::proxy::layer::HttpProxyConnectorLayer;
use rama_net::address::ProxyAddress;
use rama_net::client::EstablishedClientConnection;
use rama_tcp::client::service::TcpConnector;
use rama_tls_rustls::client::TlsConnectorData;
use rama_tls_rustls::client::TlsConnectorLayer;
use tracing::warn;

/// Route decision for one outbound connection.
#[derive(Clone, Debug)]
pub(crate) enum UpstreamRoute {
    Direct,
    Via(ProxyAddress),
}

impl UpstreamRoute {
    pub(crate) fn is_via_proxy(&self) -> bool {
        matches!(self, Self::Via(_))
    }
}

/// Decides whether an outbound connection goes direct or through a corporate
/// upstream proxy, from the `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` snapshot.
#[derive(Clone, Debug, Default)]
pub(crate) struct UpstreamRouter {
    http: Option<ProxyAddress>,
    https: Option<ProxyAddress>,
    no_proxy: NoProxyRules,
}

impl UpstreamRouter {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            http: parse_proxy_address("HTTP_PROXY", settings.http_proxy.as_deref()),
            https: parse_proxy_address("HTTPS_PROXY", settings.https_proxy.as_deref()),
            no_proxy: NoProxyRules::parse(settings.no_proxy.as_deref()),
        }
    }

    /// `HTTPS_PROXY` overrides `HTTP_PROXY` for TLS targets. A plain-HTTP
    /// target with only `HTTPS_PROXY` configured goes direct.
    pub(crate) fn resolve(&self, target: &CompleteUrl) -> UpstreamRoute {
        if self.no_proxy.bypasses(target) {
            return UpstreamRoute::Direct;
        }
        let proxy = if target.is_ssl() {
            self.https.as_ref().or(self.http.as_ref())
        } else {
            self.http.as_ref()
        };
        match proxy {
            Some(proxy) => UpstreamRoute::Via(proxy.clone()),
            None => UpstreamRoute::Direct,
        }
    }
}

fn parse_proxy_address(key: &'static str, value: Option<&str>) -> Option<ProxyAddress> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match ProxyAddress::try_from(value) {
        Ok(proxy) => {
            if proxy
                .protocol
                .as_ref()
                .map(rama_net::Protocol::is_http)
                .unwrap_or(true)
            {
                return Some(proxy);
            }
            warn!("ignoring {key}: non-http proxy protocol");
            None
        }
        Err(err) => {
            warn!("ignoring {key}: invalid proxy address ({err})");
            None
        }
    }
}

type Connector = BoxService<
    Request<Body>,
    EstablishedClientConnection<HttpClientService<Body>, Request<Body>>,
    BoxError,
>;

fn build_connector(tls: TlsConnectorData) -> Connector {
    let transport = TcpConnector::default();
    let proxy = HttpProxyConnectorLayer::optional().into_layer(transport);
    let tls = TlsConnectorLayer::auto()
        .with_connector_data(tls)
        .into_layer(proxy);
    let tls = RequestVersionAdapter::new(tls);
    let connector = HttpConnector::new(tls);
    connector.boxed()
}

/// Establish one upstream HTTP connection for `req` and hand back both the
/// (connector-adjusted) request and the connection. The returned connection is
/// the pinned "agent of one socket": every subsequent request serialized onto
/// it reuses the same TCP (and TLS) session.
pub(crate) async fn establish(
    tls: TlsConnectorData,
    req: Request<Body>,
) -> Result<(Request<Body>, HttpClientService<Body>), OpaqueError> {
    let connector = build_connector(tls);
    let EstablishedClientConnection { input: req, conn } = connector
        .serve(req)
        .await
        .map_err(OpaqueError::from_boxed)?;
    Ok((req, conn))
}

/// Send one request on a pinned connection, inheriting the connection-level
/// extensions (negotiated TLS parameters, proxy routing) the connector left
/// behind.
pub(crate) async fn send_on(
    conn: &HttpClientService<Body>,
    mut req: Request<Body>,
) -> Result<Response, OpaqueError> {
    req.extensions_mut().extend(conn.extensions().clone());
    conn.serve(req).await.map_err(OpaqueError::from_boxed)
}

/// Ephemeral, unpinned upstream client. Not tracked by the connection context
/// manager, so `reset` can never sever a request sent through it; used for
/// config-API-side traffic.
pub(crate) struct UntrackedClient {
    route: UpstreamRoute,
    trust: TlsTrust,
    target: CompleteUrl,
}

impl UntrackedClient {
    pub(crate) fn new(router: &UpstreamRouter, trust: &TlsTrust, target: CompleteUrl) -> Self {
        Self {
            route: router.resolve(&target),
            trust: trust.clone(),
            target,
        }
    }

    pub(crate) async fn send(&self, mut req: Request<Body>) -> Result<Response, OpaqueError> {
        if let UpstreamRoute::Via(proxy) = &self.route {
            req.extensions_mut().insert(proxy.clone());
        }
        let (req, conn) = establish(self.trust.connector_data_for(&self.target), req).await?;
        send_on(&conn, req).await
    }
}
