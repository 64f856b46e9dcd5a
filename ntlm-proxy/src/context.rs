use crate::credentials::Credential;
use crate::error::UpstreamFailure;
use crate::ntlm;
use crate::ntlm::HandshakePhase;
use crate::ntlm::HandshakeRequest;
use crate::ntlm::NtlmEngine;
use crate::target::CompleteUrl;
use crate::tls::TlsTrust;
use crate::tls::peer_chain_fingerprint;
use crate::upstream;
use crate::upstream::UpstreamRoute;
use crate::upstream::UpstreamRouter;
use anyhow::Result;
use rama_core::bytes::Bytes;
use rama_core::error::OpaqueError;
use rama_core::extensions::ExtensionsMut;
use rama_core::extensions::ExtensionsRef;
use rama_http::Body;
use rama_http::HeaderMap;
use rama_http::HeaderValue;
use rama_http::Method;
use rama_http::Request;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::Uri;
use rama_http::Version;
use rama_http::header;
use rama_http_backend::client::HttpClientService;
use rama_net::tls::client::NegotiatedTlsParameters;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Per-origin state behind a context: the pinned upstream connection, the
/// handshake phase, and the pinned peer certificate fingerprint.
///
/// The connection is an HTTP/1.1 client over exactly one TCP (and TLS)
/// session. NTLM authenticates the connection, not the request, so the pool
/// size of one is load-bearing.
#[derive(Default)]
struct OriginPin {
    conn: Option<HttpClientService<Body>>,
    phase: HandshakePhase,
    peer_fingerprint: Option<String>,
}

/// State for one downstream TCP connection, keyed by the peer address.
///
/// Created on accept, destroyed when the downstream socket closes, `reset`
/// tears it down (config-API contexts excepted), or the proxy stops. All
/// upstream exchanges for the connection are serialized through the `origins`
/// lock, which realizes the one-socket-per-peer ordering guarantee.
pub(crate) struct ConnectionContext {
    client_address: String,
    config_api: bool,
    cancel: CancellationToken,
    origins: Mutex<HashMap<String, OriginPin>>,
}

/// Everything an exchange needs besides the context itself.
pub(crate) struct ExchangeDeps<'a> {
    pub(crate) router: &'a UpstreamRouter,
    pub(crate) trust: &'a TlsTrust,
    pub(crate) engine: &'a dyn NtlmEngine,
    pub(crate) credential: Option<&'a Credential>,
    /// OS hostname fallback for the NTLM workstation field.
    pub(crate) workstation: &'a str,
}

enum LegFailure {
    /// Establishing a fresh upstream connection failed.
    Establish(UpstreamFailure),
    /// An established connection died; the handshake may restart once on a
    /// fresh socket.
    ConnectionLost(OpaqueError),
    Engine(anyhow::Error),
}

impl ConnectionContext {
    pub(crate) fn new(client_address: String, config_api: bool) -> Self {
        Self {
            client_address,
            config_api,
            cancel: CancellationToken::new(),
            origins: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn is_config_api(&self) -> bool {
        self.config_api
    }

    /// Cancel all in-flight exchanges; pinned connections drop (closing their
    /// sockets) as soon as the aborted handlers release them.
    pub(crate) fn destroy(&self, reason: &str) {
        let client = &self.client_address;
        debug!("destroying connection context (client={client}, reason={reason})");
        self.cancel.cancel();
    }

    /// Forward `req` to `target` on this context's pinned connection,
    /// completing NTLM handshakes when the deps carry a credential and the
    /// origin challenges.
    pub(crate) async fn exchange(
        &self,
        deps: &ExchangeDeps<'_>,
        target: &CompleteUrl,
        req: Request,
    ) -> Result<Response, UpstreamFailure> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(UpstreamFailure::Cancelled),
            result = self.exchange_inner(deps, target, req) => result,
        }
    }

    async fn exchange_inner(
        &self,
        deps: &ExchangeDeps<'_>,
        target: &CompleteUrl,
        req: Request,
    ) -> Result<Response, UpstreamFailure> {
        let route = deps.router.resolve(target);
        let mut origins = self.origins.lock().await;
        let pin = origins.entry(target.origin_key()).or_default();
        match deps.credential {
            None => self.passthrough(pin, &route, deps, target, req).await,
            Some(credential) => {
                self.authenticated_exchange(pin, &route, deps, target, credential, req)
                    .await
            }
        }
    }

    /// No credential configured: exactly one upstream request; the origin's
    /// response (including any 401) is surfaced verbatim.
    async fn passthrough(
        &self,
        pin: &mut OriginPin,
        route: &UpstreamRoute,
        deps: &ExchangeDeps<'_>,
        target: &CompleteUrl,
        req: Request,
    ) -> Result<Response, UpstreamFailure> {
        match self.send_leg(pin, route, deps, target, req).await {
            Ok(resp) => Ok(resp),
            Err(LegFailure::Establish(failure)) => Err(failure),
            Err(LegFailure::ConnectionLost(err)) => Err(UpstreamFailure::Aborted(err)),
            Err(LegFailure::Engine(err)) => Err(UpstreamFailure::Engine(err)),
        }
    }

    async fn authenticated_exchange(
        &self,
        pin: &mut OriginPin,
        route: &UpstreamRoute,
        deps: &ExchangeDeps<'_>,
        target: &CompleteUrl,
        credential: &Credential,
        req: Request,
    ) -> Result<Response, UpstreamFailure> {
        let buffered = BufferedRequest::buffer(req)
            .await
            .map_err(UpstreamFailure::Aborted)?;

        // If the pinned socket dies between handshake legs the whole exchange
        // restarts once from scratch on a fresh socket.
        let mut reconnected = false;
        loop {
            match self
                .run_handshake(pin, route, deps, target, credential, &buffered)
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(LegFailure::ConnectionLost(err)) if !reconnected => {
                    reconnected = true;
                    let client = &self.client_address;
                    let origin = target.origin_key();
                    debug!(
                        "pinned upstream socket lost; restarting handshake on a fresh socket (client={client}, origin={origin}, error={err})"
                    );
                    pin.conn = None;
                    pin.phase = HandshakePhase::Idle;
                }
                Err(LegFailure::ConnectionLost(err)) => {
                    pin.conn = None;
                    pin.phase = HandshakePhase::Failed;
                    return Err(UpstreamFailure::Aborted(err));
                }
                Err(LegFailure::Establish(failure)) => {
                    pin.phase = HandshakePhase::Failed;
                    return Err(failure);
                }
                Err(LegFailure::Engine(err)) => {
                    pin.phase = HandshakePhase::Failed;
                    return Err(UpstreamFailure::Engine(err));
                }
            }
        }
    }

    async fn run_handshake(
        &self,
        pin: &mut OriginPin,
        route: &UpstreamRoute,
        deps: &ExchangeDeps<'_>,
        target: &CompleteUrl,
        credential: &Credential,
        buffered: &BufferedRequest,
    ) -> Result<Response, LegFailure> {
        let client = self.client_address.clone();
        let origin = target.origin_key();

        let resp = self
            .send_leg(pin, route, deps, target, buffered.request()?)
            .await?;
        if !ntlm::offers_challenge(resp.status(), resp.headers()) {
            // Includes plain 401s without an NTLM offer and 407 proxy
            // challenges, all surfaced verbatim.
            return Ok(resp);
        }
        let Some(scheme) = ntlm::challenge_scheme(resp.headers()) else {
            return Ok(resp);
        };

        if pin.phase == HandshakePhase::Authenticated {
            debug!("origin demanded re-authentication (client={client}, origin={origin})");
        }
        pin.phase = HandshakePhase::Idle;
        drain_body(resp).await.map_err(LegFailure::ConnectionLost)?;

        let workstation = effective_workstation(credential, deps.workstation);
        let handshake = HandshakeRequest {
            scheme,
            target,
            workstation: &workstation,
        };

        let type1 = create_type1(deps.engine, credential, &handshake)
            .await
            .map_err(LegFailure::Engine)?;
        pin.phase = HandshakePhase::Type1Sent;
        let resp = self
            .send_leg(
                pin,
                route,
                deps,
                target,
                buffered.request_with_auth(ntlm::authorization_header(scheme, &type1)?)?,
            )
            .await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            // The server accepted (or otherwise answered) the Type 1 without
            // a challenge; its response goes back to the client untouched.
            pin.phase = HandshakePhase::Idle;
            return Ok(resp);
        }
        let Some((scheme, challenge)) = ntlm::challenge_token(resp.headers()) else {
            // A 401 without a Type 2 token: the server refused to negotiate.
            warn!("origin did not produce an NTLM challenge (client={client}, origin={origin})");
            pin.phase = HandshakePhase::Idle;
            return Ok(resp);
        };
        pin.phase = HandshakePhase::Type2Received;
        drain_body(resp).await.map_err(LegFailure::ConnectionLost)?;

        let type3 = create_type3(deps.engine, credential, &challenge, &handshake)
            .await
            .map_err(LegFailure::Engine)?;
        pin.phase = HandshakePhase::Type3Sent;
        let resp = self
            .send_leg(
                pin,
                route,
                deps,
                target,
                buffered.request_with_auth(ntlm::authorization_header(scheme, &type3)?)?,
            )
            .await?;

        if ntlm::offers_challenge(resp.status(), resp.headers()) {
            // The origin rejected our Type 3. Surface the 401 and fall back
            // to Idle so the next request runs a fresh handshake instead of
            // looping.
            warn!("origin rejected NTLM response (client={client}, origin={origin})");
            pin.phase = HandshakePhase::Idle;
            return Ok(resp);
        }

        pin.phase = HandshakePhase::Authenticated;
        info!("NTLM handshake completed (client={client}, origin={origin}, scheme={scheme})");
        Ok(resp)
    }

    /// Send one request on the pinned connection, establishing it first when
    /// absent. An error on an already-established connection invalidates it.
    async fn send_leg(
        &self,
        pin: &mut OriginPin,
        route: &UpstreamRoute,
        deps: &ExchangeDeps<'_>,
        target: &CompleteUrl,
        mut req: Request,
    ) -> Result<Response, LegFailure> {
        if let UpstreamRoute::Via(proxy) = route {
            req.extensions_mut().insert(proxy.clone());
        }

        if let Some(conn) = &pin.conn {
            return match upstream::send_on(conn, req).await {
                Ok(resp) => Ok(resp),
                Err(err) => {
                    pin.conn = None;
                    Err(LegFailure::ConnectionLost(err))
                }
            };
        }

        let tls = deps.trust.connector_data_for(target);
        let (req, conn) = upstream::establish(tls, req)
            .await
            .map_err(|err| LegFailure::Establish(UpstreamFailure::from_establish(err)))?;
        self.check_peer_fingerprint(pin, &conn, target)?;
        match upstream::send_on(&conn, req).await {
            Ok(resp) => {
                pin.conn = Some(conn);
                Ok(resp)
            }
            Err(err) => Err(LegFailure::ConnectionLost(err)),
        }
    }

    /// Pin the peer certificate fingerprint on the first TLS exchange; a
    /// different certificate on a later reconnect is fatal for the context.
    fn check_peer_fingerprint(
        &self,
        pin: &mut OriginPin,
        conn: &HttpClientService<Body>,
        target: &CompleteUrl,
    ) -> Result<(), LegFailure> {
        let Some(params) = conn.extensions().get::<NegotiatedTlsParameters>() else {
            return Ok(());
        };
        let Some(fingerprint) = peer_chain_fingerprint(params) else {
            return Ok(());
        };
        match &pin.peer_fingerprint {
            Some(pinned) if *pinned != fingerprint => {
                let client = &self.client_address;
                let origin = target.origin_key();
                warn!("peer certificate changed across reconnects (client={client}, origin={origin})");
                Err(LegFailure::Establish(UpstreamFailure::PeerCertMismatch {
                    origin,
                }))
            }
            Some(_) => Ok(()),
            None => {
                pin.peer_fingerprint = Some(fingerprint);
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn handshake_phase(&self, target: &CompleteUrl) -> HandshakePhase {
        let origins = self.origins.lock().await;
        origins
            .get(&target.origin_key())
            .map(|pin| pin.phase)
            .unwrap_or_default()
    }
}

fn effective_workstation(credential: &Credential, fallback: &str) -> String {
    match credential {
        Credential::Explicit(creds) => creds.effective_workstation(fallback),
        Credential::Sso => fallback.to_string(),
    }
}

async fn create_type1(
    engine: &dyn NtlmEngine,
    credential: &Credential,
    request: &HandshakeRequest<'_>,
) -> Result<Vec<u8>> {
    match credential {
        Credential::Explicit(creds) => engine.create_type1_from_password(creds, request).await,
        Credential::Sso => engine.create_type1_from_os_token(request).await,
    }
}

async fn create_type3(
    engine: &dyn NtlmEngine,
    credential: &Credential,
    challenge: &[u8],
    request: &HandshakeRequest<'_>,
) -> Result<Vec<u8>> {
    match credential {
        Credential::Explicit(creds) => {
            engine
                .create_type3_from_password(challenge, creds, request)
                .await
        }
        Credential::Sso => engine.create_type3_from_os_token(challenge, request).await,
    }
}

impl From<anyhow::Error> for LegFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::Engine(err)
    }
}

/// The original downstream request, fully buffered so it can be replayed on
/// each handshake leg. Body bytes are kept verbatim.
struct BufferedRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl BufferedRequest {
    async fn buffer(req: Request) -> Result<Self, OpaqueError> {
        let (parts, body) = req.into_parts();
        let mut bytes: Vec<u8> = Vec::new();
        let mut body = body;
        loop {
            match body.chunk().await {
                Ok(Some(chunk)) => bytes.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(err) => {
                    return Err(OpaqueError::from_display(format!(
                        "failed to buffer downstream request body: {err}"
                    )));
                }
            }
        }
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: Bytes::from(bytes),
        })
    }

    fn request(&self) -> Result<Request, OpaqueError> {
        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .version(self.version)
            .body(Body::from(self.body.clone()))
            .map_err(|err| OpaqueError::from_display(format!("failed to rebuild request: {err}")))?;
        *req.headers_mut() = self.headers.clone();
        Ok(req)
    }

    fn request_with_auth(&self, auth: HeaderValue) -> Result<Request, OpaqueError> {
        let mut req = self.request()?;
        req.headers_mut().insert(header::AUTHORIZATION, auth);
        Ok(req)
    }
}

impl From<OpaqueError> for LegFailure {
    fn from(err: OpaqueError) -> Self {
        Self::ConnectionLost(err)
    }
}

async fn drain_body(resp: Response) -> Result<(), OpaqueError> {
    let mut body = resp.into_body();
    loop {
        match body.chunk().await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(()),
            Err(err) => {
                return Err(OpaqueError::from_display(format!(
                    "failed to drain challenge body: {err}"
                )));
            }
        }
    }
}
