use rama_core::error::OpaqueError;
use rama_http::StatusCode;
use thiserror::Error;

/// Failure classes surfaced while exchanging with an origin (or the upstream
/// proxy in front of it) on behalf of a downstream client.
///
/// These never crash the proxy; each maps to an HTTP response or an explicit
/// downstream socket close.
#[derive(Debug, Error)]
pub enum UpstreamFailure {
    #[error("failed to establish upstream connection: {0}")]
    Connect(#[source] OpaqueError),
    #[error("upstream certificate verification failed: {0}")]
    TlsVerification(#[source] OpaqueError),
    #[error("upstream socket aborted mid-exchange: {0}")]
    Aborted(#[source] OpaqueError),
    #[error("upstream peer certificate changed across reconnects (origin={origin})")]
    PeerCertMismatch { origin: String },
    #[error("NTLM engine failure: {0}")]
    Engine(#[source] anyhow::Error),
    #[error("connection context torn down while a request was in flight")]
    Cancelled,
}

impl UpstreamFailure {
    /// Classify an error raised while establishing the upstream connection.
    pub(crate) fn from_establish(err: OpaqueError) -> Self {
        if error_chain_mentions_certificate(&err) {
            Self::TlsVerification(err)
        } else {
            Self::Connect(err)
        }
    }

    /// Status to answer the downstream client with, or `None` when the
    /// downstream socket must be torn down instead (direct-path aborts).
    pub(crate) fn response_status(&self, via_upstream_proxy: bool) -> Option<StatusCode> {
        match self {
            Self::Connect(_) => Some(if via_upstream_proxy {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            }),
            Self::TlsVerification(_) => Some(StatusCode::GATEWAY_TIMEOUT),
            Self::Aborted(_) | Self::PeerCertMismatch { .. } => {
                via_upstream_proxy.then_some(StatusCode::GATEWAY_TIMEOUT)
            }
            Self::Engine(_) => Some(StatusCode::BAD_GATEWAY),
            Self::Cancelled => Some(StatusCode::SERVICE_UNAVAILABLE),
        }
    }
}

fn error_chain_mentions_certificate(err: &OpaqueError) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = current {
        let rendered = err.to_string().to_ascii_lowercase();
        if rendered.contains("certificate") || rendered.contains("unknownissuer") {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn establish_errors_classify_tls_failures() {
        let tls = UpstreamFailure::from_establish(OpaqueError::from_display(
            "invalid peer certificate: UnknownIssuer",
        ));
        let connect = UpstreamFailure::from_establish(OpaqueError::from_display(
            "connection refused",
        ));

        assert!(matches!(tls, UpstreamFailure::TlsVerification(_)));
        assert!(matches!(connect, UpstreamFailure::Connect(_)));
    }

    #[test]
    fn aborted_exchanges_respond_only_via_upstream_proxy() {
        let failure = UpstreamFailure::Aborted(OpaqueError::from_display("reset by peer"));

        assert_eq!(failure.response_status(true), Some(StatusCode::GATEWAY_TIMEOUT));
        assert_eq!(failure.response_status(false), None);
    }

    #[test]
    fn tls_failures_respond_504() {
        let failure = UpstreamFailure::TlsVerification(OpaqueError::from_display("bad cert"));

        assert_eq!(failure.response_status(false), Some(StatusCode::GATEWAY_TIMEOUT));
    }

    #[test]
    fn connect_failures_respond_502_when_direct() {
        let failure = UpstreamFailure::Connect(OpaqueError::from_display("refused"));

        assert_eq!(failure.response_status(false), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(failure.response_status(true), Some(StatusCode::GATEWAY_TIMEOUT));
    }
}
