use crate::config::Settings;
use crate::target::CompleteUrl;
use anyhow::Context;
use anyhow::Result;
use anyhow::ensure;
use rama_net::tls::ApplicationProtocol;
use rama_net::tls::DataEncoding;
use rama_net::tls::client::NegotiatedTlsParameters;
use rama_tls_rustls::client::TlsConnectorData;
use rama_tls_rustls::client::TlsConnectorDataBuilder;
use rama_tls_rustls::dep::pki_types::CertificateDer;
use rama_tls_rustls::dep::pki_types::pem::PemObject;
use rama_tls_rustls::dep::rustls;
use sha2::Digest;
use sha2::Sha256;
use std::fmt::Write as _;
use std::fs;
use tracing::info;
use tracing::warn;

/// Upstream TLS trust policy, fixed at startup.
///
/// Verification is disabled globally by `NODE_TLS_REJECT_UNAUTHORIZED=0` and
/// per-target for loopback hosts (the only scope in which self-signed chains
/// are acceptable). `NODE_EXTRA_CA_CERTS` merges a PEM bundle into the trust
/// store used for all other targets.
#[derive(Clone)]
pub(crate) struct TlsTrust {
    insecure: bool,
    custom_roots: Option<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsTrust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTrust")
            .field("insecure", &self.insecure)
            .field("custom_roots", &self.custom_roots.is_some())
            .finish()
    }
}

impl TlsTrust {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let insecure = !settings.reject_unauthorized;
        if insecure {
            warn!("upstream certificate verification is disabled (NODE_TLS_REJECT_UNAUTHORIZED=0)");
        }
        let custom_roots = match &settings.extra_ca_certs {
            Some(path) if !insecure => Some(
                client_config_with_extra_roots(path)
                    .with_context(|| format!("failed to load CA bundle {}", path.display()))?,
            ),
            _ => None,
        };
        Ok(Self {
            insecure,
            custom_roots,
        })
    }

    /// Connector data for one pinned connection towards `target`.
    pub(crate) fn connector_data_for(&self, target: &CompleteUrl) -> TlsConnectorData {
        if self.insecure || target.is_localhost() {
            return TlsConnectorDataBuilder::new()
                .with_alpn_protocols(&[ApplicationProtocol::HTTP_11])
                .with_no_cert_verifier()
                .with_store_server_certificate_chain(true)
                .build();
        }
        if let Some(config) = &self.custom_roots {
            return TlsConnectorData::from(config.clone());
        }
        TlsConnectorDataBuilder::new()
            .with_alpn_protocols(&[ApplicationProtocol::HTTP_11])
            .with_store_server_certificate_chain(true)
            .build()
    }
}

fn client_config_with_extra_roots(path: &std::path::Path) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        // Individual unparsable system certs are skipped, not fatal.
        let _ = roots.add(cert);
    }

    let pem = fs::read(path).context("failed to read CA bundle")?;
    let mut added = 0usize;
    for cert in CertificateDer::pem_slice_iter(&pem) {
        let cert = cert.map_err(|err| anyhow::anyhow!("invalid certificate in CA bundle: {err:?}"))?;
        roots
            .add(cert)
            .context("failed to add certificate from CA bundle")?;
        added += 1;
    }
    ensure!(added > 0, "CA bundle contains no certificates");
    info!(
        "merged extra CA bundle into the upstream trust store (path={}, certificates={added})",
        path.display()
    );

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![ApplicationProtocol::HTTP_11.as_bytes().to_vec()];
    Ok(config)
}

/// SHA-256 fingerprint of the leaf certificate presented on a TLS exchange,
/// when the connector captured the chain.
pub(crate) fn peer_chain_fingerprint(params: &NegotiatedTlsParameters) -> Option<String> {
    let chain = params.peer_certificate_chain.as_ref()?;
    let leaf: Vec<u8> = match chain {
        DataEncoding::Der(raw) => raw.as_slice().to_vec(),
        DataEncoding::DerStack(stack) => stack.first()?.as_slice().to_vec(),
        DataEncoding::Pem(pem) => CertificateDer::from_pem_slice(pem.as_bytes())
            .ok()?
            .as_ref()
            .to_vec(),
    };
    Some(hex_digest(&leaf))
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut rendered = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(rendered, "{byte:02x}");
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn hex_digest_is_stable_sha256() {
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn trust_from_default_settings_verifies() {
        let trust = TlsTrust::from_settings(&Settings {
            reject_unauthorized: true,
            ..Settings::default()
        })
        .unwrap();

        assert_eq!(trust.insecure, false);
        assert!(trust.custom_roots.is_none());
    }

    #[test]
    fn missing_ca_bundle_fails_startup() {
        let result = TlsTrust::from_settings(&Settings {
            reject_unauthorized: true,
            extra_ca_certs: Some("/definitely/not/a/real/bundle.pem".into()),
            ..Settings::default()
        });

        assert!(result.is_err());
    }

    #[test]
    fn insecure_mode_skips_bundle_loading() {
        let trust = TlsTrust::from_settings(&Settings {
            reject_unauthorized: false,
            extra_ca_certs: Some("/definitely/not/a/real/bundle.pem".into()),
            ..Settings::default()
        })
        .unwrap();

        assert_eq!(trust.insecure, true);
        assert!(trust.custom_roots.is_none());
    }
}
