use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

/// Immutable snapshot of the process environment, taken once at startup and
/// passed explicitly into every component that needs it.
///
/// Only the canonical uppercase variable names are recognized; lowercase
/// variants are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub config_api_url: Option<String>,
    pub ntlm_proxy_url: Option<String>,
    /// False iff `NODE_TLS_REJECT_UNAUTHORIZED=0`.
    pub reject_unauthorized: bool,
    /// PEM bundle added to the upstream trust store (`NODE_EXTRA_CA_CERTS`).
    pub extra_ca_certs: Option<PathBuf>,
    /// Default NTLM workstation name, captured from the OS hostname.
    pub workstation: String,
}

pub const HTTP_PROXY_ENV_KEY: &str = "HTTP_PROXY";
pub const HTTPS_PROXY_ENV_KEY: &str = "HTTPS_PROXY";
pub const NO_PROXY_ENV_KEY: &str = "NO_PROXY";
pub const CONFIG_API_ENV_KEY: &str = "CYPRESS_NTLM_AUTH_API";
pub const NTLM_PROXY_ENV_KEY: &str = "CYPRESS_NTLM_AUTH_PROXY";
pub const TLS_REJECT_UNAUTHORIZED_ENV_KEY: &str = "NODE_TLS_REJECT_UNAUTHORIZED";
pub const EXTRA_CA_CERTS_ENV_KEY: &str = "NODE_EXTRA_CA_CERTS";

impl Settings {
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&env)
    }

    pub fn from_vars(env: &HashMap<String, String>) -> Self {
        Self {
            http_proxy: non_empty(env, HTTP_PROXY_ENV_KEY),
            https_proxy: non_empty(env, HTTPS_PROXY_ENV_KEY),
            no_proxy: non_empty(env, NO_PROXY_ENV_KEY),
            config_api_url: non_empty(env, CONFIG_API_ENV_KEY),
            ntlm_proxy_url: non_empty(env, NTLM_PROXY_ENV_KEY),
            reject_unauthorized: env
                .get(TLS_REJECT_UNAUTHORIZED_ENV_KEY)
                .map(|value| value.trim() != "0")
                .unwrap_or(true),
            extra_ca_certs: non_empty(env, EXTRA_CA_CERTS_ENV_KEY).map(PathBuf::from),
            workstation: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }
}

fn non_empty(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Resolve a loose bind address (`http://127.0.0.1:8080`, `localhost:8080`,
/// plain `8080`-less host) into a concrete loopback-friendly socket address.
pub(crate) fn resolve_bind_addr(url: &str, default_port: u16) -> Result<SocketAddr> {
    let parts = parse_host_port(url, default_port)?;
    let host = if parts.host.eq_ignore_ascii_case("localhost") {
        "127.0.0.1".to_string()
    } else {
        parts.host
    };
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(SocketAddr::new(ip, parts.port)),
        Err(_) => Ok(SocketAddr::from(([127, 0, 0, 1], parts.port))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SocketAddressParts {
    host: String,
    port: u16,
}

fn parse_host_port(url: &str, default_port: u16) -> Result<SocketAddressParts> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        bail!("missing host in listener address: {url}");
    }

    // Avoid treating unbracketed IPv6 literals like "::1" as scheme-prefixed URLs.
    if matches!(trimmed.parse::<IpAddr>(), Ok(IpAddr::V6(_))) && !trimmed.starts_with('[') {
        return Ok(SocketAddressParts {
            host: trimmed.to_string(),
            port: default_port,
        });
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let parsed = Url::parse(&candidate).with_context(|| format!("invalid listener address: {url}"))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("missing host in listener address: {url}"))?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    if host.is_empty() {
        bail!("missing host in listener address: {url}");
    }
    Ok(SocketAddressParts {
        host,
        port: parsed.port().unwrap_or(default_port),
    })
}
