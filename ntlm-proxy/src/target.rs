use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use anyhow::ensure;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-resolved request target: scheme, normalized host, and a concrete
/// port (defaulted from the scheme when absent). Immutable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompleteUrl {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl CompleteUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let parsed = Url::parse(input).with_context(|| format!("invalid target url: {input}"))?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => bail!("unsupported target scheme: {other}"),
        };
        let host = parsed
            .host_str()
            .with_context(|| format!("missing host in target url: {input}"))?;
        Self::from_host_port(host, parsed.port(), scheme)
    }

    pub fn from_host_port(host: &str, port: Option<u16>, scheme: Scheme) -> Result<Self> {
        let host = normalize_host(host);
        ensure!(!host.is_empty(), "empty host in target");
        Ok(Self {
            scheme,
            host,
            port: port.unwrap_or(scheme.default_port()),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ssl(&self) -> bool {
        self.scheme == Scheme::Https
    }

    pub fn host_with_port(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    /// Canonical URL string with the default port elided, root path included.
    pub fn href(&self) -> String {
        if self.port == self.scheme.default_port() {
            format!("{}://{}/", self.scheme, self.bracketed_host())
        } else {
            format!("{}://{}:{}/", self.scheme, self.bracketed_host(), self.port)
        }
    }

    /// True iff the host is a loopback name or literal (`localhost`,
    /// `127.0.0.1`, `::1`).
    pub fn is_localhost(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }

    /// Stable key identifying the upstream origin this target resolves to.
    pub(crate) fn origin_key(&self) -> String {
        format!("{}://{}", self.scheme, self.host_with_port())
    }

    fn bracketed_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

/// Normalize host fragments for matching (trim, strip brackets and a single
/// trailing port, lowercase, drop trailing dots).
pub(crate) fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with('[')
        && let Some(end) = host.find(']')
    {
        return normalize_dns_host(&host[1..end]);
    }

    // Strip `:port` only when there is exactly one `:` so unbracketed IPv6
    // literals survive untouched.
    if host.bytes().filter(|b| *b == b':').count() == 1 {
        let host = host.split(':').next().unwrap_or_default();
        return normalize_dns_host(host);
    }

    normalize_dns_host(host)
}

fn normalize_dns_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    host.trim_end_matches('.').to_string()
}
