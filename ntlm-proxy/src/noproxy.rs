use crate::target::CompleteUrl;
use crate::target::normalize_host;

/// Token that suppresses the implicit loopback bypass entries.
const NO_LOOPBACK_TOKEN: &str = "<-loopback>";

/// Parsed `NO_PROXY` rules deciding whether a target bypasses the upstream
/// proxy.
///
/// When no bypass list is supplied, `localhost` and `127.0.0.1` are bypassed
/// implicitly; the `<-loopback>` token suppresses that default. A
/// user-supplied list replaces the implicit entries entirely, so
/// `NO_PROXY=google.com` routes loopback targets through the upstream proxy.
#[derive(Clone, Debug, Default)]
pub struct NoProxyRules {
    tokens: Vec<NoProxyToken>,
    bypass_loopback: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum NoProxyToken {
    All,
    Suffix(String),
    Prefix(String),
    Exact { host: String, port: Option<u16> },
}

impl NoProxyRules {
    pub fn parse(value: Option<&str>) -> Self {
        let raw = value.unwrap_or_default();
        let mut saw_loopback_token = false;
        let mut tokens = Vec::new();
        for token in raw.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if token.eq_ignore_ascii_case(NO_LOOPBACK_TOKEN) {
                saw_loopback_token = true;
                continue;
            }
            tokens.push(Self::parse_token(token));
        }
        // The implicit loopback entries stand in for an absent list only.
        let bypass_loopback = !saw_loopback_token && tokens.is_empty();
        Self {
            tokens,
            bypass_loopback,
        }
    }

    fn parse_token(token: &str) -> NoProxyToken {
        if token == "*" {
            return NoProxyToken::All;
        }
        if let Some(suffix) = token.strip_prefix('*') {
            return NoProxyToken::Suffix(suffix.to_ascii_lowercase());
        }
        if let Some(prefix) = token.strip_suffix('*') {
            return NoProxyToken::Prefix(prefix.to_ascii_lowercase());
        }
        match token.bytes().filter(|b| *b == b':').count() {
            1 => {
                let (host, port) = token.split_once(':').unwrap_or((token, ""));
                NoProxyToken::Exact {
                    host: normalize_host(host),
                    port: port.parse::<u16>().ok(),
                }
            }
            _ => NoProxyToken::Exact {
                host: normalize_host(token),
                port: None,
            },
        }
    }

    /// True when the target must be reached directly, regardless of the
    /// configured upstream proxies.
    pub fn bypasses(&self, target: &CompleteUrl) -> bool {
        let host = target.host();
        if self.bypass_loopback && matches!(host, "localhost" | "127.0.0.1") {
            return true;
        }
        self.tokens.iter().any(|token| match token {
            NoProxyToken::All => true,
            NoProxyToken::Suffix(suffix) => host.ends_with(suffix),
            NoProxyToken::Prefix(prefix) => host.starts_with(prefix),
            NoProxyToken::Exact { host: exact, port } => {
                host == exact && port.map(|p| p == target.port()).unwrap_or(true)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn target(url: &str) -> CompleteUrl {
        CompleteUrl::parse(url).unwrap()
    }

    #[test]
    fn loopback_is_bypassed_implicitly() {
        let rules = NoProxyRules::parse(None);

        assert_eq!(rules.bypasses(&target("http://localhost:5000")), true);
        assert_eq!(rules.bypasses(&target("http://127.0.0.1:5000")), true);
        assert_eq!(rules.bypasses(&target("http://example.com")), false);
    }

    #[test]
    fn loopback_token_disables_implicit_bypass() {
        let rules = NoProxyRules::parse(Some("<-loopback>"));

        assert_eq!(rules.bypasses(&target("http://localhost:5000")), false);
        assert_eq!(rules.bypasses(&target("http://127.0.0.1:5000")), false);
    }

    #[test]
    fn star_alone_bypasses_everything() {
        let rules = NoProxyRules::parse(Some("*"));

        assert_eq!(rules.bypasses(&target("http://example.com")), true);
    }

    #[test]
    fn leading_star_is_a_suffix_match() {
        let rules = NoProxyRules::parse(Some("<-loopback>,*host"));

        assert_eq!(rules.bypasses(&target("http://localhost:5000")), true);
        assert_eq!(rules.bypasses(&target("http://myhost:5000")), true);
        assert_eq!(rules.bypasses(&target("http://hostile.example")), false);
    }

    #[test]
    fn trailing_star_is_a_prefix_match() {
        let rules = NoProxyRules::parse(Some("<-loopback>,local*"));

        assert_eq!(rules.bypasses(&target("http://localhost:5000")), true);
        assert_eq!(rules.bypasses(&target("http://example.com")), false);
    }

    #[test]
    fn literal_token_matches_exact_host() {
        let rules = NoProxyRules::parse(Some("google.com"));

        assert_eq!(rules.bypasses(&target("http://google.com")), true);
        assert_eq!(rules.bypasses(&target("http://www.google.com")), false);
    }

    #[test]
    fn explicit_list_replaces_the_implicit_loopback_entries() {
        let rules = NoProxyRules::parse(Some("google.com"));

        assert_eq!(rules.bypasses(&target("http://localhost:5000")), false);
        assert_eq!(rules.bypasses(&target("http://127.0.0.1:5000")), false);
    }

    #[test]
    fn literal_token_with_port_requires_that_port() {
        let rules = NoProxyRules::parse(Some("<-loopback>,example.com:8080"));

        assert_eq!(rules.bypasses(&target("http://example.com:8080")), true);
        assert_eq!(rules.bypasses(&target("http://example.com:9090")), false);
    }

    #[test]
    fn tokens_are_case_insensitive_and_trimmed() {
        let rules = NoProxyRules::parse(Some("  Example.COM , *Host "));

        assert_eq!(rules.bypasses(&target("http://example.com")), true);
        assert_eq!(rules.bypasses(&target("http://myhost")), true);
    }
}
