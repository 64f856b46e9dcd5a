use crate::pattern::HostPattern;
use crate::pattern::best_match;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NtlmVersion {
    V1,
    #[default]
    V2,
}

impl NtlmVersion {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

/// Explicit username/password credentials for a set of host patterns.
#[derive(Clone, PartialEq, Eq)]
pub struct ExplicitCredentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
    pub workstation: Option<String>,
    pub ntlm_version: NtlmVersion,
}

impl std::fmt::Debug for ExplicitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the password into logs or debug dumps.
        f.debug_struct("ExplicitCredentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .field("ntlm_version", &self.ntlm_version)
            .finish_non_exhaustive()
    }
}

impl ExplicitCredentials {
    /// Effective NTLM domain: the configured one, else the target host's first
    /// DNS label uppercased, else empty (IP-literal targets have no label).
    pub fn effective_domain(&self, target_host: &str) -> String {
        if let Some(domain) = &self.domain {
            return domain.clone();
        }
        if target_host.parse::<IpAddr>().is_ok() {
            return String::new();
        }
        target_host
            .split('.')
            .next()
            .map(str::to_ascii_uppercase)
            .unwrap_or_default()
    }

    /// Effective workstation: the configured one, else the OS hostname
    /// captured at startup.
    pub fn effective_workstation(&self, fallback: &str) -> String {
        self.workstation
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// A credential entry is either a cleartext credential set or an opaque marker
/// directing the NTLM engine to fetch a token from the host OS (single
/// sign-on). Dispatch is always on this tag, never on runtime introspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    Explicit(ExplicitCredentials),
    Sso,
}

impl Credential {
    pub fn is_sso(&self) -> bool {
        matches!(self, Self::Sso)
    }
}

/// Ordered list of `(HostPattern, Credential)` entries. Re-adding a pattern
/// overwrites the existing entry in place; precedence between entries is
/// pattern-based, not insertion-order-based.
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    entries: Vec<(HostPattern, Credential)>,
}

impl CredentialStore {
    pub fn upsert(&mut self, pattern: HostPattern, credential: Credential) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|(existing, _)| *existing == pattern)
        {
            existing.1 = credential;
        } else {
            self.entries.push((pattern, credential));
        }
    }

    /// Look up the credential whose pattern wins the precedence tie-break for
    /// `host:port`, or `None` when the host is not configured.
    pub fn lookup(&self, host: &str, port: u16) -> Option<&Credential> {
        let winner = best_match(self.entries.iter().map(|(pattern, _)| pattern), host, port)?;
        self.entries
            .iter()
            .find(|(pattern, _)| pattern == winner)
            .map(|(_, credential)| credential)
    }

    pub fn is_configured(&self, host: &str, port: u16) -> bool {
        self.lookup(host, port).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn explicit(username: &str) -> Credential {
        Credential::Explicit(ExplicitCredentials {
            username: username.to_string(),
            password: "secret".to_string(),
            domain: None,
            workstation: None,
            ntlm_version: NtlmVersion::V2,
        })
    }

    fn pattern(input: &str) -> HostPattern {
        HostPattern::parse(input).unwrap()
    }

    #[test]
    fn upsert_overwrites_existing_pattern_in_place() {
        let mut store = CredentialStore::default();
        store.upsert(pattern("example.com"), explicit("alice"));
        store.upsert(pattern("Example.COM"), explicit("bob"));

        assert_eq!(store.len(), 1);
        let Some(Credential::Explicit(creds)) = store.lookup("example.com", 80) else {
            panic!("expected explicit credentials");
        };
        assert_eq!(creds.username, "bob");
    }

    #[test]
    fn lookup_follows_pattern_precedence() {
        let mut store = CredentialStore::default();
        store.upsert(pattern("*"), explicit("fallback"));
        store.upsert(pattern("*.example.com"), explicit("wildcard"));
        store.upsert(pattern("api.example.com:8080"), explicit("exact"));

        let Some(Credential::Explicit(creds)) = store.lookup("api.example.com", 8080) else {
            panic!("expected explicit credentials");
        };
        assert_eq!(creds.username, "exact");

        let Some(Credential::Explicit(creds)) = store.lookup("www.example.com", 80) else {
            panic!("expected explicit credentials");
        };
        assert_eq!(creds.username, "wildcard");

        let Some(Credential::Explicit(creds)) = store.lookup("other.host", 80) else {
            panic!("expected explicit credentials");
        };
        assert_eq!(creds.username, "fallback");
    }

    #[test]
    fn clear_removes_everything() {
        let mut store = CredentialStore::default();
        store.upsert(pattern("example.com"), Credential::Sso);
        store.clear();

        assert_eq!(store.is_empty(), true);
        assert_eq!(store.lookup("example.com", 80), None);
    }

    #[test]
    fn effective_domain_defaults_to_first_label_uppercased() {
        let creds = ExplicitCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: None,
            workstation: None,
            ntlm_version: NtlmVersion::V2,
        };

        assert_eq!(creds.effective_domain("files.intranet.corp"), "FILES");
        assert_eq!(creds.effective_domain("10.0.0.1"), "");
    }

    #[test]
    fn effective_domain_prefers_configured_value() {
        let creds = ExplicitCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: Some("CORP".to_string()),
            workstation: None,
            ntlm_version: NtlmVersion::V2,
        };

        assert_eq!(creds.effective_domain("files.intranet.corp"), "CORP");
    }

    #[test]
    fn effective_workstation_falls_back_to_os_hostname() {
        let creds = ExplicitCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: None,
            workstation: Some("WS1".to_string()),
            ntlm_version: NtlmVersion::V2,
        };

        assert_eq!(creds.effective_workstation("fallback-host"), "WS1");

        let creds = ExplicitCredentials {
            workstation: None,
            ..creds
        };
        assert_eq!(creds.effective_workstation("fallback-host"), "fallback-host");
    }

    #[test]
    fn debug_output_redacts_the_password() {
        let rendered = format!("{:?}", explicit("alice"));

        assert!(!rendered.contains("secret"), "{rendered}");
    }
}
