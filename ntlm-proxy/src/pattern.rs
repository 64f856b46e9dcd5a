use crate::target::normalize_host;
use anyhow::Result;
use anyhow::bail;
use anyhow::ensure;

/// A user-supplied host pattern matched against a `host` or `host:port`.
///
/// Labels are matched one-to-one; `*` inside a label matches any run of
/// non-dot characters, so `*host` matches `localhost` but not `my.host`.
/// A port may only be present on non-wildcard patterns. The lone pattern `*`
/// matches every host at the lowest possible priority.
#[derive(Clone, Debug)]
pub struct HostPattern {
    raw: String,
    labels: Vec<String>,
    port: Option<u16>,
}

impl PartialEq for HostPattern {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels && self.port == other.port
    }
}

impl Eq for HostPattern {}

impl std::fmt::Display for HostPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl HostPattern {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        ensure!(!trimmed.is_empty(), "host pattern is empty");
        ensure!(
            !trimmed.contains("://"),
            "host pattern must not carry a scheme: {input}"
        );
        ensure!(
            !trimmed.contains('/'),
            "host pattern must not carry a path: {input}"
        );

        let (host_part, port) = match trimmed.bytes().filter(|b| *b == b':').count() {
            0 => (trimmed, None),
            1 => {
                let (host, port) = trimmed
                    .split_once(':')
                    .unwrap_or((trimmed, ""));
                let port = port
                    .parse::<u16>()
                    .map_err(|_| anyhow::anyhow!("invalid port in host pattern: {input}"))?;
                (host, Some(port))
            }
            _ => bail!("invalid host pattern: {input}"),
        };

        ensure!(!host_part.is_empty(), "empty host in pattern: {input}");
        if host_part.contains('*') && port.is_some() {
            bail!("wildcard host patterns must not carry a port: {input}");
        }

        let labels: Vec<String> = host_part
            .split('.')
            .map(str::to_ascii_lowercase)
            .collect();
        ensure!(
            labels.iter().all(|label| !label.is_empty()),
            "empty label in host pattern: {input}"
        );

        Ok(Self {
            raw: trimmed.to_string(),
            labels,
            port,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.labels.iter().any(|label| label.contains('*'))
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        if let Some(pattern_port) = self.port
            && pattern_port != port
        {
            return false;
        }

        // `*` alone is the catch-all and ignores label alignment.
        if self.labels.len() == 1 && self.labels[0] == "*" {
            return true;
        }

        let host = normalize_host(host);
        let host_labels: Vec<&str> = host.split('.').collect();
        if host_labels.len() != self.labels.len() {
            return false;
        }
        self.labels
            .iter()
            .zip(host_labels)
            .all(|(pattern, label)| label_matches(pattern.as_bytes(), label.as_bytes()))
    }

    /// Sort key implementing the deterministic precedence tie-break:
    /// exact `host:port` beats exact `host`, which beats wildcards; wildcards
    /// rank by longest literal suffix, then fewest wildcards, then
    /// lexicographically.
    pub(crate) fn specificity(&self) -> Specificity {
        let rank = if !self.is_wildcard() {
            if self.port.is_some() { 0 } else { 1 }
        } else {
            2
        };
        let joined = self.labels.join(".");
        let literal_suffix_len = joined
            .bytes()
            .rev()
            .take_while(|b| *b != b'*')
            .count();
        let wildcard_count = joined.bytes().filter(|b| *b == b'*').count();
        Specificity {
            rank,
            inverse_suffix_len: usize::MAX - literal_suffix_len,
            wildcard_count,
            raw: joined,
        }
    }
}

/// Orders patterns best-first (`Ord`: smaller sorts first and wins).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Specificity {
    rank: u8,
    inverse_suffix_len: usize,
    wildcard_count: usize,
    raw: String,
}

/// Pick the single best pattern matching `host:port` under the precedence
/// rules, or `None` when nothing matches.
pub fn best_match<'a, I>(patterns: I, host: &str, port: u16) -> Option<&'a HostPattern>
where
    I: IntoIterator<Item = &'a HostPattern>,
{
    patterns
        .into_iter()
        .filter(|pattern| pattern.matches(host, port))
        .min_by_key(|pattern| pattern.specificity())
}

fn label_matches(pattern: &[u8], label: &[u8]) -> bool {
    match pattern.split_first() {
        None => label.is_empty(),
        Some((b'*', rest)) => (0..=label.len()).any(|skip| label_matches(rest, &label[skip..])),
        Some((expected, rest)) => label
            .split_first()
            .is_some_and(|(actual, tail)| expected.eq_ignore_ascii_case(actual) && label_matches(rest, tail)),
    }
}
