//! Partition keys for admission control and circuit breaking.

use std::fmt;

/// Key used when the caller supplies an empty one.
pub const DEFAULT_KEY: &str = "default";

/// A parsed composite key such as `namespace/kind`.
///
/// Parsing is stable: surrounding whitespace, empty segments and letter case are
/// normalized so `" NS1//build "` and `"ns1/build"` refer to the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    namespace: String,
    kind: Option<String>,
}

impl SlotKey {
    pub fn parse(raw: &str) -> Self {
        let mut segments = raw
            .split('/')
            .map(|segment| segment.trim().to_ascii_lowercase())
            .filter(|segment| !segment.is_empty());
        let namespace = segments
            .next()
            .unwrap_or_else(|| DEFAULT_KEY.to_string());
        let rest: Vec<String> = segments.collect();
        let kind = if rest.is_empty() {
            None
        } else {
            Some(rest.join("/"))
        };
        Self { namespace, kind }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Lookup candidates from most to least specific: full key, then namespace.
    pub fn lookup_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        if self.kind.is_some() {
            chain.push(self.namespace.clone());
        }
        chain
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{}/{}", self.namespace, kind),
            None => f.write_str(&self.namespace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespace_and_kind() {
        let key = SlotKey::parse("ns1/build");
        assert_eq!(key.namespace(), "ns1");
        assert_eq!(key.kind(), Some("build"));
        assert_eq!(key.to_string(), "ns1/build");
    }

    #[test]
    fn normalizes_case_whitespace_and_empty_segments() {
        assert_eq!(SlotKey::parse(" NS1//Build "), SlotKey::parse("ns1/build"));
    }

    #[test]
    fn empty_key_maps_to_default() {
        let key = SlotKey::parse("  ");
        assert_eq!(key.to_string(), DEFAULT_KEY);
        assert_eq!(key.kind(), None);
    }

    #[test]
    fn lookup_chain_prefers_full_key() {
        let key = SlotKey::parse("ns1/review");
        assert_eq!(key.lookup_chain(), vec!["ns1/review", "ns1"]);
        assert_eq!(SlotKey::parse("ns1").lookup_chain(), vec!["ns1"]);
    }
}
