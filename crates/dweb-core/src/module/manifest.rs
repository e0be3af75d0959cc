//! Module identity and manifests.

use crate::protocol::{normalize_protocols, Subprotocol};
use serde::{Deserialize, Serialize};

/// Stable, globally unique module id, e.g. `dns.sys.dweb`.
pub type ModuleId = String;

/// Immutable descriptor of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub mmid: ModuleId,
    /// Supported subprotocols in priority order; always contains `raw`.
    pub protocols: Vec<Subprotocol>,
    /// Deep-link prefixes this module accepts, e.g. `dweb://install`.
    #[serde(default)]
    pub deeplinks: Vec<String>,
    /// Capability tags used by `search`.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ModuleManifest {
    /// Manifest supporting every subprotocol and nothing else.
    pub fn new(mmid: impl Into<ModuleId>) -> Self {
        Self {
            mmid: mmid.into(),
            protocols: Subprotocol::ALL.to_vec(),
            deeplinks: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_protocols(mut self, protocols: &[Subprotocol]) -> Self {
        self.protocols = normalize_protocols(protocols);
        self
    }

    pub fn with_deeplink(mut self, prefix: impl Into<String>) -> Self {
        self.deeplinks.push(prefix.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    /// True if `url` starts with one of the declared deep-link prefixes.
    ///
    /// The prefix must end at a boundary: the end of `url`, `?` or `/`.
    /// `dweb://install` accepts `dweb://install?url=..` but not
    /// `dweb://installer`.
    pub fn matches_deeplink(&self, url: &str) -> bool {
        let url = url.to_ascii_lowercase();
        self.deeplinks.iter().any(|prefix| {
            let prefix = prefix.to_ascii_lowercase();
            match url.strip_prefix(&prefix) {
                Some(rest) => {
                    prefix.ends_with(['/', '?'])
                        || rest.is_empty()
                        || rest.starts_with(['?', '/'])
                }
                None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_builder() {
        let manifest = ModuleManifest::new("desk.browser.dweb")
            .with_protocols(&[Subprotocol::Cbor])
            .with_deeplink("dweb://open")
            .with_capability("Browser");
        assert_eq!(manifest.protocols, vec![Subprotocol::Cbor, Subprotocol::Raw]);
        assert!(manifest.has_capability("browser"));
        assert!(manifest.matches_deeplink("dweb://open?url=https%3A%2F%2Fexample.com"));
        assert!(!manifest.matches_deeplink("dweb://install"));
    }

    #[test]
    fn test_deeplink_prefix_needs_boundary() {
        let manifest = ModuleManifest::new("links.test.dweb").with_deeplink("dweb://install");
        assert!(manifest.matches_deeplink("dweb://install"));
        assert!(manifest.matches_deeplink("dweb://install?url=x"));
        assert!(manifest.matches_deeplink("DWEB://Install/app"));
        assert!(!manifest.matches_deeplink("dweb://installer"));
        assert!(!manifest.matches_deeplink("dweb://install-app?x=1"));

        let slashed = ModuleManifest::new("links.test.dweb").with_deeplink("dweb://open/");
        assert!(slashed.matches_deeplink("dweb://open/page"));
    }
}
