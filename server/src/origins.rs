//! Origin allow-list.
//!
//! Entries are `host:port` pairs where either side may be `*`. An entry
//! without a port matches every port of that host.

use std::collections::HashSet;

use url::Url;

/// Wildcard entry allowing every origin.
pub const ALLOW_ALL: &str = "*:*";

/// Checks the `Origin` header of upgrade requests.
#[derive(Debug, Clone, Default)]
pub struct OriginsChecker {
    allow_all: bool,
    entries: HashSet<String>,
}

impl OriginsChecker {
    /// Creates a checker. `None` or an entry of `*:*` allows every origin.
    #[must_use]
    pub fn new(origins: Option<&[String]>) -> Self {
        let Some(origins) = origins else {
            return Self {
                allow_all: true,
                entries: HashSet::new(),
            };
        };

        let entries: HashSet<String> = origins
            .iter()
            .map(|entry| {
                let entry = entry.trim();
                if entry.contains(':') {
                    entry.to_string()
                } else {
                    format!("{entry}:*")
                }
            })
            .collect();

        Self {
            allow_all: entries.contains(ALLOW_ALL),
            entries,
        }
    }

    /// Returns true if every origin is allowed.
    #[must_use]
    pub fn allows_all(&self) -> bool {
        self.allow_all
    }

    /// Returns true if the origin is allowed.
    ///
    /// A missing or unparsable origin is only allowed when every origin is.
    #[must_use]
    pub fn check(&self, origin: Option<&str>) -> bool {
        if self.allow_all {
            return true;
        }

        let Some(url) = origin.and_then(|o| Url::parse(o).ok()) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let port = url
            .port_or_known_default()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "*".to_string());

        self.entries.contains(&format!("{host}:{port}"))
            || self.entries.contains(&format!("{host}:*"))
            || self.entries.contains(&format!("*:{port}"))
    }
}
