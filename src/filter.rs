//! Domain allow-list matching
//!
//! The allow-list holds one bare domain per line. A queried name matches when
//! it equals a listed domain or is a subdomain of it, on a dot boundary.
//! Comparison is ASCII case-insensitive and ignores trailing dots.

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Where a query is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Every question name is on the allow-list; ask the forward resolver directly
    Local,
    /// At least one name is not; send the query through the tunnel
    Remote,
}

/// Compiled, immutable allow-list matcher.
///
/// Domains are kept lowercased in a hash set. A name is checked by looking up
/// the name itself and then each suffix that starts after one of its dots, so
/// a lookup costs one hash probe per label no matter how long the list is.
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    domains: HashSet<String>,
}

impl DomainFilter {
    /// A filter that matches no name
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile allow-list lines. Blank lines and `#` comments are skipped.
    pub fn compile<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut domains = HashSet::new();

        for (idx, line) in patterns.into_iter().enumerate() {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let domain = line.trim_end_matches('.');
            if domain.is_empty()
                || domain.starts_with('.')
                || domain.contains("..")
                || domain.contains('*')
                || domain.chars().any(char::is_whitespace)
            {
                return Err(Error::FilterCompile(format!(
                    "line {}: '{}' is not a bare domain name",
                    idx + 1,
                    line
                )));
            }
            domains.insert(domain.to_ascii_lowercase());
        }

        debug!("Compiled domain filter with {} domains", domains.len());

        Ok(Self { domains })
    }

    /// Read and compile an allow-list file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("can't read domain list {}: {}", path.display(), e),
            ))
        })?;
        Self::compile(content.lines())
    }

    /// Whether `name` is a listed domain or one of its subdomains
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.');
        if name.is_empty() || self.domains.is_empty() {
            return false;
        }

        let name = name.to_ascii_lowercase();
        let mut suffix = name.as_str();
        loop {
            if self.domains.contains(suffix) {
                return true;
            }
            match suffix.find('.') {
                Some(dot) => suffix = &suffix[dot + 1..],
                None => return false,
            }
        }
    }

    /// `Local` only if every name matches; the first miss decides `Remote`
    pub fn classify<I, S>(&self, names: I) -> RoutingDecision
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            if !self.matches(name.as_ref()) {
                return RoutingDecision::Remote;
            }
        }
        RoutingDecision::Local
    }

    /// Number of distinct domains in the matcher
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
