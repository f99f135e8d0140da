//! Per-host SSH override map.
//!
//! Blocks are matched against symbolic host names with glob semantics:
//! `*` (any characters), `?` (single character), and a leading `!` for
//! negation. When several blocks match, earlier blocks take precedence
//! over later ones; a field set by an earlier block is never overwritten.

use std::path::PathBuf;
use std::time::Duration;

use glob::Pattern;
use serde::Deserialize;
use tracing::warn;

/// Overrides applied to one host before dialing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HostOverride {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    pub proxy_jump: Option<String>,
    pub forward_agent: Option<bool>,
    pub strict_host_key_checking: Option<bool>,
}

impl HostOverride {
    /// Fills unset fields of `self` from `other`.
    fn merge_from(&mut self, other: &HostOverride) {
        if self.hostname.is_none() {
            self.hostname = other.hostname.clone();
        }
        if self.user.is_none() {
            self.user = other.user.clone();
        }
        if self.port.is_none() {
            self.port = other.port;
        }
        if self.identity_file.is_none() {
            self.identity_file = other.identity_file.clone();
        }
        if self.connect_timeout.is_none() {
            self.connect_timeout = other.connect_timeout;
        }
        if self.proxy_jump.is_none() {
            self.proxy_jump = other.proxy_jump.clone();
        }
        if self.forward_agent.is_none() {
            self.forward_agent = other.forward_agent;
        }
        if self.strict_host_key_checking.is_none() {
            self.strict_host_key_checking = other.strict_host_key_checking;
        }
    }
}

/// Ordered collection of pattern blocks.
#[derive(Debug, Clone, Default)]
pub struct SshConfigMap {
    blocks: Vec<(Vec<String>, HostOverride)>,
}

impl SshConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block. Patterns starting with `!` exclude; the block
    /// applies when at least one positive pattern matches and no negated
    /// pattern does.
    pub fn add_block(&mut self, patterns: Vec<String>, overrides: HostOverride) {
        self.blocks.push((patterns, overrides));
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Resolves the merged override for `host_name`. Earlier blocks win.
    pub fn resolve(&self, host_name: &str) -> HostOverride {
        let mut merged = HostOverride::default();
        for (patterns, overrides) in &self.blocks {
            if block_matches(patterns, host_name) {
                merged.merge_from(overrides);
            }
        }
        merged
    }
}

fn block_matches(patterns: &[String], name: &str) -> bool {
    let mut positive_match = false;
    for pattern in patterns {
        let (negated, raw) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern.as_str()),
        };
        let compiled = match Pattern::new(raw) {
            Ok(p) => p,
            Err(err) => {
                warn!(pattern = %raw, error = %err, "Ignoring invalid ssh config pattern");
                continue;
            }
        };
        if compiled.matches(name) {
            if negated {
                return false;
            }
            positive_match = true;
        }
    }
    positive_match
}

#[cfg(test)]
mod tests {
    use super::*;

    fn over(user: &str) -> HostOverride {
        HostOverride {
            user: Some(user.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_glob_star_and_question() {
        let mut map = SshConfigMap::new();
        map.add_block(vec!["web*".into()], over("www"));
        map.add_block(vec!["db?".into()], over("postgres"));

        assert_eq!(map.resolve("web1").user.as_deref(), Some("www"));
        assert_eq!(map.resolve("webserver").user.as_deref(), Some("www"));
        assert_eq!(map.resolve("db1").user.as_deref(), Some("postgres"));
        assert_eq!(map.resolve("db10").user, None);
    }

    #[test]
    fn test_negation_excludes_block() {
        let mut map = SshConfigMap::new();
        map.add_block(vec!["web*".into(), "!web-canary".into()], over("www"));

        assert_eq!(map.resolve("web1").user.as_deref(), Some("www"));
        assert_eq!(map.resolve("web-canary").user, None);
    }

    #[test]
    fn test_earlier_block_takes_precedence() {
        let mut map = SshConfigMap::new();
        map.add_block(
            vec!["web1".into()],
            HostOverride {
                port: Some(2201),
                ..Default::default()
            },
        );
        map.add_block(
            vec!["web*".into()],
            HostOverride {
                port: Some(2200),
                user: Some("www".into()),
                ..Default::default()
            },
        );

        let resolved = map.resolve("web1");
        assert_eq!(resolved.port, Some(2201));
        // Fields the earlier block leaves unset still merge from later ones.
        assert_eq!(resolved.user.as_deref(), Some("www"));
    }

    #[test]
    fn test_no_match_yields_empty_override() {
        let mut map = SshConfigMap::new();
        map.add_block(vec!["web*".into()], over("www"));
        assert_eq!(map.resolve("db1"), HostOverride::default());
    }
}
