//! Credentials and user SSH configuration lookup

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Credential material offered during transport authentication.
///
/// Forms are attempted strictly in order: password, then the private key,
/// then every key held by the local agent. Absent forms are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Password to offer first, if any.
    pub password: Option<String>,
    /// Path to a private key file to offer second, if any.
    pub key_path: Option<PathBuf>,
    /// Passphrase for the private key, if it is encrypted.
    pub key_passphrase: Option<String>,
}

impl Credentials {
    /// Password-only credentials.
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// Private-key credentials with an optional passphrase.
    pub fn key(key_path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Self {
            key_path: Some(key_path.into()),
            key_passphrase: passphrase,
            ..Default::default()
        }
    }

    /// No explicit credentials; authentication falls through to agent keys.
    pub fn agent() -> Self {
        Self::default()
    }
}

/// Effective per-host settings resolved from the user's SSH configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    /// Replacement host name, if the configuration remaps it.
    pub hostname: Option<String>,
    /// Replacement port, if the configuration remaps it.
    pub port: Option<u16>,
    /// Proxy command to run instead of a direct connection.
    pub proxy_command: Option<String>,
}

/// Minimal view of `~/.ssh/config`: `Host` blocks with the `hostname`,
/// `port` and `proxycommand` options this layer consumes. First obtained
/// value wins, matching the OpenSSH lookup rule.
#[derive(Debug, Clone, Default)]
pub struct UserSshConfig {
    blocks: Vec<ConfigBlock>,
}

#[derive(Debug, Clone)]
struct ConfigBlock {
    patterns: Vec<String>,
    options: HashMap<String, String>,
}

impl UserSshConfig {
    /// Load `~/.ssh/config`, returning an empty configuration when the file
    /// does not exist or the home directory cannot be determined.
    pub fn load() -> Self {
        let Some(path) = dirs::home_dir().map(|home| home.join(".ssh").join("config")) else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::default(),
        }
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Self {
        let mut blocks = Vec::new();
        let mut current: Option<ConfigBlock> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, value) = match split_option(line) {
                Some(pair) => pair,
                None => continue,
            };
            if keyword.eq_ignore_ascii_case("host") {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                current = Some(ConfigBlock {
                    patterns: value.split_whitespace().map(str::to_owned).collect(),
                    options: HashMap::new(),
                });
            } else if let Some(block) = current.as_mut() {
                block
                    .options
                    .entry(keyword.to_ascii_lowercase())
                    .or_insert_with(|| value.to_string());
            }
        }
        if let Some(block) = current.take() {
            blocks.push(block);
        }

        Self { blocks }
    }

    /// Resolve the effective settings for `host`. Patterns support the `*`
    /// and `?` wildcards; across matching blocks the first value obtained
    /// for an option wins.
    pub fn lookup(&self, host: &str) -> HostConfig {
        let mut config = HostConfig::default();
        for block in &self.blocks {
            if !block.patterns.iter().any(|p| pattern_matches(p, host)) {
                continue;
            }
            if config.hostname.is_none() {
                config.hostname = block.options.get("hostname").cloned();
            }
            if config.port.is_none() {
                config.port = block.options.get("port").and_then(|p| p.parse().ok());
            }
            if config.proxy_command.is_none() {
                config.proxy_command = block.options.get("proxycommand").cloned();
            }
        }
        config
    }

    /// Apply the lookup to a `(host, port)` pair the way the connection
    /// layer consumes it: remap the host name, and remap the port only when
    /// the caller asked for the standard one.
    pub fn resolve_target(&self, host: &str, port: u16) -> (String, u16) {
        let config = self.lookup(host);
        let effective_host = config.hostname.unwrap_or_else(|| host.to_string());
        let effective_port = match config.port {
            Some(mapped) => {
                if port != 22 && port != mapped {
                    warn!(
                        host,
                        requested = port,
                        mapped,
                        "remapping non-standard port using ssh configuration"
                    );
                }
                mapped
            }
            None => port,
        };
        if effective_host != host || effective_port != port {
            debug!(
                host,
                effective_host, effective_port, "ssh configuration remapped target"
            );
        }
        (effective_host, effective_port)
    }
}

fn split_option(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let keyword = &line[..idx];
    let value = line[idx..].trim_start_matches(|c: char| c.is_whitespace() || c == '=');
    if value.is_empty() {
        return None;
    }
    Some((keyword, value))
}

/// OpenSSH-style host pattern match supporting `*` and `?`.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    fn matches(p: &[u8], h: &[u8]) -> bool {
        match (p.first(), h.first()) {
            (None, None) => true,
            (Some(b'*'), _) => matches(&p[1..], h) || (!h.is_empty() && matches(p, &h[1..])),
            (Some(b'?'), Some(_)) => matches(&p[1..], &h[1..]),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => matches(&p[1..], &h[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), host.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
Host bastion
    HostName gateway.internal
    Port 2222
    ProxyCommand none

Host *.lab
    ProxyCommand ssh relay nc %h %p

Host *
    Port 4022
";

    #[test]
    fn test_lookup_exact_host() {
        let config = UserSshConfig::parse(SAMPLE);
        let host = config.lookup("bastion");
        assert_eq!(host.hostname.as_deref(), Some("gateway.internal"));
        assert_eq!(host.port, Some(2222));
        assert_eq!(host.proxy_command.as_deref(), Some("none"));
    }

    #[test]
    fn test_lookup_wildcard_and_first_value_wins() {
        let config = UserSshConfig::parse(SAMPLE);
        let host = config.lookup("router1.lab");
        assert_eq!(host.proxy_command.as_deref(), Some("ssh relay nc %h %p"));
        // Port comes from the catch-all block since *.lab does not set one.
        assert_eq!(host.port, Some(4022));
        // bastion's port must not leak to other hosts.
        let other = config.lookup("somewhere");
        assert_eq!(other.port, Some(4022));
        assert_eq!(other.hostname, None);
    }

    #[test]
    fn test_resolve_target_remaps_standard_port_only_quietly() {
        let config = UserSshConfig::parse(SAMPLE);
        assert_eq!(
            config.resolve_target("bastion", 22),
            ("gateway.internal".to_string(), 2222)
        );
        // A non-standard requested port is still remapped, with a warning.
        assert_eq!(
            config.resolve_target("bastion", 830),
            ("gateway.internal".to_string(), 2222)
        );
    }

    #[test]
    fn test_unknown_host_passes_through() {
        let config = UserSshConfig::parse("Host only\n Port 2200\n");
        assert_eq!(
            config.resolve_target("elsewhere", 830),
            ("elsewhere".to_string(), 830)
        );
    }

    #[test]
    fn test_equals_separator_and_question_mark() {
        let config = UserSshConfig::parse("Host db?\nPort=5022\n");
        assert_eq!(config.lookup("db1").port, Some(5022));
        assert_eq!(config.lookup("db12").port, None);
    }

    #[test]
    fn test_credentials_constructors() {
        let password = Credentials::password("hunter2");
        assert_eq!(password.password.as_deref(), Some("hunter2"));
        assert!(password.key_path.is_none());

        let key = Credentials::key("/home/user/.ssh/id_ed25519", Some("pp".into()));
        assert!(key.password.is_none());
        assert_eq!(key.key_passphrase.as_deref(), Some("pp"));

        let agent = Credentials::agent();
        assert!(agent.password.is_none() && agent.key_path.is_none());
    }
}
