//! Gateway configuration types
//!
//! Deserialized from an optional JSON config file, then overlaid with
//! `WEBSSH2_*` environment variables (see `env.rs`). Every field has a
//! serde default so a missing file yields a fully usable config.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ssh::AlgorithmPreset;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub listen: ListenConfig,
    /// Allowed WebSocket origins. Empty list accepts any origin.
    pub origin: Vec<String>,
    pub session: SessionCookieConfig,
    pub ssh: SshSection,
    pub telnet: TelnetSection,
    pub auth: AuthSection,
    pub options: OptionsSection,
    pub terminal: TerminalSection,
    pub recording: RecordingSection,
    pub logging: LoggingSection,
    pub header: HeaderSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 2222,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionCookieConfig {
    /// Cookie carrying the HTTP session id.
    pub name: String,
    pub secret: Option<String>,
    /// SameSite policy propagated to the routing layer.
    pub same_site: String,
}

impl Default for SessionCookieConfig {
    fn default() -> Self {
        Self {
            name: "webssh2.sid".to_string(),
            secret: None,
            same_site: "Lax".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshSection {
    /// Pre-configured target host; `None` means the client must supply one.
    pub host: Option<String>,
    pub port: u16,
    pub term: String,
    /// Dial timeout in milliseconds.
    pub ready_timeout: u64,
    /// Keepalive probe interval in milliseconds. 0 disables.
    pub keepalive_interval: u64,
    pub keepalive_count_max: usize,
    pub algorithms: AlgorithmPreset,
    /// CIDR allow-list. Empty means any target is permitted.
    pub allowed_subnets: Vec<String>,
    /// Refuse keyboard-interactive entirely.
    pub disable_interactive_auth: bool,
    /// Forward every keyboard-interactive prompt to the client instead of
    /// auto-answering password-looking ones.
    pub always_send_keyboard_interactive_prompts: bool,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            host: None,
            port: 22,
            term: "xterm-color".to_string(),
            ready_timeout: 20_000,
            keepalive_interval: 30_000,
            keepalive_count_max: 3,
            algorithms: AlgorithmPreset::Modern,
            allowed_subnets: Vec::new(),
            disable_interactive_auth: false,
            always_send_keyboard_interactive_prompts: false,
        }
    }
}

impl SshSection {
    /// Parse `allowed_subnets` into CIDR nets. A malformed entry is a boot
    /// failure, not a silently-open policy.
    pub fn parsed_subnets(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.allowed_subnets
            .iter()
            .map(|s| {
                s.parse::<IpNet>()
                    .map_err(|e| ConfigError(format!("bad subnet {s:?}: {e}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelnetSection {
    pub port: u16,
    pub login_prompt: String,
    pub password_prompt: String,
    /// Pattern that marks a failed login after credentials were written.
    pub failure_prompt: String,
}

impl Default for TelnetSection {
    fn default() -> Self {
        Self {
            port: 23,
            login_prompt: r"(?i)login[: ]*$".to_string(),
            password_prompt: r"(?i)password[: ]*$".to_string(),
            failure_prompt: r"(?i)(incorrect|failed|denied)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthSection {
    pub password: bool,
    pub publickey: bool,
    pub keyboard_interactive: bool,
    /// Consecutive failures before the socket is disconnected.
    pub max_attempts: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            password: true,
            publickey: true,
            keyboard_interactive: true,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptionsSection {
    pub allow_replay: bool,
    pub allow_reauth: bool,
    pub allow_reconnect: bool,
    pub allow_exec: bool,
    pub allow_file_transfer: bool,
    /// Send CRLF after a replayed password (LF otherwise).
    pub replay_crlf: bool,
}

impl Default for OptionsSection {
    fn default() -> Self {
        Self {
            allow_replay: true,
            allow_reauth: true,
            allow_reconnect: false,
            allow_exec: false,
            allow_file_transfer: false,
            replay_crlf: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TerminalSection {
    pub rows: u16,
    pub cols: u16,
    pub term: String,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            term: "xterm-color".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecordingSection {
    pub enabled: bool,
    /// Ring capacity in `(timestamp, bytes)` entries.
    pub buffer_size: usize,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSection {
    /// Target events/second per (event, subsystem) before sampling kicks in.
    pub sample_rate: u32,
    /// Hard per-target budget per minute; excess is dropped with a counter.
    pub rate_limit_per_minute: u32,
    pub syslog: Option<SyslogSection>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            sample_rate: 10,
            rate_limit_per_minute: 600,
            syslog: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyslogSection {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Flush interval in milliseconds.
    pub flush_interval: u64,
    /// Buffered event cap between flushes.
    pub buffer_size: usize,
}

impl Default for SyslogSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6514,
            tls: true,
            flush_interval: 5_000,
            buffer_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeaderSection {
    pub text: Option<String>,
    pub background: String,
    pub color: String,
}

impl Default for HeaderSection {
    fn default() -> Self {
        Self {
            text: None,
            background: "green".to_string(),
            color: "white".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Boot-time validation. Failure is fatal (exit code 1).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            return Err(ConfigError("terminal geometry must be at least 1x1".into()));
        }
        if self.auth.max_attempts == 0 {
            return Err(ConfigError("auth.maxAttempts must be at least 1".into()));
        }
        self.ssh.parsed_subnets()?;
        regex::Regex::new(&self.telnet.login_prompt)
            .map_err(|e| ConfigError(format!("bad telnet.loginPrompt: {e}")))?;
        regex::Regex::new(&self.telnet.password_prompt)
            .map_err(|e| ConfigError(format!("bad telnet.passwordPrompt: {e}")))?;
        regex::Regex::new(&self.telnet.failure_prompt)
            .map_err(|e| ConfigError(format!("bad telnet.failurePrompt: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen.port, 2222);
        assert_eq!(config.session.name, "webssh2.sid");
        assert_eq!(config.terminal.rows, 24);
    }

    #[test]
    fn bad_subnet_fails_validation() {
        let mut config = GatewayConfig::default();
        config.ssh.allowed_subnets = vec!["10.0.0.0/24".into(), "not-a-net".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn subnets_parse() {
        let mut config = GatewayConfig::default();
        config.ssh.allowed_subnets = vec!["10.0.0.0/24".into(), "2001:db8::/32".into()];
        let nets = config.ssh.parsed_subnets().unwrap();
        assert_eq!(nets.len(), 2);
    }
}
