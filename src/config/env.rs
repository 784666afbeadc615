//! Environment variable overlay
//!
//! Names prefixed `WEBSSH2_` (plus legacy `PORT`) map to dotted config
//! paths, each with a declared type. Arrays accept either a JSON array or a
//! comma-separated list. Unknown `WEBSSH2_` names are rejected at boot so a
//! typo never silently falls back to a default.

use std::str::FromStr;

use crate::error::ConfigError;
use crate::ssh::AlgorithmPreset;

use super::types::{GatewayConfig, SyslogSection};

/// Declared value types for environment mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    Str,
    Number,
    Boolean,
    Array,
    Preset,
}

/// `(env name, dotted path, type)` — the authoritative mapping table.
pub const ENV_TABLE: &[(&str, &str, EnvKind)] = &[
    ("PORT", "listen.port", EnvKind::Number),
    ("WEBSSH2_LISTEN_IP", "listen.ip", EnvKind::Str),
    ("WEBSSH2_LISTEN_PORT", "listen.port", EnvKind::Number),
    ("WEBSSH2_ORIGIN", "origin", EnvKind::Array),
    ("WEBSSH2_SESSION_NAME", "session.name", EnvKind::Str),
    ("WEBSSH2_SESSION_SECRET", "session.secret", EnvKind::Str),
    ("WEBSSH2_SESSION_SAME_SITE", "session.sameSite", EnvKind::Str),
    ("WEBSSH2_SSH_HOST", "ssh.host", EnvKind::Str),
    ("WEBSSH2_SSH_PORT", "ssh.port", EnvKind::Number),
    ("WEBSSH2_SSH_TERM", "ssh.term", EnvKind::Str),
    ("WEBSSH2_SSH_READY_TIMEOUT", "ssh.readyTimeout", EnvKind::Number),
    (
        "WEBSSH2_SSH_KEEPALIVE_INTERVAL",
        "ssh.keepaliveInterval",
        EnvKind::Number,
    ),
    (
        "WEBSSH2_SSH_KEEPALIVE_COUNT_MAX",
        "ssh.keepaliveCountMax",
        EnvKind::Number,
    ),
    ("WEBSSH2_SSH_ALGORITHMS", "ssh.algorithms", EnvKind::Preset),
    (
        "WEBSSH2_SSH_ALLOWED_SUBNETS",
        "ssh.allowedSubnets",
        EnvKind::Array,
    ),
    (
        "WEBSSH2_SSH_DISABLE_INTERACTIVE_AUTH",
        "ssh.disableInteractiveAuth",
        EnvKind::Boolean,
    ),
    (
        "WEBSSH2_SSH_ALWAYS_SEND_KEYBOARD_INTERACTIVE_PROMPTS",
        "ssh.alwaysSendKeyboardInteractivePrompts",
        EnvKind::Boolean,
    ),
    ("WEBSSH2_TELNET_PORT", "telnet.port", EnvKind::Number),
    ("WEBSSH2_AUTH_PASSWORD", "auth.password", EnvKind::Boolean),
    ("WEBSSH2_AUTH_PUBLICKEY", "auth.publickey", EnvKind::Boolean),
    (
        "WEBSSH2_AUTH_KEYBOARD_INTERACTIVE",
        "auth.keyboardInteractive",
        EnvKind::Boolean,
    ),
    ("WEBSSH2_AUTH_MAX_ATTEMPTS", "auth.maxAttempts", EnvKind::Number),
    (
        "WEBSSH2_OPTIONS_ALLOW_REPLAY",
        "options.allowReplay",
        EnvKind::Boolean,
    ),
    (
        "WEBSSH2_OPTIONS_ALLOW_REAUTH",
        "options.allowReauth",
        EnvKind::Boolean,
    ),
    (
        "WEBSSH2_OPTIONS_ALLOW_RECONNECT",
        "options.allowReconnect",
        EnvKind::Boolean,
    ),
    ("WEBSSH2_OPTIONS_ALLOW_EXEC", "options.allowExec", EnvKind::Boolean),
    (
        "WEBSSH2_OPTIONS_ALLOW_FILE_TRANSFER",
        "options.allowFileTransfer",
        EnvKind::Boolean,
    ),
    ("WEBSSH2_OPTIONS_REPLAY_CRLF", "options.replayCrlf", EnvKind::Boolean),
    ("WEBSSH2_TERMINAL_ROWS", "terminal.rows", EnvKind::Number),
    ("WEBSSH2_TERMINAL_COLS", "terminal.cols", EnvKind::Number),
    ("WEBSSH2_TERMINAL_TERM", "terminal.term", EnvKind::Str),
    ("WEBSSH2_RECORDING_ENABLED", "recording.enabled", EnvKind::Boolean),
    (
        "WEBSSH2_RECORDING_BUFFER_SIZE",
        "recording.bufferSize",
        EnvKind::Number,
    ),
    ("WEBSSH2_LOGGING_SAMPLE_RATE", "logging.sampleRate", EnvKind::Number),
    (
        "WEBSSH2_LOGGING_RATE_LIMIT",
        "logging.rateLimitPerMinute",
        EnvKind::Number,
    ),
    ("WEBSSH2_SYSLOG_HOST", "logging.syslog.host", EnvKind::Str),
    ("WEBSSH2_SYSLOG_PORT", "logging.syslog.port", EnvKind::Number),
    ("WEBSSH2_SYSLOG_TLS", "logging.syslog.tls", EnvKind::Boolean),
    ("WEBSSH2_HEADER_TEXT", "header.text", EnvKind::Str),
    ("WEBSSH2_HEADER_BACKGROUND", "header.background", EnvKind::Str),
    ("WEBSSH2_HEADER_COLOR", "header.color", EnvKind::Str),
];

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError(format!("{name}: expected a number, got {raw:?}")))
}

fn parse_boolean(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError(format!(
            "{name}: expected a boolean, got {raw:?}"
        ))),
    }
}

fn parse_array(name: &str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<String>>(trimmed)
            .map_err(|e| ConfigError(format!("{name}: bad JSON array: {e}")))
    } else {
        Ok(trimmed
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }
}

fn parse_preset(name: &str, raw: &str) -> Result<AlgorithmPreset, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "modern" => Ok(AlgorithmPreset::Modern),
        "legacy" => Ok(AlgorithmPreset::Legacy),
        "strict" => Ok(AlgorithmPreset::Strict),
        _ => Err(ConfigError(format!(
            "{name}: expected one of modern|legacy|strict, got {raw:?}"
        ))),
    }
}

fn syslog_mut(config: &mut GatewayConfig) -> &mut SyslogSection {
    config.logging.syslog.get_or_insert_with(SyslogSection::default)
}

/// Apply one variable to the config. `name` must be in `ENV_TABLE`.
fn apply_one(config: &mut GatewayConfig, name: &str, raw: &str) -> Result<(), ConfigError> {
    match name {
        "PORT" | "WEBSSH2_LISTEN_PORT" => config.listen.port = parse_number(name, raw)?,
        "WEBSSH2_LISTEN_IP" => config.listen.ip = raw.to_string(),
        "WEBSSH2_ORIGIN" => config.origin = parse_array(name, raw)?,
        "WEBSSH2_SESSION_NAME" => config.session.name = raw.to_string(),
        "WEBSSH2_SESSION_SECRET" => config.session.secret = Some(raw.to_string()),
        "WEBSSH2_SESSION_SAME_SITE" => config.session.same_site = raw.to_string(),
        "WEBSSH2_SSH_HOST" => config.ssh.host = Some(raw.to_string()),
        "WEBSSH2_SSH_PORT" => config.ssh.port = parse_number(name, raw)?,
        "WEBSSH2_SSH_TERM" => config.ssh.term = raw.to_string(),
        "WEBSSH2_SSH_READY_TIMEOUT" => config.ssh.ready_timeout = parse_number(name, raw)?,
        "WEBSSH2_SSH_KEEPALIVE_INTERVAL" => {
            config.ssh.keepalive_interval = parse_number(name, raw)?
        }
        "WEBSSH2_SSH_KEEPALIVE_COUNT_MAX" => {
            config.ssh.keepalive_count_max = parse_number(name, raw)?
        }
        "WEBSSH2_SSH_ALGORITHMS" => config.ssh.algorithms = parse_preset(name, raw)?,
        "WEBSSH2_SSH_ALLOWED_SUBNETS" => config.ssh.allowed_subnets = parse_array(name, raw)?,
        "WEBSSH2_SSH_DISABLE_INTERACTIVE_AUTH" => {
            config.ssh.disable_interactive_auth = parse_boolean(name, raw)?
        }
        "WEBSSH2_SSH_ALWAYS_SEND_KEYBOARD_INTERACTIVE_PROMPTS" => {
            config.ssh.always_send_keyboard_interactive_prompts = parse_boolean(name, raw)?
        }
        "WEBSSH2_TELNET_PORT" => config.telnet.port = parse_number(name, raw)?,
        "WEBSSH2_AUTH_PASSWORD" => config.auth.password = parse_boolean(name, raw)?,
        "WEBSSH2_AUTH_PUBLICKEY" => config.auth.publickey = parse_boolean(name, raw)?,
        "WEBSSH2_AUTH_KEYBOARD_INTERACTIVE" => {
            config.auth.keyboard_interactive = parse_boolean(name, raw)?
        }
        "WEBSSH2_AUTH_MAX_ATTEMPTS" => config.auth.max_attempts = parse_number(name, raw)?,
        "WEBSSH2_OPTIONS_ALLOW_REPLAY" => config.options.allow_replay = parse_boolean(name, raw)?,
        "WEBSSH2_OPTIONS_ALLOW_REAUTH" => config.options.allow_reauth = parse_boolean(name, raw)?,
        "WEBSSH2_OPTIONS_ALLOW_RECONNECT" => {
            config.options.allow_reconnect = parse_boolean(name, raw)?
        }
        "WEBSSH2_OPTIONS_ALLOW_EXEC" => config.options.allow_exec = parse_boolean(name, raw)?,
        "WEBSSH2_OPTIONS_ALLOW_FILE_TRANSFER" => {
            config.options.allow_file_transfer = parse_boolean(name, raw)?
        }
        "WEBSSH2_OPTIONS_REPLAY_CRLF" => config.options.replay_crlf = parse_boolean(name, raw)?,
        "WEBSSH2_TERMINAL_ROWS" => config.terminal.rows = parse_number(name, raw)?,
        "WEBSSH2_TERMINAL_COLS" => config.terminal.cols = parse_number(name, raw)?,
        "WEBSSH2_TERMINAL_TERM" => config.terminal.term = raw.to_string(),
        "WEBSSH2_RECORDING_ENABLED" => config.recording.enabled = parse_boolean(name, raw)?,
        "WEBSSH2_RECORDING_BUFFER_SIZE" => {
            config.recording.buffer_size = parse_number(name, raw)?
        }
        "WEBSSH2_LOGGING_SAMPLE_RATE" => config.logging.sample_rate = parse_number(name, raw)?,
        "WEBSSH2_LOGGING_RATE_LIMIT" => {
            config.logging.rate_limit_per_minute = parse_number(name, raw)?
        }
        "WEBSSH2_SYSLOG_HOST" => syslog_mut(config).host = raw.to_string(),
        "WEBSSH2_SYSLOG_PORT" => {
            let port = parse_number(name, raw)?;
            syslog_mut(config).port = port;
        }
        "WEBSSH2_SYSLOG_TLS" => {
            let tls = parse_boolean(name, raw)?;
            syslog_mut(config).tls = tls;
        }
        "WEBSSH2_HEADER_TEXT" => config.header.text = Some(raw.to_string()),
        "WEBSSH2_HEADER_BACKGROUND" => config.header.background = raw.to_string(),
        "WEBSSH2_HEADER_COLOR" => config.header.color = raw.to_string(),
        other => {
            return Err(ConfigError(format!(
                "unknown configuration variable {other}"
            )))
        }
    }
    Ok(())
}

/// Overlay environment variables onto `config`.
///
/// `vars` is injectable for tests; production passes `std::env::vars()`.
pub fn apply_env<I>(config: &mut GatewayConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, value) in vars {
        let known = name == "PORT" || name.starts_with("WEBSSH2_");
        if !known {
            continue;
        }
        if !ENV_TABLE.iter().any(|(n, _, _)| *n == name) {
            return Err(ConfigError(format!(
                "unknown configuration variable {name}"
            )));
        }
        apply_one(config, &name, &value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn overlay_basic_types() {
        let mut config = GatewayConfig::default();
        apply_env(
            &mut config,
            env(&[
                ("WEBSSH2_LISTEN_PORT", "8080"),
                ("WEBSSH2_SSH_HOST", "bastion.internal"),
                ("WEBSSH2_OPTIONS_ALLOW_EXEC", "true"),
                ("WEBSSH2_SSH_ALGORITHMS", "strict"),
                ("UNRELATED", "ignored"),
            ]),
        )
        .unwrap();

        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.ssh.host.as_deref(), Some("bastion.internal"));
        assert!(config.options.allow_exec);
        assert_eq!(config.ssh.algorithms, AlgorithmPreset::Strict);
    }

    #[test]
    fn legacy_port_maps_to_listen_port() {
        let mut config = GatewayConfig::default();
        apply_env(&mut config, env(&[("PORT", "3000")])).unwrap();
        assert_eq!(config.listen.port, 3000);
    }

    #[test]
    fn arrays_accept_both_forms() {
        let mut config = GatewayConfig::default();
        apply_env(
            &mut config,
            env(&[("WEBSSH2_SSH_ALLOWED_SUBNETS", "10.0.0.0/24, 10.0.1.0/24")]),
        )
        .unwrap();
        assert_eq!(config.ssh.allowed_subnets.len(), 2);

        apply_env(
            &mut config,
            env(&[("WEBSSH2_ORIGIN", r#"["https://a.example","https://b.example"]"#)]),
        )
        .unwrap();
        assert_eq!(config.origin.len(), 2);
    }

    #[test]
    fn unknown_prefixed_name_is_rejected() {
        let mut config = GatewayConfig::default();
        let err = apply_env(&mut config, env(&[("WEBSSH2_TYPO", "x")]));
        assert!(err.is_err());
    }

    #[test]
    fn bad_number_is_rejected() {
        let mut config = GatewayConfig::default();
        assert!(apply_env(&mut config, env(&[("WEBSSH2_LISTEN_PORT", "abc")])).is_err());
    }
}
