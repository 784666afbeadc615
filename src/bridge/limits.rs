//! Per-socket budgets and input hygiene
//!
//! Token-bucket rate limits for risky message types, environment variable
//! filtering for shell and exec, a small command deny-list, and the POSIX
//! shell argument escaper used by the exec fallback path.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::bus::TokenBucket;
use crate::error::ValidationError;

/// Environment variable name shape: `[A-Za-z_][A-Za-z0-9_]{0,31}`.
pub const ENV_NAME_MAX: usize = 32;

/// Values longer than this are truncated, not rejected.
pub const ENV_VALUE_MAX: usize = 512;

/// Names that never cross the gateway.
pub const ENV_DENY_LIST: &[&str] = &[
    "SSH_AUTH_SOCK",
    "SSH_ASKPASS",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GITHUB_TOKEN",
    "NPM_TOKEN",
    "GIT_ASKPASS",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "IFS",
];

static ENV_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,31}$").unwrap());

/// Obviously destructive command shapes. The remote server stays the
/// ultimate authority; this only rejects the blatant cases.
static COMMAND_DENY: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r";\s*rm\s+-rf\s+/",
        r"^\s*rm\s+-rf\s+/\s*$",
        r"dd\s+.*of=/dev/",
        r">\s*/dev/s[a-z]+",
        r"mkfs(\.[a-z0-9]+)?\s",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Message types that carry a per-socket budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskyMessage {
    Exec,
    Control,
    PromptResponse,
}

impl RiskyMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskyMessage::Exec => "exec",
            RiskyMessage::Control => "control",
            RiskyMessage::PromptResponse => "prompt_response",
        }
    }
}

/// Token buckets for one socket.
pub struct SocketLimits {
    exec: Mutex<TokenBucket>,
    control: Mutex<TokenBucket>,
    prompt_response: Mutex<TokenBucket>,
}

impl Default for SocketLimits {
    fn default() -> Self {
        Self {
            exec: Mutex::new(TokenBucket::new(5, 1)),
            control: Mutex::new(TokenBucket::new(10, 2)),
            prompt_response: Mutex::new(TokenBucket::new(10, 2)),
        }
    }
}

impl SocketLimits {
    /// Take one token for `kind`; false means the message is over budget
    /// and must be dropped.
    pub fn admit(&self, kind: RiskyMessage) -> bool {
        match kind {
            RiskyMessage::Exec => self.exec.lock().try_acquire(),
            RiskyMessage::Control => self.control.lock().try_acquire(),
            RiskyMessage::PromptResponse => self.prompt_response.lock().try_acquire(),
        }
    }
}

/// Filter an environment map: bad names and deny-listed names are dropped,
/// oversized values truncated.
pub fn filter_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter(|(name, _)| ENV_NAME_RE.is_match(name))
        .filter(|(name, _)| !ENV_DENY_LIST.contains(&name.as_str()))
        .map(|(name, value)| {
            let truncated: String = value.chars().take(ENV_VALUE_MAX).collect();
            (name.clone(), truncated)
        })
        .collect()
}

/// Reject obviously destructive commands.
pub fn command_permitted(command: &str) -> Result<(), ValidationError> {
    for pattern in COMMAND_DENY.iter() {
        if pattern.is_match(command) {
            return Err(ValidationError::new("command", "blocked by safety policy"));
        }
    }
    Ok(())
}

/// POSIX single-quote escaping: `printf '%s' <escaped>` reproduces the
/// input verbatim.
pub fn escape_shell_arg(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for ch in arg.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names_must_match_shape() {
        let mut env = HashMap::new();
        env.insert("VALID_NAME".to_string(), "ok".to_string());
        env.insert("1BAD".to_string(), "dropped".to_string());
        env.insert("has-dash".to_string(), "dropped".to_string());
        env.insert("WAY_TOO_LONG_NAME_THAT_EXCEEDS_THE_LIMIT_BY_FAR".to_string(), "x".to_string());

        let filtered = filter_env(&env);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("VALID_NAME"));
    }

    #[test]
    fn deny_listed_names_are_removed() {
        let mut env = HashMap::new();
        env.insert("SSH_AUTH_SOCK".to_string(), "/tmp/agent".to_string());
        env.insert("AWS_SECRET_ACCESS_KEY".to_string(), "hunter2".to_string());
        env.insert("TERM_PROGRAM".to_string(), "webssh2".to_string());

        let filtered = filter_env(&env);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("TERM_PROGRAM"));
    }

    #[test]
    fn oversized_values_are_truncated() {
        let mut env = HashMap::new();
        env.insert("BIG".to_string(), "x".repeat(2 * ENV_VALUE_MAX));
        let filtered = filter_env(&env);
        assert_eq!(filtered["BIG"].len(), ENV_VALUE_MAX);
    }

    #[test]
    fn destructive_commands_are_blocked() {
        assert!(command_permitted("ls -la; rm -rf /").is_err());
        assert!(command_permitted("dd if=/dev/zero of=/dev/sda").is_err());
        assert!(command_permitted("echo x > /dev/sda").is_err());
        assert!(command_permitted("mkfs.ext4 /dev/sdb1").is_err());

        assert!(command_permitted("ls -la /tmp").is_ok());
        assert!(command_permitted("grep -r 'of=/device' notes.txt").is_ok());
    }

    #[test]
    fn rate_limit_drops_over_budget() {
        let limits = SocketLimits::default();
        let mut admitted = 0;
        for _ in 0..20 {
            if limits.admit(RiskyMessage::Exec) {
                admitted += 1;
            }
        }
        // burst capacity is 5
        assert!(admitted <= 6);
        // other kinds are unaffected
        assert!(limits.admit(RiskyMessage::Control));
    }

    /// Minimal POSIX single-quote interpreter, the inverse of
    /// `escape_shell_arg`.
    fn unquote(escaped: &str) -> String {
        let mut out = String::new();
        let mut chars = escaped.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '\'' => {
                    // inside quotes until the next '
                    for inner in chars.by_ref() {
                        if inner == '\'' {
                            break;
                        }
                        out.push(inner);
                    }
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                other => out.push(other),
            }
        }
        out
    }

    #[test]
    fn escaper_round_trips_through_posix_quoting() {
        let cases = [
            "plain",
            "with spaces",
            "single'quote",
            "'leading",
            "trailing'",
            "''double''",
            "$HOME `cmd` \"quoted\" \\back",
            "newline\nand\ttab",
            "ünïcödé 字符",
        ];
        for case in cases {
            assert_eq!(unquote(&escape_shell_arg(case)), case, "case {case:?}");
        }
    }
}
