//! Configuration Management Module
//!
//! Loads the gateway configuration from an optional JSON file, overlays
//! `WEBSSH2_*` environment variables, and validates the result at boot.

mod env;
mod types;

pub use env::{apply_env, EnvKind, ENV_TABLE};
pub use types::{
    AuthSection, GatewayConfig, HeaderSection, ListenConfig, LoggingSection, OptionsSection,
    RecordingSection, SessionCookieConfig, SshSection, SyslogSection, TelnetSection,
    TerminalSection,
};

use std::path::Path;

use tracing::info;

use crate::error::ConfigError;

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Load configuration: file (if present) -> env overlay -> validate.
pub fn load(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("cannot read {}: {e}", path.display())))?;
        let config: GatewayConfig = serde_json::from_str(&raw)
            .map_err(|e| ConfigError(format!("cannot parse {}: {e}", path.display())))?;
        info!(path = %path.display(), "loaded configuration file");
        config
    } else {
        info!("no configuration file, using defaults");
        GatewayConfig::default()
    };

    apply_env(&mut config, std::env::vars())?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen": {{"port": 9999}}, "options": {{"allowExec": true}}}}"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.listen.port, 9999);
        assert!(config.options.allow_exec);
        // untouched sections keep defaults
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load(Some(Path::new("/nonexistent/webssh2-config.json"))).unwrap();
        assert_eq!(config.listen.port, 2222);
    }
}
