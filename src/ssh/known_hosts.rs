//! Host key verification and persistence
//!
//! Accepted keys are stored keyed by `(host, port)` in an OpenSSH-style
//! known_hosts file. An unknown key is surfaced to the owning socket as an
//! interactive prompt (accept / accept-and-remember / reject); a changed
//! key is always an error and is never auto-accepted.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::prompt::{PromptButton, PromptDispatcher, PromptPayload};

use super::error::SshError;

/// How long the browser gets to answer a host key prompt.
const HOST_KEY_PROMPT_TIMEOUT_MS: u64 = 90_000;

/// Result of checking a presented key against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Key matches the stored entry.
    Verified,
    /// No entry for this host yet (first connection).
    Unknown { fingerprint: String },
    /// Stored entry differs (potential MITM).
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// SHA256 fingerprint in the OpenSSH presentation form.
pub fn fingerprint(key: &PublicKey) -> String {
    let key_data = key.public_key_base64();
    let raw = BASE64.decode(&key_data).unwrap_or_default();
    let digest = Sha256::digest(&raw);
    format!("SHA256:{}", BASE64.encode(digest))
}

fn fingerprint_of_entry(entry: &HostKeyEntry) -> String {
    let raw = BASE64.decode(&entry.key_data).unwrap_or_default();
    let digest = Sha256::digest(&raw);
    format!("SHA256:{}", BASE64.encode(digest))
}

fn store_key(host: &str, port: u16) -> String {
    format!("[{host}]:{port}")
}

/// File-backed store of accepted host keys.
pub struct HostKeyStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl HostKeyStore {
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".webssh2").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".webssh2_known_hosts"));
        Self::with_path(path)
    }

    /// Custom path, used by tests.
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };
        if let Err(e) = store.load() {
            debug!("known_hosts not loaded: {e}");
        }
        store
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }
        let file = fs::File::open(&self.path).map_err(SshError::IoError)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();

        for line in reader.lines() {
            let line = line.map_err(SshError::IoError)?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Format: [host]:port keytype base64key
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }
            hosts.entry(parts[0].to_string()).or_default().push(HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            });
        }
        Ok(())
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let key_data = key.public_key_base64();
        let hosts = self.hosts.read();

        match hosts.get(&store_key(host, port)) {
            None => HostKeyVerification::Unknown {
                fingerprint: fingerprint(key),
            },
            Some(entries) => {
                if entries.iter().any(|e| e.key_data == key_data) {
                    HostKeyVerification::Verified
                } else {
                    let expected = entries
                        .first()
                        .map(fingerprint_of_entry)
                        .unwrap_or_default();
                    HostKeyVerification::Changed {
                        expected_fingerprint: expected,
                        actual_fingerprint: fingerprint(key),
                    }
                }
            }
        }
    }

    /// Persist an accepted key for `(host, port)`.
    pub fn add(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let entry = HostKeyEntry {
            key_type: key.algorithm().to_string(),
            key_data: key.public_key_base64(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SshError::IoError)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(SshError::IoError)?;
        writeln!(
            file,
            "{} {} {}",
            store_key(host, port),
            entry.key_type,
            entry.key_data
        )
        .map_err(SshError::IoError)?;

        self.hosts
            .write()
            .entry(store_key(host, port))
            .or_default()
            .push(entry);
        Ok(())
    }
}

impl Default for HostKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Verification policy plus the interactive accept flow.
pub struct HostKeyService {
    store: HostKeyStore,
    /// When disabled, unknown keys are accepted (and logged); changed keys
    /// are still fatal.
    enabled: bool,
}

impl HostKeyService {
    pub fn new(store: HostKeyStore, enabled: bool) -> Self {
        Self { store, enabled }
    }

    pub fn store(&self) -> &HostKeyStore {
        &self.store
    }

    /// Check `key` for `host:port`, prompting the owning socket for unknown
    /// keys when a dispatcher is available.
    pub async fn verify(
        &self,
        host: &str,
        port: u16,
        key: &PublicKey,
        prompter: Option<&PromptDispatcher>,
    ) -> Result<bool, SshError> {
        match self.store.verify(host, port, key) {
            HostKeyVerification::Verified => {
                debug!(host, port, "host key verified");
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    host,
                    port,
                    expected = %expected_fingerprint,
                    actual = %actual_fingerprint,
                    "HOST KEY CHANGED - possible MITM"
                );
                Err(SshError::HostKeyChanged {
                    host: host.to_string(),
                    port,
                    expected: expected_fingerprint,
                    actual: actual_fingerprint,
                })
            }
            HostKeyVerification::Unknown { fingerprint: fp } => {
                if !self.enabled {
                    info!(host, port, fingerprint = %fp, "accepting unverified host key");
                    return Ok(true);
                }

                let Some(prompter) = prompter else {
                    return Err(SshError::HostKeyRejected {
                        host: host.to_string(),
                        port,
                        fingerprint: fp,
                    });
                };

                let payload = PromptPayload {
                    id: String::new(),
                    title: format!("Unknown host {host}:{port}"),
                    message: Some(format!(
                        "The host key is not known. Fingerprint: {fp}"
                    )),
                    icon: Some("host".to_string()),
                    buttons: vec![
                        PromptButton {
                            action: "accept".into(),
                            label: "Accept once".into(),
                        },
                        PromptButton {
                            action: "remember".into(),
                            label: "Accept and remember".into(),
                        },
                        PromptButton {
                            action: "reject".into(),
                            label: "Reject".into(),
                        },
                    ],
                    inputs: vec![],
                    timeout: HOST_KEY_PROMPT_TIMEOUT_MS,
                };

                let response = prompter
                    .ask(payload)
                    .await
                    .map_err(|e| SshError::ConnectionFailed(format!("host key prompt: {e}")))?;

                match response.action.as_str() {
                    "accept" => {
                        info!(host, port, fingerprint = %fp, "host key accepted for this session");
                        Ok(true)
                    }
                    "remember" => {
                        if let Err(e) = self.store.add(host, port, key) {
                            warn!("failed to persist host key: {e}");
                        }
                        info!(host, port, fingerprint = %fp, "host key accepted and saved");
                        Ok(true)
                    }
                    _ => Err(SshError::HostKeyRejected {
                        host: host.to_string(),
                        port,
                        fingerprint: fp,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const SAMPLE_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@host";

    fn sample_key() -> PublicKey {
        PublicKey::from_str(SAMPLE_KEY).unwrap()
    }

    #[test]
    fn unknown_then_remembered_then_verified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = HostKeyStore::with_path(path.clone());
        let key = sample_key();

        assert!(matches!(
            store.verify("example.com", 22, &key),
            HostKeyVerification::Unknown { .. }
        ));

        store.add("example.com", 22, &key).unwrap();
        assert_eq!(
            store.verify("example.com", 22, &key),
            HostKeyVerification::Verified
        );

        // same host on another port is a distinct entry
        assert!(matches!(
            store.verify("example.com", 2222, &key),
            HostKeyVerification::Unknown { .. }
        ));

        // persisted: a fresh store sees the accepted key
        let reloaded = HostKeyStore::with_path(path);
        assert_eq!(
            reloaded.verify("example.com", 22, &key),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn fingerprint_is_stable_sha256() {
        let key = sample_key();
        let fp = fingerprint(&key);
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(fp, fingerprint(&key));
    }
}
