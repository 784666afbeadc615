//! SSH adapter module
//!
//! russh-backed implementation of the protocol adapter contract, host key
//! verification, keyboard-interactive forwarding, and the SFTP capability.

mod algorithms;
mod channel;
mod client;
mod error;
mod keyboard_interactive;
mod known_hosts;
mod sftp;

pub use algorithms::AlgorithmPreset;
pub use channel::{spawn_exec_channel, spawn_shell_channel};
pub use client::{GatewayClientHandler, SshAdapter};
pub use error::SshError;
pub use keyboard_interactive::{InteractivePrompt, KeyboardInteractivePrompter};
pub use known_hosts::{fingerprint, HostKeyService, HostKeyStore, HostKeyVerification};
pub use sftp::{SftpChannel, SftpDirEntry};
