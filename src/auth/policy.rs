//! Auth-method policy evaluation

use serde::Serialize;

use crate::config::AuthSection;

/// Which authentication methods the gateway will offer to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethodPolicy {
    pub password: bool,
    pub publickey: bool,
    pub keyboard_interactive: bool,
}

impl AuthMethodPolicy {
    pub fn from_config(section: &AuthSection) -> Self {
        Self {
            password: section.password,
            publickey: section.publickey,
            keyboard_interactive: section.keyboard_interactive,
        }
    }

    pub fn permits(&self, method: &str) -> bool {
        match method {
            "password" => self.password,
            "publickey" => self.publickey,
            "keyboard-interactive" => self.keyboard_interactive,
            _ => false,
        }
    }

    pub fn permitted_methods(&self) -> Vec<&'static str> {
        let mut methods = Vec::new();
        if self.password {
            methods.push("password");
        }
        if self.publickey {
            methods.push("publickey");
        }
        if self.keyboard_interactive {
            methods.push("keyboard-interactive");
        }
        methods
    }

    pub fn any_permitted(&self) -> bool {
        self.password || self.publickey || self.keyboard_interactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_filters_methods() {
        let policy = AuthMethodPolicy {
            password: true,
            publickey: false,
            keyboard_interactive: true,
        };
        assert!(policy.permits("password"));
        assert!(!policy.permits("publickey"));
        assert!(policy.permits("keyboard-interactive"));
        assert!(!policy.permits("hostbased"));
        assert_eq!(
            policy.permitted_methods(),
            vec!["password", "keyboard-interactive"]
        );
    }
}
