//! SSH algorithm presets
//!
//! Named bundles of negotiation lists handed to russh. `Modern` is the
//! library default, `Strict` narrows to the contemporary minimum, and
//! `Legacy` additionally offers the old DH groups for ancient appliances.

use std::borrow::Cow;

use russh::{cipher, kex, Preferred};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmPreset {
    #[default]
    Modern,
    Legacy,
    Strict,
}

const STRICT_KEX: &[kex::Name] = &[kex::CURVE25519];
const STRICT_CIPHER: &[cipher::Name] = &[cipher::CHACHA20_POLY1305];

const LEGACY_KEX: &[kex::Name] = &[
    kex::CURVE25519,
    kex::DH_G14_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_G1_SHA1,
];

impl AlgorithmPreset {
    pub fn preferred(&self) -> Preferred {
        match self {
            AlgorithmPreset::Modern => Preferred::DEFAULT,
            AlgorithmPreset::Strict => Preferred {
                kex: Cow::Borrowed(STRICT_KEX),
                cipher: Cow::Borrowed(STRICT_CIPHER),
                ..Preferred::DEFAULT
            },
            AlgorithmPreset::Legacy => Preferred {
                kex: Cow::Borrowed(LEGACY_KEX),
                ..Preferred::DEFAULT
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_narrows_the_lists() {
        let strict = AlgorithmPreset::Strict.preferred();
        assert_eq!(strict.kex.len(), 1);
        assert_eq!(strict.cipher.len(), 1);
    }

    #[test]
    fn legacy_still_offers_curve25519_first() {
        let legacy = AlgorithmPreset::Legacy.preferred();
        assert_eq!(legacy.kex.first(), Some(&kex::CURVE25519));
        assert!(legacy.kex.len() > AlgorithmPreset::Strict.preferred().kex.len());
    }

    #[test]
    fn preset_parses_from_config() {
        let preset: AlgorithmPreset = serde_json::from_str("\"legacy\"").unwrap();
        assert_eq!(preset, AlgorithmPreset::Legacy);
    }
}
