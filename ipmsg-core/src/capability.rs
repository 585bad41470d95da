//! Crypto capability flags and pairwise negotiation.

use serde::{Deserialize, Serialize};

pub const RSA_1024: u32 = 0x0000_0002;
pub const RSA_2048: u32 = 0x0000_0004;
pub const BLOWFISH_128: u32 = 0x0002_0000;
pub const AES_256: u32 = 0x0010_0000;
pub const PACKETNO_IV: u32 = 0x0080_0000;
pub const ENCODE_BASE64: u32 = 0x0100_0000;
pub const SIGN_SHA256: u32 = 0x1000_0000;
pub const SIGN_SHA1: u32 = 0x2000_0000;

/// Symmetric cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymmetricSuite {
    Aes256,
    Blowfish128,
}

impl SymmetricSuite {
    pub fn key_len(self) -> usize {
        match self {
            SymmetricSuite::Aes256 => 32,
            SymmetricSuite::Blowfish128 => 16,
        }
    }

    pub fn block_len(self) -> usize {
        match self {
            SymmetricSuite::Aes256 => 16,
            SymmetricSuite::Blowfish128 => 8,
        }
    }
}

/// RSA modulus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeySize {
    Rsa1024,
    Rsa2048,
}

impl KeySize {
    pub fn bits(self) -> usize {
        match self {
            KeySize::Rsa1024 => 1024,
            KeySize::Rsa2048 => 2048,
        }
    }

    pub fn from_bits(bits: usize) -> Option<Self> {
        match bits {
            1024 => Some(KeySize::Rsa1024),
            2048 => Some(KeySize::Rsa2048),
            _ => None,
        }
    }
}

/// Signature digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignHash {
    Sha1,
    Sha256,
}

/// What one side supports. Absence of a flag means "not supported".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CryptoCapability {
    pub blowfish_128: bool,
    pub aes_256: bool,
    pub rsa_1024: bool,
    pub rsa_2048: bool,
    /// Symmetric encryption with a fixed zero IV (legacy interop).
    pub packet_no_iv: bool,
    pub encode_base64: bool,
    pub sign_sha1: bool,
    pub sign_sha256: bool,
}

impl CryptoCapability {
    /// Everything this engine implements.
    pub fn full() -> Self {
        Self {
            blowfish_128: true,
            aes_256: true,
            rsa_1024: true,
            rsa_2048: true,
            packet_no_iv: true,
            encode_base64: true,
            sign_sha1: true,
            sign_sha256: true,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            blowfish_128: bits & BLOWFISH_128 != 0,
            aes_256: bits & AES_256 != 0,
            rsa_1024: bits & RSA_1024 != 0,
            rsa_2048: bits & RSA_2048 != 0,
            packet_no_iv: bits & PACKETNO_IV != 0,
            encode_base64: bits & ENCODE_BASE64 != 0,
            sign_sha1: bits & SIGN_SHA1 != 0,
            sign_sha256: bits & SIGN_SHA256 != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        for (set, flag) in [
            (self.blowfish_128, BLOWFISH_128),
            (self.aes_256, AES_256),
            (self.rsa_1024, RSA_1024),
            (self.rsa_2048, RSA_2048),
            (self.packet_no_iv, PACKETNO_IV),
            (self.encode_base64, ENCODE_BASE64),
            (self.sign_sha1, SIGN_SHA1),
            (self.sign_sha256, SIGN_SHA256),
        ] {
            if set {
                bits |= flag;
            }
        }
        bits
    }

    pub fn to_hex(&self) -> String {
        format!("{:x}", self.bits())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u32::from_str_radix(s.trim(), 16).ok().map(Self::from_bits)
    }

    /// At least one cipher and one key size.
    pub fn support_encryption(&self) -> bool {
        (self.aes_256 || self.blowfish_128) && (self.rsa_1024 || self.rsa_2048)
    }

    pub fn support_fingerprint(&self) -> bool {
        self.rsa_2048 && self.sign_sha256
    }

    /// Preferred cipher among the flags set.
    pub fn suite(&self) -> Option<SymmetricSuite> {
        if self.aes_256 {
            Some(SymmetricSuite::Aes256)
        } else if self.blowfish_128 {
            Some(SymmetricSuite::Blowfish128)
        } else {
            None
        }
    }

    pub fn key_size(&self) -> Option<KeySize> {
        if self.rsa_2048 {
            Some(KeySize::Rsa2048)
        } else if self.rsa_1024 {
            Some(KeySize::Rsa1024)
        } else {
            None
        }
    }

    pub fn sign_hash(&self) -> Option<SignHash> {
        if self.sign_sha256 {
            Some(SignHash::Sha256)
        } else if self.sign_sha1 {
            Some(SignHash::Sha1)
        } else {
            None
        }
    }

    /// Pick the session suite both sides support: one cipher (AES-256 over Blowfish-128), one key
    /// size (2048 over 1024), at most one hash (SHA-256 over SHA-1); options are ANDed.
    /// With no mutual cipher or key size the result is empty and encryption is off for the pair.
    pub fn intersect(&self, other: &Self) -> Self {
        let aes = self.aes_256 && other.aes_256;
        let blowfish = !aes && self.blowfish_128 && other.blowfish_128;
        let rsa_2048 = self.rsa_2048 && other.rsa_2048;
        let rsa_1024 = !rsa_2048 && self.rsa_1024 && other.rsa_1024;
        if !(aes || blowfish) || !(rsa_2048 || rsa_1024) {
            return Self::default();
        }
        let sign_sha256 = self.sign_sha256 && other.sign_sha256;
        let sign_sha1 = !sign_sha256 && self.sign_sha1 && other.sign_sha1;
        Self {
            blowfish_128: blowfish,
            aes_256: aes,
            rsa_1024,
            rsa_2048,
            packet_no_iv: self.packet_no_iv && other.packet_no_iv,
            encode_base64: self.encode_base64 && other.encode_base64,
            sign_sha1,
            sign_sha256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_BITS: u32 = RSA_1024
        | RSA_2048
        | BLOWFISH_128
        | AES_256
        | PACKETNO_IV
        | ENCODE_BASE64
        | SIGN_SHA1
        | SIGN_SHA256;

    #[test]
    fn bits_roundtrip() {
        let cap = CryptoCapability::full();
        assert_eq!(cap.bits(), ALL_BITS);
        assert_eq!(CryptoCapability::from_hex(&cap.to_hex()), Some(cap));
    }

    #[test]
    fn prefers_strongest_suite() {
        let cap = CryptoCapability::full().intersect(&CryptoCapability::full());
        assert_eq!(cap.suite(), Some(SymmetricSuite::Aes256));
        assert!(!cap.blowfish_128);
        assert_eq!(cap.key_size(), Some(KeySize::Rsa2048));
        assert!(!cap.rsa_1024);
        assert_eq!(cap.sign_hash(), Some(SignHash::Sha256));
        assert!(!cap.sign_sha1);
    }

    #[test]
    fn legacy_peer_gets_legacy_suite() {
        let legacy = CryptoCapability::from_bits(RSA_1024 | BLOWFISH_128 | PACKETNO_IV);
        let cap = CryptoCapability::full().intersect(&legacy);
        assert_eq!(cap.suite(), Some(SymmetricSuite::Blowfish128));
        assert_eq!(cap.key_size(), Some(KeySize::Rsa1024));
        assert_eq!(cap.sign_hash(), None);
        assert!(cap.packet_no_iv);
        assert!(cap.support_encryption());
    }

    #[test]
    fn no_mutual_cipher_disables_encryption() {
        let a = CryptoCapability::from_bits(RSA_2048 | AES_256 | SIGN_SHA256);
        let b = CryptoCapability::from_bits(RSA_2048 | BLOWFISH_128 | SIGN_SHA256);
        let cap = a.intersect(&b);
        assert_eq!(cap, CryptoCapability::default());
        assert!(!cap.support_encryption());
    }

    proptest! {
        #[test]
        fn intersect_is_commutative(a in 0u32..=u32::MAX, b in 0u32..=u32::MAX) {
            let a = CryptoCapability::from_bits(a);
            let b = CryptoCapability::from_bits(b);
            prop_assert_eq!(a.intersect(&b), b.intersect(&a));
        }

        #[test]
        fn intersect_never_invents_flags(a in 0u32..=u32::MAX, b in 0u32..=u32::MAX) {
            let ca = CryptoCapability::from_bits(a);
            let cb = CryptoCapability::from_bits(b);
            let bits = ca.intersect(&cb).bits();
            prop_assert_eq!(bits & !(a & b), 0);
        }
    }
}
