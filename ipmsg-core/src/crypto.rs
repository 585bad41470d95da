//! Process key pairs and crypto primitives: RSA key wrap, AES-256/Blowfish-128 CBC bodies,
//! PKCS#1 v1.5 signatures, and the sealed-message envelope built from them.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::capability::{CryptoCapability, KeySize, SignHash, SymmetricSuite};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type BlowfishCbcEnc = cbc::Encryptor<blowfish::Blowfish>;
type BlowfishCbcDec = cbc::Decryptor<blowfish::Blowfish>;

const RSA_EXPONENT: u32 = 65_537;

/// Peer public key as exchanged on the wire: exponent and big-endian modulus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    exponent: u32,
    modulus: Vec<u8>,
}

impl PublicKey {
    pub fn new(exponent: u32, modulus: Vec<u8>) -> Self {
        let start = modulus.iter().position(|&b| b != 0).unwrap_or(modulus.len());
        PublicKey {
            exponent,
            modulus: modulus[start..].to_vec(),
        }
    }

    fn from_rsa(key: &RsaPublicKey) -> Result<Self, CryptoError> {
        let exponent = key
            .e()
            .to_bytes_be()
            .iter()
            .try_fold(0u32, |acc, &b| acc.checked_mul(256).map(|v| v | u32::from(b)))
            .ok_or(CryptoError::InvalidKey)?;
        Ok(PublicKey::new(exponent, key.n().to_bytes_be()))
    }

    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// `None` for moduli that are neither 1024 nor 2048 bits.
    pub fn key_size(&self) -> Option<KeySize> {
        KeySize::from_bits(self.modulus.len() * 8)
    }

    pub fn fingerprint(&self) -> [u8; 16] {
        fingerprint(&self.modulus)
    }

    /// `<exponent hex>-<modulus hex>`.
    pub fn to_wire(&self) -> String {
        format!("{:x}-{}", self.exponent, hex::encode(&self.modulus))
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        let (e, n) = s.trim().split_once('-')?;
        let exponent = u32::from_str_radix(e, 16).ok()?;
        let modulus = hex::decode(n).ok()?;
        let key = PublicKey::new(exponent, modulus);
        key.key_size().map(|_| key)
    }

    fn to_rsa(&self) -> Result<RsaPublicKey, CryptoError> {
        RsaPublicKey::new(
            BigUint::from_bytes_be(&self.modulus),
            BigUint::from(self.exponent),
        )
        .map_err(|_| CryptoError::InvalidKey)
    }
}

/// Short digest of a public-key modulus for trust display. Not an authorization input.
pub fn fingerprint(modulus: &[u8]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(modulus);
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// This process's RSA key pairs (1024-bit legacy, 2048-bit current) and capability set.
pub struct CryptoEngine {
    key_1024: RsaPrivateKey,
    key_2048: RsaPrivateKey,
    public_1024: PublicKey,
    public_2048: PublicKey,
    capability: CryptoCapability,
}

impl CryptoEngine {
    /// Generate both key pairs from the OS entropy source.
    pub fn startup() -> Result<Self, CryptoError> {
        let key_1024 = RsaPrivateKey::new(&mut OsRng, KeySize::Rsa1024.bits())
            .map_err(|e| CryptoError::CryptoInit(e.to_string()))?;
        let key_2048 = RsaPrivateKey::new(&mut OsRng, KeySize::Rsa2048.bits())
            .map_err(|e| CryptoError::CryptoInit(e.to_string()))?;
        tracing::debug!("generated RSA-1024 and RSA-2048 key pairs");
        Self::from_keys(key_1024, key_2048)
    }

    /// Build from existing keys; each must have the expected modulus size.
    pub fn from_keys(key_1024: RsaPrivateKey, key_2048: RsaPrivateKey) -> Result<Self, CryptoError> {
        if key_1024.size() * 8 != KeySize::Rsa1024.bits()
            || key_2048.size() * 8 != KeySize::Rsa2048.bits()
        {
            return Err(CryptoError::CryptoInit("unexpected RSA key size".into()));
        }
        let public_1024 = PublicKey::from_rsa(&key_1024.to_public_key())
            .map_err(|e| CryptoError::CryptoInit(e.to_string()))?;
        let public_2048 = PublicKey::from_rsa(&key_2048.to_public_key())
            .map_err(|e| CryptoError::CryptoInit(e.to_string()))?;
        Ok(Self {
            key_1024,
            key_2048,
            public_1024,
            public_2048,
            capability: CryptoCapability::full(),
        })
    }

    /// Release the key material.
    pub fn shutdown(self) {
        drop(self);
    }

    pub fn capability(&self) -> CryptoCapability {
        self.capability
    }

    pub fn public_key(&self, size: KeySize) -> &PublicKey {
        match size {
            KeySize::Rsa1024 => &self.public_1024,
            KeySize::Rsa2048 => &self.public_2048,
        }
    }

    fn private_key(&self, size: KeySize) -> &RsaPrivateKey {
        match size {
            KeySize::Rsa1024 => &self.key_1024,
            KeySize::Rsa2048 => &self.key_2048,
        }
    }

    pub fn random_bytes(&self, n: usize) -> Result<Vec<u8>, CryptoError> {
        random_bytes(n)
    }

    pub fn encrypt_asymmetric(&self, data: &[u8], peer: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        peer.to_rsa()?
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
            .map_err(|_| CryptoError::Encrypt)
    }

    /// Decrypt with the own key of `key_bits`; there is none for sizes other than 1024/2048.
    pub fn decrypt_asymmetric(&self, data: &[u8], key_bits: usize) -> Result<Vec<u8>, CryptoError> {
        let size = KeySize::from_bits(key_bits).ok_or(CryptoError::KeySizeMismatch)?;
        self.private_key(size)
            .decrypt(Pkcs1v15Encrypt, data)
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn sign(&self, data: &[u8], size: KeySize, hash: SignHash) -> Result<Vec<u8>, CryptoError> {
        let (scheme, digest) = sign_input(data, hash);
        self.private_key(size)
            .sign(scheme, &digest)
            .map_err(|_| CryptoError::Sign)
    }

    /// Build a sealed payload for `peer` under the negotiated capability:
    /// `<capability hex>:<wrapped key hex>:<body>[:<signature hex>]`.
    pub fn seal(
        &self,
        text: &str,
        peer: &PublicKey,
        negotiated: &CryptoCapability,
    ) -> Result<String, CryptoError> {
        let (suite, size) = match (negotiated.suite(), negotiated.key_size()) {
            (Some(s), Some(k)) => (s, k),
            _ => return Err(CryptoError::NoCommonSuite),
        };
        if peer.key_size() != Some(size) {
            return Err(CryptoError::KeySizeMismatch);
        }
        let session_key = self.random_bytes(suite.key_len())?;
        let iv = if negotiated.packet_no_iv {
            None
        } else {
            Some(self.random_bytes(suite.block_len())?)
        };
        let cipher = encrypt_symmetric(text.as_bytes(), &session_key, iv.as_deref(), suite)?;
        let mut body = iv.unwrap_or_default();
        body.extend_from_slice(&cipher);
        let body = if negotiated.encode_base64 {
            BASE64.encode(&body)
        } else {
            hex::encode(&body)
        };
        let wrapped = self.encrypt_asymmetric(&session_key, peer)?;
        let mut out = format!("{}:{}:{}", negotiated.to_hex(), hex::encode(wrapped), body);
        if let Some(hash) = negotiated.sign_hash() {
            let signature = self.sign(text.as_bytes(), size, hash)?;
            out.push(':');
            out.push_str(&hex::encode(signature));
        }
        Ok(out)
    }

    /// Open a sealed payload. The signature, if any, is checked against `peer`.
    pub fn unseal(&self, payload: &str, peer: Option<&PublicKey>) -> Result<Unsealed, CryptoError> {
        let parts: Vec<&str> = payload.trim_end().split(':').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(CryptoError::Malformed);
        }
        let capability = CryptoCapability::from_hex(parts[0]).ok_or(CryptoError::Malformed)?;
        let (suite, size) = match (capability.suite(), capability.key_size()) {
            (Some(s), Some(k)) => (s, k),
            _ => return Err(CryptoError::Malformed),
        };
        let wrapped = hex::decode(parts[1]).map_err(|_| CryptoError::Malformed)?;
        let session_key = self.decrypt_asymmetric(&wrapped, size.bits())?;
        let body = if capability.encode_base64 {
            BASE64.decode(parts[2]).map_err(|_| CryptoError::Malformed)?
        } else {
            hex::decode(parts[2]).map_err(|_| CryptoError::Malformed)?
        };
        let plain = if capability.packet_no_iv {
            decrypt_symmetric(&body, &session_key, None, suite)?
        } else {
            if body.len() < suite.block_len() {
                return Err(CryptoError::Malformed);
            }
            let (iv, cipher) = body.split_at(suite.block_len());
            decrypt_symmetric(cipher, &session_key, Some(iv), suite)?
        };
        let text = String::from_utf8(plain).map_err(|_| CryptoError::Decrypt)?;
        let signature = match parts.get(3) {
            None => SignatureCheck::Absent,
            Some(sig) => {
                let valid = match (peer, capability.sign_hash(), hex::decode(sig)) {
                    (Some(key), Some(hash), Ok(sig)) => verify(text.as_bytes(), &sig, key, hash),
                    _ => false,
                };
                if valid {
                    SignatureCheck::Valid
                } else {
                    SignatureCheck::Invalid
                }
            }
        };
        Ok(Unsealed {
            text,
            capability,
            signature,
        })
    }
}

/// Result of opening a sealed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsealed {
    pub text: String,
    /// Capability the sender sealed with.
    pub capability: CryptoCapability,
    pub signature: SignatureCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Absent,
    Valid,
    /// Mismatch, or no peer key to check against.
    Invalid,
}

/// Cryptographically secure random bytes.
pub fn random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|_| CryptoError::Entropy)?;
    Ok(buf)
}

/// CBC + PKCS#7. `iv = None` means the all-zero IV used by peers that negotiated
/// `packet_no_iv`; this is a known weakening kept for interoperability.
pub fn encrypt_symmetric(
    data: &[u8],
    key: &[u8],
    iv: Option<&[u8]>,
    suite: SymmetricSuite,
) -> Result<Vec<u8>, CryptoError> {
    let zero = vec![0u8; suite.block_len()];
    let iv = iv.unwrap_or(&zero);
    if key.len() != suite.key_len() {
        return Err(CryptoError::InvalidKey);
    }
    match suite {
        SymmetricSuite::Aes256 => Ok(Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKey)?
            .encrypt_padded_vec_mut::<Pkcs7>(data)),
        SymmetricSuite::Blowfish128 => Ok(BlowfishCbcEnc::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKey)?
            .encrypt_padded_vec_mut::<Pkcs7>(data)),
    }
}

pub fn decrypt_symmetric(
    data: &[u8],
    key: &[u8],
    iv: Option<&[u8]>,
    suite: SymmetricSuite,
) -> Result<Vec<u8>, CryptoError> {
    let zero = vec![0u8; suite.block_len()];
    let iv = iv.unwrap_or(&zero);
    if key.len() != suite.key_len() {
        return Err(CryptoError::InvalidKey);
    }
    match suite {
        SymmetricSuite::Aes256 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKey)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| CryptoError::Decrypt),
        SymmetricSuite::Blowfish128 => BlowfishCbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKey)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| CryptoError::Decrypt),
    }
}

/// `false` on any mismatch, malformed key or malformed signature.
pub fn verify(data: &[u8], signature: &[u8], peer: &PublicKey, hash: SignHash) -> bool {
    let Ok(key) = peer.to_rsa() else {
        return false;
    };
    let (scheme, digest) = sign_input(data, hash);
    key.verify(scheme, &digest, signature).is_ok()
}

fn sign_input(data: &[u8], hash: SignHash) -> (Pkcs1v15Sign, Vec<u8>) {
    match hash {
        SignHash::Sha1 => (Pkcs1v15Sign::new::<Sha1>(), Sha1::digest(data).to_vec()),
        SignHash::Sha256 => (Pkcs1v15Sign::new::<Sha256>(), Sha256::digest(data).to_vec()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("crypto provider initialisation failed: {0}")]
    CryptoInit(String),
    #[error("entropy source unavailable")]
    Entropy,
    #[error("no local key of the requested size")]
    KeySizeMismatch,
    #[error("invalid key")]
    InvalidKey,
    #[error("no mutually supported cipher suite")]
    NoCommonSuite,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("signing failed")]
    Sign,
    #[error("malformed sealed payload")]
    Malformed,
}
