//! Webhook message crypto for WeCom-style callbacks.
//!
//! Signature: lower-hex SHA-1 over the lexicographically sorted
//! concatenation of `[token, timestamp, nonce, encrypt]`.
//!
//! Body: base64 of AES-256-CBC (IV = first 16 key bytes, no cipher padding)
//! over PKCS#7(block 32) of `random(16) ‖ len(4, BE) ‖ msg ‖ receive_id`.

use crate::envelope::EncryptedEnvelope;
use crate::error::{RelayError, RelayResult};
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::Engine;
use ring::digest;
use std::fmt;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the configured `EncodingAESKey` (base64 without the trailing `=`).
pub const ENCODING_KEY_LEN: usize = 43;

const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX: usize = 16;
const LEN_PREFIX: usize = 4;

/// The platform's key encoding is not always canonical in its last
/// character, so trailing bits are tolerated when decoding it.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Secret triple for one webhook endpoint.
#[derive(Clone)]
pub struct WebhookCrypto {
    token: String,
    key: [u8; 32],
    receive_id: String,
}

impl fmt::Debug for WebhookCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookCrypto")
            .field("receive_id", &self.receive_id)
            .finish_non_exhaustive()
    }
}

impl WebhookCrypto {
    /// Build from the verification token, the 43-char `EncodingAESKey` and
    /// the receive id (corp id) expected at the tail of every plaintext.
    pub fn new(
        token: impl Into<String>,
        encoding_aes_key: &str,
        receive_id: impl Into<String>,
    ) -> RelayResult<Self> {
        if encoding_aes_key.len() != ENCODING_KEY_LEN {
            return Err(RelayError::Config(format!(
                "encoding_aes_key must be {ENCODING_KEY_LEN} characters, got {}",
                encoding_aes_key.len()
            )));
        }
        let raw = LENIENT
            .decode(format!("{encoding_aes_key}="))
            .map_err(|e| RelayError::Config(format!("encoding_aes_key is not base64: {e}")))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|_| RelayError::Config("encoding_aes_key must decode to 32 bytes".into()))?;
        Ok(Self {
            token: token.into(),
            key,
            receive_id: receive_id.into(),
        })
    }

    pub fn receive_id(&self) -> &str {
        &self.receive_id
    }

    /// Compute the signature over the given fields.
    pub fn signature(&self, timestamp: &str, nonce: &str, encrypt: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp, nonce, encrypt];
        parts.sort_unstable();
        let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, parts.concat().as_bytes());
        hex::encode(digest.as_ref())
    }

    /// Check `signature` against the fields. Mismatch is an integrity error.
    pub fn verify_signature(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypt: &str,
    ) -> RelayResult<()> {
        let expected = self.signature(timestamp, nonce, encrypt);
        if constant_time_eq(expected.as_bytes(), signature.to_ascii_lowercase().as_bytes()) {
            Ok(())
        } else {
            Err(RelayError::Integrity("signature mismatch".into()))
        }
    }

    /// Verify then decrypt an envelope, returning the inner message bytes.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> RelayResult<Vec<u8>> {
        self.verify_signature(
            &envelope.signature,
            &envelope.timestamp,
            &envelope.nonce,
            &envelope.encrypt,
        )?;
        self.open(&envelope.encrypt)
    }

    /// URL verification challenge: returns the plaintext `echostr`.
    pub fn verify_url(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        echostr: &str,
    ) -> RelayResult<String> {
        self.verify_signature(signature, timestamp, nonce, echostr)?;
        let plain = self.open(echostr)?;
        String::from_utf8(plain).map_err(|_| RelayError::Integrity("echostr is not UTF-8".into()))
    }

    /// Encrypt and sign `plaintext`.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        timestamp: &str,
        nonce: &str,
    ) -> RelayResult<EncryptedEnvelope> {
        let len = u32::try_from(plaintext.len())
            .map_err(|_| RelayError::Protocol("message too large to encrypt".into()))?;

        let mut buf = Vec::with_capacity(
            RANDOM_PREFIX + LEN_PREFIX + plaintext.len() + self.receive_id.len() + PAD_BLOCK,
        );
        buf.extend_from_slice(&rand::random::<[u8; RANDOM_PREFIX]>());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(plaintext);
        buf.extend_from_slice(self.receive_id.as_bytes());
        pkcs7_pad(&mut buf);

        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.key[..16])
            .map_err(|e| RelayError::Config(format!("cipher init: {e}")))?;
        let encrypt = STANDARD.encode(cipher.encrypt_padded_vec_mut::<NoPadding>(&buf));

        Ok(EncryptedEnvelope {
            signature: self.signature(timestamp, nonce, &encrypt),
            timestamp: timestamp.to_string(),
            nonce: nonce.to_string(),
            encrypt,
        })
    }

    fn open(&self, encrypt: &str) -> RelayResult<Vec<u8>> {
        let ciphertext = STANDARD
            .decode(encrypt.trim())
            .map_err(|e| RelayError::Integrity(format!("ciphertext is not base64: {e}")))?;
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(RelayError::Integrity(format!(
                "ciphertext length {} is not a positive multiple of the block size",
                ciphertext.len()
            )));
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.key[..16])
            .map_err(|e| RelayError::Config(format!("cipher init: {e}")))?;
        let mut plain = cipher
            .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
            .map_err(|_| RelayError::Integrity("decryption failed".into()))?;
        pkcs7_unpad(&mut plain)?;

        if plain.len() < RANDOM_PREFIX + LEN_PREFIX {
            return Err(RelayError::Integrity("plaintext too short".into()));
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&plain[RANDOM_PREFIX..RANDOM_PREFIX + LEN_PREFIX]);
        let msg_len = u32::from_be_bytes(len_bytes) as usize;

        let body = &plain[RANDOM_PREFIX + LEN_PREFIX..];
        if msg_len > body.len() {
            return Err(RelayError::Integrity(format!(
                "declared length {msg_len} exceeds payload of {} bytes",
                body.len()
            )));
        }
        let (msg, tail) = body.split_at(msg_len);
        if tail != self.receive_id.as_bytes() {
            return Err(RelayError::Integrity("receive id mismatch".into()));
        }
        Ok(msg.to_vec())
    }
}

fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = PAD_BLOCK - buf.len() % PAD_BLOCK;
    buf.resize(buf.len() + pad, pad as u8);
}

fn pkcs7_unpad(buf: &mut Vec<u8>) -> RelayResult<()> {
    let pad = buf.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > buf.len() {
        return Err(RelayError::Integrity("invalid padding".into()));
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}

/// Length-checked comparison without an early exit on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
