// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope Codec
//!
//! Wraps a typed payload and its trace metadata into the JSON envelope carried on
//! the wire:
//!
//! ```json
//! { "Data": { ... }, "MetaData": { "MessageId": "...", "CorrelationId": null, ... } }
//! ```
//!
//! With an [`EncryptionKey`] the serialized envelope is encrypted with AES-CBC and
//! PKCS7 padding under a fresh random IV, and the body becomes
//! `base64(iv) + "." + base64(ciphertext)`. The key never travels with the message.

use crate::errors::CodecError;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use std::fmt;

/// Separator between the encoded IV and the encoded ciphertext.
pub const ENCRYPTED_BODY_SEPARATOR: char = '.';

/// AES block size, also the IV length for CBC.
pub const IV_LEN: usize = 16;

/// Trace metadata carried end-to-end with every message.
///
/// The retry policy never looks at it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MetaData {
    pub message_id: Option<String>,
    pub message_version: Option<String>,
    pub correlation_id: Option<String>,
    pub creation_date_time: Option<DateTime<Utc>>,
    pub enqueued_date_time: Option<DateTime<Utc>>,
}

/// A payload together with its metadata, as serialized on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageEnvelope<T> {
    pub data: T,
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta_data: MetaData,
}

impl<T> MessageEnvelope<T> {
    pub fn new(data: T, meta_data: MetaData) -> Self {
        MessageEnvelope { data, meta_data }
    }

    pub fn into_parts(self) -> (T, MetaData) {
        (self.data, self.meta_data)
    }
}

fn null_as_default<'de, D>(deserializer: D) -> Result<MetaData, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<MetaData>::deserialize(deserializer)?.unwrap_or_default())
}

/// Symmetric key used to encrypt envelopes. 16, 24 or 32 bytes select
/// AES-128, AES-192 or AES-256.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    pub fn new(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes.len() {
            16 | 24 | 32 => Ok(EncryptionKey(bytes.to_vec())),
            n => Err(CodecError::InvalidKey(format!(
                "expected 16, 24 or 32 bytes, got {n}"
            ))),
        }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CodecError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|err| CodecError::InvalidKey(err.to_string()))?;
        Self::new(&bytes)
    }

    /// Generates a random AES-256 key.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        EncryptionKey(bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    fn encrypt(&self, iv: &[u8; IV_LEN], plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        let invalid = |_| CodecError::InvalidKey("key rejected by cipher".to_owned());
        let ciphertext = match self.0.len() {
            16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(&self.0, iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
            24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(&self.0, iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
            _ => cbc::Encryptor::<aes::Aes256>::new_from_slices(&self.0, iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
        };
        Ok(ciphertext)
    }

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let plain = match self.0.len() {
            16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(&self.0, iv)
                .map_err(|_| CodecError::Malformed("invalid iv length".to_owned()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(&self.0, iv)
                .map_err(|_| CodecError::Malformed("invalid iv length".to_owned()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            _ => cbc::Decryptor::<aes::Aes256>::new_from_slices(&self.0, iv)
                .map_err(|_| CodecError::Malformed("invalid iv length".to_owned()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        };
        plain.map_err(|_| CodecError::Decryption)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey(AES-{})", self.0.len() * 8)
    }
}

/// Result of [`encode`]: the body to publish plus the IV when it was encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub body: Vec<u8>,
    pub iv: Option<[u8; IV_LEN]>,
}

/// Serializes `payload` and `metadata` into a transport-ready body, encrypting it
/// when a key is supplied.
pub fn encode<T>(
    payload: &T,
    metadata: &MetaData,
    key: Option<&EncryptionKey>,
) -> Result<EncodedMessage, CodecError>
where
    T: Serialize,
{
    let envelope = EnvelopeRef {
        data: payload,
        meta_data: metadata,
    };
    let serialized =
        serde_json::to_vec(&envelope).map_err(|err| CodecError::Serialization(err.to_string()))?;

    let Some(key) = key else {
        return Ok(EncodedMessage {
            body: serialized,
            iv: None,
        });
    };

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = key.encrypt(&iv, &serialized)?;
    let body = format!(
        "{}{}{}",
        BASE64.encode(iv),
        ENCRYPTED_BODY_SEPARATOR,
        BASE64.encode(ciphertext)
    );

    Ok(EncodedMessage {
        body: body.into_bytes(),
        iv: Some(iv),
    })
}

/// Reverses [`encode`]. The key must match the one used to encode.
pub fn decode<T>(body: &[u8], key: Option<&EncryptionKey>) -> Result<(T, MetaData), CodecError>
where
    T: DeserializeOwned,
{
    let plain = match key {
        Some(key) => {
            let (iv, ciphertext) = split_encrypted_body(body)?;
            key.decrypt(&iv, &ciphertext)?
        }
        None => body.to_vec(),
    };

    let envelope: MessageEnvelope<T> = serde_json::from_slice(&plain)
        .map_err(|err| CodecError::Malformed(format!("invalid envelope: {err}")))?;

    Ok(envelope.into_parts())
}

fn split_encrypted_body(body: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CodecError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| CodecError::Malformed("encrypted body is not utf-8".to_owned()))?;

    let Some((iv, ciphertext)) = text.split_once(ENCRYPTED_BODY_SEPARATOR) else {
        return Err(CodecError::Malformed("missing iv separator".to_owned()));
    };
    if iv.is_empty() || ciphertext.is_empty() {
        return Err(CodecError::Malformed("empty iv or ciphertext".to_owned()));
    }

    let iv = BASE64
        .decode(iv)
        .map_err(|err| CodecError::Malformed(format!("invalid iv: {err}")))?;
    let ciphertext = BASE64
        .decode(ciphertext)
        .map_err(|err| CodecError::Malformed(format!("invalid ciphertext: {err}")))?;

    Ok((iv, ciphertext))
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct EnvelopeRef<'a, T> {
    data: &'a T,
    meta_data: &'a MetaData,
}
