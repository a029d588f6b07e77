// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The per-certificate PIN cache.
//!
//! Entering the PIN is the only interactive part of signing, so the server asks
//! for it once per [`CertificateIdentity`] and keeps it for the remainder of its
//! lifetime. Cached PINs are held encrypted with a key that only lives in this
//! process, and every plaintext copy is zeroed when it goes out of scope.
//!
//! The smart card, the prompt and the encryption are reached through the
//! [`CardProvider`], [`PinPrompt`] and [`SecretProtector`] traits.

use std::{collections::HashMap, fmt, sync::Arc};

use openssl::symm::Cipher;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::{error::CredentialError, job::CertificateIdentity};

/// A plaintext PIN.
///
/// The memory is zeroed when the PIN is dropped, and it is never printed.
pub struct Pin(SecretString);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Self(SecretString::from(pin.into()))
    }

    /// Access the PIN; keep the borrow as short as possible.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin([REDACTED])")
    }
}

/// Access to the smart card holding a certificate.
pub trait CardProvider {
    /// Check that the card is present and responsive.
    fn status(&self, identity: &CertificateIdentity) -> Result<(), CredentialError>;

    /// Check the PIN against the card's provider without signing anything.
    fn validate_pin(&self, identity: &CertificateIdentity, pin: &Pin)
        -> Result<(), CredentialError>;
}

/// Asks the user for a PIN.
///
/// Prompting blocks the calling thread until the user answers.
pub trait PinPrompt {
    fn prompt(&self, identity: &CertificateIdentity) -> Result<Pin, CredentialError>;
}

/// Encrypts secrets so they can only be recovered by this session.
pub trait SecretProtector {
    fn protect(&self, secret: &[u8]) -> Result<Vec<u8>, CredentialError>;
    fn unprotect(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, CredentialError>;
}

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM with a random key generated when the process starts.
///
/// The key never leaves this process, so blobs are useless to anyone else and
/// become undecryptable once the process exits.
pub struct SessionKeyProtector {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl SessionKeyProtector {
    pub fn new() -> Result<Self, CredentialError> {
        let mut key = Zeroizing::new([0_u8; KEY_LEN]);
        openssl::rand::rand_bytes(key.as_mut_slice())?;
        Ok(Self { key })
    }
}

impl fmt::Debug for SessionKeyProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyProtector")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SecretProtector for SessionKeyProtector {
    fn protect(&self, secret: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let mut nonce = [0_u8; NONCE_LEN];
        openssl::rand::rand_bytes(&mut nonce)?;
        let mut tag = [0_u8; TAG_LEN];
        let ciphertext = openssl::symm::encrypt_aead(
            Cipher::aes_256_gcm(),
            self.key.as_slice(),
            Some(&nonce),
            &[],
            secret,
            &mut tag,
        )?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        blob.extend_from_slice(&tag);
        Ok(blob)
    }

    fn unprotect(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CredentialError::Corrupt);
        }
        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let plaintext = openssl::symm::decrypt_aead(
            Cipher::aes_256_gcm(),
            self.key.as_slice(),
            Some(nonce),
            &[],
            ciphertext,
            tag,
        )?;

        Ok(Zeroizing::new(plaintext))
    }
}

/// Hands out PINs, prompting only for certificates it has not seen yet.
pub struct CredentialStore {
    card: Box<dyn CardProvider>,
    prompt: Box<dyn PinPrompt>,
    protector: Box<dyn SecretProtector>,
    // `None` until a PIN for the identity has been validated.
    cache: HashMap<Arc<CertificateIdentity>, Option<Zeroizing<Vec<u8>>>>,
}

impl CredentialStore {
    pub fn new(
        card: Box<dyn CardProvider>,
        prompt: Box<dyn PinPrompt>,
        protector: Box<dyn SecretProtector>,
    ) -> Self {
        Self {
            card,
            prompt,
            protector,
            cache: HashMap::new(),
        }
    }

    /// Return the PIN for `identity`, prompting the user if it isn't cached.
    ///
    /// A prompted PIN is validated against the card's provider before it is
    /// cached; a rejected PIN is never cached, so the next request for the same
    /// identity prompts again.
    #[tracing::instrument(skip_all, fields(%identity))]
    pub fn get_or_prompt(
        &mut self,
        identity: &Arc<CertificateIdentity>,
    ) -> Result<Pin, CredentialError> {
        let entry = self.cache.entry(identity.clone()).or_default();
        if let Some(blob) = entry.as_deref() {
            match self.protector.unprotect(blob) {
                Ok(plaintext) => {
                    tracing::debug!("Using cached PIN");
                    return pin_from_bytes(&plaintext);
                }
                Err(error) => {
                    tracing::error!(%error, "Cached PIN could not be decrypted; discarding it");
                    *entry = None;
                    return Err(error);
                }
            }
        }

        self.card.status(identity).inspect_err(|error| {
            tracing::warn!(%error, "Smart card is not available");
        })?;
        tracing::info!("Prompting for the smart card PIN");
        let pin = self.prompt.prompt(identity)?;
        self.card
            .validate_pin(identity, &pin)
            .inspect_err(|error| tracing::warn!(%error, "PIN was rejected"))?;

        let blob = self.protector.protect(pin.expose().as_bytes())?;
        *entry = Some(Zeroizing::new(blob));
        tracing::debug!("PIN validated and cached");

        Ok(pin)
    }

    /// Whether a validated PIN is cached for `identity`.
    pub fn is_cached(&self, identity: &CertificateIdentity) -> bool {
        matches!(self.cache.get(identity), Some(Some(_)))
    }

    /// Zero and drop every cached PIN.
    pub fn clear(&mut self) {
        let cached = self.cache.values().filter(|entry| entry.is_some()).count();
        // Zeroizing wipes each blob as it is dropped.
        self.cache.clear();
        tracing::debug!(cached, "Credential cache cleared");
    }
}

impl Drop for CredentialStore {
    fn drop(&mut self) {
        self.clear();
    }
}

fn pin_from_bytes(bytes: &[u8]) -> Result<Pin, CredentialError> {
    let pin = std::str::from_utf8(bytes).map_err(|_| CredentialError::Corrupt)?;
    Ok(Pin::new(pin))
}
