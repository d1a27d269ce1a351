//! Page Cipher and Key Slots
//!
//! ## Page encryption
//! The page key is split into two subkeys, HMAC-SHA256(page key, label) with
//! a distinct label each. The body of a page is XORed with a SHA-256 counter
//! keystream derived from (encryption subkey, nonce, page number, block index)
//! and authenticated with a truncated HMAC-SHA256 under the MAC subkey over
//! (page number, key epoch, nonce, ciphertext). Every write draws a fresh
//! random nonce.
//!
//! ## Key slots
//! A credential never encrypts pages directly. It derives a key-encryption key
//! (iterated HMAC-SHA256 over a random salt) that unwraps a random page key.
//! The slot also stores a verifier so a wrong credential is detected before
//! any page is touched.

use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Credential;
use crate::error::{Result, VaultError};
use crate::PageNumber;

type HmacSha256 = Hmac<Sha256>;

/// Size of the page key and key-encryption key
pub const KEY_SIZE: usize = 32;
/// Size of the per-write nonce
pub const NONCE_SIZE: usize = 12;
/// Size of the (truncated) authentication tag
pub const TAG_SIZE: usize = 16;
/// Size of the key-derivation salt
pub const SALT_SIZE: usize = 16;

const KDF_ROUNDS: u32 = 4096;
const WRAP_LABEL: &[u8] = b"pagevault/wrap";
const VERIFY_LABEL: &[u8] = b"pagevault/verify";
const ENCRYPT_LABEL: &[u8] = b"pagevault/page-encrypt";
const MAC_LABEL: &[u8] = b"pagevault/page-mac";

// =============================================================================
// Primitives
// =============================================================================

fn hmac_parts(key: &[u8], parts: &[&[u8]]) -> Result<[u8; KEY_SIZE]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| VaultError::Config(format!("invalid HMAC key: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// PBKDF2-style single-block derivation
fn derive_kek(credential: &Credential, salt: &[u8; SALT_SIZE]) -> Result<[u8; KEY_SIZE]> {
    let secret = credential.as_bytes();
    let mut block = hmac_parts(secret, &[salt, &1u32.to_be_bytes()])?;
    let mut acc = block;
    for _ in 1..KDF_ROUNDS {
        block = hmac_parts(secret, &[&block])?;
        for (a, b) in acc.iter_mut().zip(block.iter()) {
            *a ^= b;
        }
    }
    Ok(acc)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

// =============================================================================
// Page Cipher
// =============================================================================

/// Encrypts and authenticates page bodies with one page key
pub struct PageCipher {
    epoch: u32,
    encrypt_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl fmt::Debug for PageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCipher")
            .field("epoch", &self.epoch)
            .field("keys", &"<redacted>")
            .finish()
    }
}

impl PageCipher {
    pub(crate) fn new(epoch: u32, key: [u8; KEY_SIZE]) -> Result<Self> {
        Ok(Self {
            epoch,
            encrypt_key: hmac_parts(&key, &[ENCRYPT_LABEL])?,
            mac_key: hmac_parts(&key, &[MAC_LABEL])?,
        })
    }

    /// Key epoch stamped into every frame this cipher writes (never 0)
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Encrypt `body` in place, returning the nonce and tag for the trailer
    pub fn seal(&self, page_number: PageNumber, body: &mut [u8]) -> Result<([u8; NONCE_SIZE], [u8; TAG_SIZE])> {
        let nonce: [u8; NONCE_SIZE] = random_bytes();
        self.apply_keystream(page_number, &nonce, body);
        let tag = self.tag(page_number, &nonce, body)?;
        Ok((nonce, tag))
    }

    /// Verify and decrypt `body` in place
    pub fn open(
        &self,
        page_number: PageNumber,
        body: &mut [u8],
        nonce: &[u8; NONCE_SIZE],
        tag: &[u8; TAG_SIZE],
    ) -> std::result::Result<(), String> {
        let expected = self.tag(page_number, nonce, body).map_err(|e| e.to_string())?;
        if expected != *tag {
            return Err(format!("authentication tag mismatch (key epoch {})", self.epoch));
        }
        self.apply_keystream(page_number, nonce, body);
        Ok(())
    }

    fn tag(&self, page_number: PageNumber, nonce: &[u8; NONCE_SIZE], body: &[u8]) -> Result<[u8; TAG_SIZE]> {
        let full = hmac_parts(
            &self.mac_key,
            &[&page_number.to_le_bytes(), &self.epoch.to_le_bytes(), nonce, body],
        )?;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&full[..TAG_SIZE]);
        Ok(tag)
    }

    fn apply_keystream(&self, page_number: PageNumber, nonce: &[u8; NONCE_SIZE], body: &mut [u8]) {
        for (index, chunk) in body.chunks_mut(KEY_SIZE).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(self.encrypt_key);
            hasher.update(nonce);
            hasher.update(page_number.to_le_bytes());
            hasher.update((index as u64).to_le_bytes());
            let block = hasher.finalize();
            for (byte, k) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= k;
            }
        }
    }
}

// =============================================================================
// Key Slot
// =============================================================================

/// A page key wrapped under a credential, as persisted in the service file
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySlot {
    pub epoch: u32,
    salt: [u8; SALT_SIZE],
    wrapped_key: [u8; KEY_SIZE],
    verifier: [u8; KEY_SIZE],
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySlot").field("epoch", &self.epoch).finish_non_exhaustive()
    }
}

impl KeySlot {
    /// Generate a random page key for `epoch` and wrap it under `credential`
    pub fn create(credential: &Credential, epoch: u32) -> Result<(Self, PageCipher)> {
        let salt: [u8; SALT_SIZE] = random_bytes();
        let key: [u8; KEY_SIZE] = random_bytes();
        let kek = derive_kek(credential, &salt)?;

        let pad = hmac_parts(&kek, &[WRAP_LABEL])?;
        let mut wrapped_key = key;
        for (w, p) in wrapped_key.iter_mut().zip(pad.iter()) {
            *w ^= p;
        }
        let verifier = hmac_parts(&kek, &[VERIFY_LABEL, &epoch.to_le_bytes()])?;

        let slot = Self {
            epoch,
            salt,
            wrapped_key,
            verifier,
        };
        Ok((slot, PageCipher::new(epoch, key)?))
    }

    /// Unwrap the page key, failing with `CredentialMismatch` on a wrong credential
    pub fn unlock(&self, credential: &Credential) -> Result<PageCipher> {
        let kek = derive_kek(credential, &self.salt)?;
        let mut mac = HmacSha256::new_from_slice(&kek)
            .map_err(|e| VaultError::Config(format!("invalid HMAC key: {e}")))?;
        mac.update(VERIFY_LABEL);
        mac.update(&self.epoch.to_le_bytes());
        mac.verify_slice(&self.verifier)
            .map_err(|_| VaultError::CredentialMismatch)?;

        let pad = hmac_parts(&kek, &[WRAP_LABEL])?;
        let mut key = self.wrapped_key;
        for (k, p) in key.iter_mut().zip(pad.iter()) {
            *k ^= p;
        }
        PageCipher::new(self.epoch, key)
    }
}
