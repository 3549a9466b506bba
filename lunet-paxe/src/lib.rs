//! Packet encryption facade (PAXE).
//!
//! A synchronous helper — never fiber-suspending — that authenticates and
//! encrypts packets in place. Two wire shapes:
//!
//! ```text
//! standard: header(8) ‖ nonce(12) ‖ ciphertext‖tag(N+16)            36 bytes overhead
//! DEK:      header(8) ‖ KEK_nonce(12) ‖ enc_DEK(32) ‖ DEK_nonce(12)
//!           ‖ DEK_len(2) ‖ ciphertext‖tag(N+16)                    82 bytes overhead
//! header:   key_id(4 BE) ‖ flags(1) ‖ reserved(3, zero)
//! ```
//!
//! The payload cipher is AES-256-GCM with the header as associated data;
//! the DEK shape wraps a fresh random data key under the keystore key
//! with AES-256-CTR. Decryption failures are counted and handled per the
//! failure policy; the key store zeroizes on clear.

use std::collections::HashMap;

use aes::Aes256;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

// ─── Wire constants ───────────────────────────────────────────

pub const KEY_LEN: usize = 32;
pub const HEADER_LEN: usize = 8;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const DEK_LEN: usize = 32;

/// Standard packet overhead: header + nonce + tag.
pub const STANDARD_OVERHEAD: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;
/// DEK packet overhead: header + KEK nonce + wrapped key + DEK nonce +
/// length field + tag.
pub const DEK_OVERHEAD: usize = HEADER_LEN + NONCE_LEN + DEK_LEN + NONCE_LEN + 2 + TAG_LEN;

/// Flag bit marking the DEK shape.
pub const FLAG_DEK: u8 = 0x01;

// ─── Types ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPolicy {
    /// Fail silently; callers see only the counters.
    Drop,
    /// Log the first failure, then stay quiet.
    LogOnce,
    /// Log every failure.
    Verbose,
}

/// Decrypt failure counters, one per observable cause.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PaxeStats {
    pub total: u64,
    pub ok: u64,
    pub short_input: u64,
    pub length_mismatch: u64,
    pub no_key: u64,
    pub auth_fail: u64,
    pub reserved_nonzero: u64,
}

/// Successful in-place decryption: plaintext now occupies the first
/// `len` bytes of the caller's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decrypted {
    pub len: usize,
    pub key_id: u32,
    pub flags: u8,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum PaxeError {
    #[error("encryption disabled")]
    Disabled,
    #[error("key must be {KEY_LEN} bytes, got {got}")]
    KeyLength { got: usize },
    #[error("NO_KEY: {0}")]
    NoKey(u32),
    #[error("AUTH_FAIL")]
    AuthFail,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial([u8; KEY_LEN]);

// ─── Facade ───────────────────────────────────────────────────

/// The facade state: enabled flag, key store, failure policy, counters.
/// Single-threaded; the defined surface only calls it from the loop.
pub struct Paxe {
    enabled: bool,
    keys: HashMap<u32, KeyMaterial>,
    policy: FailPolicy,
    stats: PaxeStats,
    warned: bool,
}

impl Paxe {
    pub fn new() -> Paxe {
        Paxe {
            enabled: true,
            keys: HashMap::new(),
            policy: FailPolicy::Drop,
            stats: PaxeStats::default(),
            warned: false,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_fail_policy(&mut self, policy: FailPolicy) {
        self.policy = policy;
    }

    pub fn stats(&self) -> PaxeStats {
        self.stats
    }

    /// Install a 32-byte key under `id`. Any other length is rejected.
    pub fn keystore_set(&mut self, id: u32, key: &[u8]) -> Result<(), PaxeError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| PaxeError::KeyLength { got: key.len() })?;
        self.keys.insert(id, KeyMaterial(key));
        Ok(())
    }

    /// Drop every key; the material is zeroized as it goes.
    pub fn keystore_clear(&mut self) {
        self.keys.clear();
    }

    /// Tear the facade down: zeroize the key store and disable further
    /// work. Counters survive for the final summary.
    pub fn shutdown(&mut self) {
        self.keystore_clear();
        self.enabled = false;
    }

    // ── Encrypt ──

    /// Produce a standard packet: 36 bytes of overhead around the
    /// plaintext, authenticated under the header.
    pub fn encrypt(&self, key_id: u32, plaintext: &[u8]) -> Result<Vec<u8>, PaxeError> {
        if !self.enabled {
            return Err(PaxeError::Disabled);
        }
        let key = self.keys.get(&key_id).ok_or(PaxeError::NoKey(key_id))?;
        let header = encode_header(key_id, 0);
        let nonce = fresh_nonce();

        let cipher = Aes256Gcm::new((&key.0).into());
        let ct = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| PaxeError::AuthFail)?;

        let mut out = Vec::with_capacity(STANDARD_OVERHEAD + plaintext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Produce a DEK packet: the payload is encrypted under a fresh
    /// random data key, itself wrapped under the keystore key.
    pub fn encrypt_dek(&self, key_id: u32, plaintext: &[u8]) -> Result<Vec<u8>, PaxeError> {
        if !self.enabled {
            return Err(PaxeError::Disabled);
        }
        let kek = self.keys.get(&key_id).ok_or(PaxeError::NoKey(key_id))?;
        let header = encode_header(key_id, FLAG_DEK);
        let kek_nonce = fresh_nonce();
        let dek_nonce = fresh_nonce();

        let mut dek = [0u8; DEK_LEN];
        rand::thread_rng().fill_bytes(&mut dek);

        let cipher = Aes256Gcm::new((&dek).into());
        let ct = cipher
            .encrypt(
                Nonce::from_slice(&dek_nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| PaxeError::AuthFail)?;

        let mut wrapped = dek;
        ctr_keystream(&kek.0, &kek_nonce, &mut wrapped);
        dek.zeroize();

        let mut out = Vec::with_capacity(DEK_OVERHEAD + plaintext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&kek_nonce);
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&dek_nonce);
        out.extend_from_slice(&(DEK_LEN as u16).to_be_bytes());
        out.extend_from_slice(&ct);
        Ok(out)
    }

    // ── Decrypt ──

    /// Authenticate and decrypt a packet in place: on success the
    /// plaintext occupies the front of `buf`. Failures are counted and
    /// reported per the failure policy.
    pub fn try_decrypt(&mut self, buf: &mut [u8]) -> Option<Decrypted> {
        if !self.enabled {
            return None;
        }
        self.stats.total += 1;

        if buf.len() < STANDARD_OVERHEAD {
            return self.fail("short input", |s| &mut s.short_input);
        }
        let key_id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let flags = buf[4];
        if buf[5..8] != [0, 0, 0] {
            return self.fail("reserved bytes nonzero", |s| &mut s.reserved_nonzero);
        }
        let header: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().unwrap();

        let plaintext = if flags & FLAG_DEK == 0 {
            let Some(key) = self.keys.get(&key_id) else {
                return self.fail("no key", |s| &mut s.no_key);
            };
            let nonce: [u8; NONCE_LEN] =
                buf[HEADER_LEN..HEADER_LEN + NONCE_LEN].try_into().unwrap();
            let ct = &buf[HEADER_LEN + NONCE_LEN..];
            let cipher = Aes256Gcm::new((&key.0).into());
            match cipher.decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ct,
                    aad: &header,
                },
            ) {
                Ok(pt) => pt,
                Err(_) => return self.fail("auth fail", |s| &mut s.auth_fail),
            }
        } else {
            if buf.len() < DEK_OVERHEAD {
                return self.fail("short input", |s| &mut s.short_input);
            }
            let Some(kek) = self.keys.get(&key_id) else {
                return self.fail("no key", |s| &mut s.no_key);
            };
            let mut at = HEADER_LEN;
            let kek_nonce: [u8; NONCE_LEN] = buf[at..at + NONCE_LEN].try_into().unwrap();
            at += NONCE_LEN;
            let mut dek: [u8; DEK_LEN] = buf[at..at + DEK_LEN].try_into().unwrap();
            at += DEK_LEN;
            let dek_nonce: [u8; NONCE_LEN] = buf[at..at + NONCE_LEN].try_into().unwrap();
            at += NONCE_LEN;
            let dek_len = u16::from_be_bytes(buf[at..at + 2].try_into().unwrap());
            at += 2;
            if dek_len as usize != DEK_LEN {
                return self.fail("bad DEK length", |s| &mut s.length_mismatch);
            }

            ctr_keystream(&kek.0, &kek_nonce, &mut dek);
            let cipher = Aes256Gcm::new((&dek).into());
            let res = cipher.decrypt(
                Nonce::from_slice(&dek_nonce),
                Payload {
                    msg: &buf[at..],
                    aad: &header,
                },
            );
            dek.zeroize();
            match res {
                Ok(pt) => pt,
                Err(_) => return self.fail("auth fail", |s| &mut s.auth_fail),
            }
        };

        buf[..plaintext.len()].copy_from_slice(&plaintext);
        self.stats.ok += 1;
        Some(Decrypted {
            len: plaintext.len(),
            key_id,
            flags,
        })
    }

    fn fail(&mut self, what: &str, counter: impl FnOnce(&mut PaxeStats) -> &mut u64) -> Option<Decrypted> {
        *counter(&mut self.stats) += 1;
        match self.policy {
            FailPolicy::Drop => {}
            FailPolicy::LogOnce => {
                if !self.warned {
                    self.warned = true;
                    tracing::warn!("packet decrypt failed: {what} (further failures suppressed)");
                }
            }
            FailPolicy::Verbose => tracing::warn!("packet decrypt failed: {what}"),
        }
        None
    }
}

impl Default for Paxe {
    fn default() -> Self {
        Paxe::new()
    }
}

// ─── Helpers ──────────────────────────────────────────────────

fn encode_header(key_id: u32, flags: u8) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0..4].copy_from_slice(&key_id.to_be_bytes());
    h[4] = flags;
    h
}

fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// AES-256-CTR keystream over `data` with a 12-byte nonce (counter in
/// the final word).
fn ctr_keystream(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..NONCE_LEN].copy_from_slice(nonce);
    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    cipher.apply_keystream(data);
}
