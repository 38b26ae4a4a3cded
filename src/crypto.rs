// Copyright (c) 2024, The QuicVeil Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Crypto Module
//!
//! AES-GCM AEAD wrapper used to seal control frames and derive session key
//! material. A runtime selector chooses between the 256-bit and 128-bit
//! variants so callers never handle cipher types directly.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

/// AES-GCM nonces are fixed at 96 bits.
pub const NONCE_LEN: usize = 12;
/// Authentication tags appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Enumerates the available cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes256Gcm,
    Aes128Gcm,
}

impl CipherSuite {
    pub fn key_len(&self) -> usize {
        match self {
            CipherSuite::Aes256Gcm => 32,
            CipherSuite::Aes128Gcm => 16,
        }
    }
}

/// Selects the AEAD suite for a connection. AES-256-GCM is the default; the
/// 128-bit variant exists for peers that pin it via configuration.
pub struct CipherSuiteSelector {
    selected_suite: CipherSuite,
}

impl CipherSuiteSelector {
    pub fn new() -> Self {
        Self {
            selected_suite: CipherSuite::Aes256Gcm,
        }
    }

    /// Creates a selector pinned to a specific suite.
    pub fn with_suite(suite: CipherSuite) -> Self {
        Self {
            selected_suite: suite,
        }
    }

    /// Returns the selected cipher suite.
    pub fn selected_suite(&self) -> CipherSuite {
        self.selected_suite
    }

    /// Encrypts data using the selected cipher suite. The 16-byte tag is
    /// appended to the returned ciphertext.
    pub fn encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, &'static str> {
        if nonce.len() != NONCE_LEN {
            return Err("Invalid nonce length");
        }
        let payload = Payload {
            msg: plaintext,
            aad: ad,
        };
        match self.selected_suite {
            CipherSuite::Aes256Gcm => {
                if key.len() != 32 {
                    return Err("Invalid key length for AES-256-GCM");
                }
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
                cipher
                    .encrypt(Nonce::from_slice(nonce), payload)
                    .map_err(|_| "Encryption failed")
            }
            CipherSuite::Aes128Gcm => {
                if key.len() != 16 {
                    return Err("Invalid key length for AES-128-GCM");
                }
                let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
                cipher
                    .encrypt(Nonce::from_slice(nonce), payload)
                    .map_err(|_| "Encryption failed")
            }
        }
    }

    /// Decrypts data using the selected cipher suite, verifying the trailing
    /// tag. Any truncation or bit flip yields an error, never a panic.
    pub fn decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, &'static str> {
        if nonce.len() != NONCE_LEN {
            return Err("Invalid nonce length");
        }
        if ciphertext.len() < TAG_LEN {
            return Err("Ciphertext too short");
        }
        let payload = Payload {
            msg: ciphertext,
            aad: ad,
        };
        match self.selected_suite {
            CipherSuite::Aes256Gcm => {
                if key.len() != 32 {
                    return Err("Invalid key length for AES-256-GCM");
                }
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
                cipher
                    .decrypt(Nonce::from_slice(nonce), payload)
                    .map_err(|_| "Decryption failed")
            }
            CipherSuite::Aes128Gcm => {
                if key.len() != 16 {
                    return Err("Invalid key length for AES-128-GCM");
                }
                let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
                cipher
                    .decrypt(Nonce::from_slice(nonce), payload)
                    .map_err(|_| "Decryption failed")
            }
        }
    }
}

impl Default for CipherSuiteSelector {
    fn default() -> Self {
        Self::new()
    }
}

/// Manages cryptographic keys and provides secure random data.
/// All session material is drawn from the OS RNG; nothing is persisted.
pub struct CryptoManager;

impl CryptoManager {
    pub fn new() -> Self {
        Self
    }

    /// Generates a cryptographically secure random key of a given length.
    /// Used for ephemeral AEAD session keys and XOR obfuscation keys.
    pub fn generate_session_key(&self, length: usize) -> Vec<u8> {
        let mut key = vec![0; length];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Generates a fresh random nonce.
    pub fn generate_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }
}

impl Default for CryptoManager {
    fn default() -> Self {
        Self::new()
    }
}
