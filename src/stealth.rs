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

//! # Stealth Module
//!
//! Traffic-shaping techniques that make the tunnel resemble ordinary web
//! traffic: browser header-fingerprint templates for HTTP/3 masquerading,
//! SNI hiding through domain fronting, and XOR payload obfuscation with a
//! rolling session key.

use clap::ValueEnum;
use log::{debug, info};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::crypto::CryptoManager;
use crate::telemetry;

// --- 1. Browser/OS Fingerprinting ---

/// Defines the target browser for fingerprint spoofing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserProfile {
    Chrome,
    Firefox,
    Safari,
    Edge,
}

/// Defines the operating system the spoofed browser claims to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsProfile {
    Windows,
    Macos,
    Linux,
    Ios,
    Android,
}

/// A harmonized browser/OS identity: User-Agent, language, and the header
/// ordering the real browser uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintProfile {
    pub browser: BrowserProfile,
    pub os: OsProfile,
}

impl FingerprintProfile {
    pub fn new(browser: BrowserProfile, os: OsProfile) -> Self {
        Self { browser, os }
    }

    fn os_token(&self) -> &'static str {
        match self.os {
            OsProfile::Windows => "Windows NT 10.0; Win64; x64",
            OsProfile::Macos => "Macintosh; Intel Mac OS X 10_15_7",
            OsProfile::Linux => "X11; Linux x86_64",
            OsProfile::Ios => "iPhone; CPU iPhone OS 17_5 like Mac OS X",
            OsProfile::Android => "Linux; Android 14; Pixel 8",
        }
    }

    pub fn user_agent(&self) -> String {
        match self.browser {
            BrowserProfile::Chrome => format!(
                "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
                self.os_token()
            ),
            BrowserProfile::Firefox => format!(
                "Mozilla/5.0 ({}; rv:126.0) Gecko/20100101 Firefox/126.0",
                self.os_token()
            ),
            BrowserProfile::Safari => format!(
                "Mozilla/5.0 ({}) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
                self.os_token()
            ),
            BrowserProfile::Edge => format!(
                "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0",
                self.os_token()
            ),
        }
    }

    fn accept(&self) -> &'static str {
        match self.browser {
            BrowserProfile::Firefox => {
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
            }
            _ => {
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8"
            }
        }
    }

    fn accept_language(&self) -> &'static str {
        match self.browser {
            BrowserProfile::Firefox => "en-US,en;q=0.5",
            _ => "en-US,en;q=0.9",
        }
    }
}

/// Generates HTTP/3 request headers that mimic the active browser profile.
/// Header presence and ordering follow the browser's real templates.
pub struct FakeHeaders {
    profile: FingerprintProfile,
}

impl FakeHeaders {
    pub fn new(profile: FingerprintProfile) -> Self {
        Self { profile }
    }

    /// Returns the full header list for a masqueraded GET request.
    pub fn header_list(&self, host: &str, path: &str) -> Vec<quiche::h3::Header> {
        let ua = self.profile.user_agent();
        let mut headers = vec![
            quiche::h3::Header::new(b":method", b"GET"),
            quiche::h3::Header::new(b":authority", host.as_bytes()),
            quiche::h3::Header::new(b":scheme", b"https"),
            quiche::h3::Header::new(b":path", path.as_bytes()),
            quiche::h3::Header::new(b"user-agent", ua.as_bytes()),
            quiche::h3::Header::new(b"accept", self.profile.accept().as_bytes()),
            quiche::h3::Header::new(
                b"accept-language",
                self.profile.accept_language().as_bytes(),
            ),
            quiche::h3::Header::new(b"accept-encoding", b"gzip, deflate, br, zstd"),
        ];

        // Chromium-family browsers send client hints; Firefox and Safari do
        // not.
        match self.profile.browser {
            BrowserProfile::Chrome | BrowserProfile::Edge => {
                headers.push(quiche::h3::Header::new(
                    b"sec-ch-ua",
                    b"\"Chromium\";v=\"125\", \"Not.A/Brand\";v=\"24\"",
                ));
                headers.push(quiche::h3::Header::new(b"sec-ch-ua-mobile", b"?0"));
                headers.push(quiche::h3::Header::new(
                    b"sec-fetch-dest",
                    b"document",
                ));
                headers.push(quiche::h3::Header::new(b"sec-fetch-mode", b"navigate"));
                headers.push(quiche::h3::Header::new(b"sec-fetch-site", b"none"));
            }
            BrowserProfile::Firefox => {
                headers.push(quiche::h3::Header::new(b"sec-fetch-dest", b"document"));
                headers.push(quiche::h3::Header::new(b"sec-fetch-mode", b"navigate"));
                headers.push(quiche::h3::Header::new(b"sec-fetch-site", b"none"));
                headers.push(quiche::h3::Header::new(b"te", b"trailers"));
            }
            BrowserProfile::Safari => {}
        }

        headers.push(quiche::h3::Header::new(b"upgrade-insecure-requests", b"1"));
        headers
    }
}

// --- 2. SNI Hiding via Domain Fronting ---

/// CDN anchor domains used when no explicit fronting domains are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdnProvider {
    Cloudflare,
    Google,
    MicrosoftAzure,
    Akamai,
    Fastly,
}

impl CdnProvider {
    fn get_domain(&self) -> &'static str {
        match self {
            CdnProvider::Cloudflare => "www.cloudflare.com",
            CdnProvider::Google => "www.google.com",
            CdnProvider::MicrosoftAzure => "azure.microsoft.com",
            CdnProvider::Akamai => "www.akamai.com",
            CdnProvider::Fastly => "www.fastly.com",
        }
    }
}

/// Manages domain fronting by rotating through configured domains.
pub struct DomainFrontingManager {
    domains: Vec<String>,
    index: AtomicUsize,
}

impl DomainFrontingManager {
    /// Creates a new manager from a list of domains.
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            domains,
            index: AtomicUsize::new(0),
        }
    }

    /// Creates a manager from built-in CDN providers.
    pub fn from_providers(providers: Vec<CdnProvider>) -> Self {
        let domains = providers
            .into_iter()
            .map(|p| p.get_domain().to_string())
            .collect();
        Self::new(domains)
    }

    /// Selects the next domain to front through, round-robin.
    pub fn get_fronted_domain(&self) -> String {
        let current = self.index.fetch_add(1, Ordering::SeqCst);
        let idx = current % self.domains.len();
        self.domains[idx].clone()
    }
}

// --- 3. XOR-based Traffic Obfuscation ---

/// A simple XOR obfuscator for packet payloads. Each direction keeps its own
/// key that rolls through SHA-256 after every packet; both endpoints must
/// start from the same key material and apply it to the same packet
/// sequence.
pub struct XorObfuscator {
    tx_key: Mutex<Vec<u8>>,
    rx_key: Mutex<Vec<u8>>,
}

impl XorObfuscator {
    /// Creates a new obfuscator with a session-specific key so that each
    /// connection obfuscates differently.
    pub fn new(crypto_manager: &CryptoManager) -> Self {
        Self::with_key(crypto_manager.generate_session_key(32))
    }

    /// Creates an obfuscator from pre-shared key material, for endpoints
    /// that derive the key out of band.
    pub fn with_key(key: Vec<u8>) -> Self {
        Self {
            tx_key: Mutex::new(key.clone()),
            rx_key: Mutex::new(key),
        }
    }

    /// Replaces both direction keys, restarting the rolling sequence.
    pub fn reset_key(&self, key: Vec<u8>) {
        *self.tx_key.lock().unwrap() = key.clone();
        *self.rx_key.lock().unwrap() = key;
    }

    fn apply(key: &mut Vec<u8>, payload: &mut [u8]) {
        if key.is_empty() {
            return;
        }
        let key_len = key.len();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % key_len];
        }
        // Rolling key update after each packet.
        let digest = Sha256::digest(&key[..]);
        key.clear();
        key.extend_from_slice(&digest);
    }

    /// Applies XOR obfuscation to an outgoing payload and rolls the send
    /// key.
    pub fn obfuscate(&self, payload: &mut [u8]) {
        Self::apply(&mut self.tx_key.lock().unwrap(), payload);
    }

    /// Reverses XOR obfuscation on an incoming payload and rolls the
    /// receive key.
    pub fn deobfuscate(&self, payload: &mut [u8]) {
        Self::apply(&mut self.rx_key.lock().unwrap(), payload);
    }
}

// --- 4. Stealth Manager and Configuration ---

/// Configuration for the main StealthManager.
#[derive(Clone)]
pub struct StealthConfig {
    pub browser_profile: BrowserProfile,
    pub os_profile: OsProfile,
    pub enable_http3_masquerading: bool,
    pub enable_domain_fronting: bool,
    pub fronting_domains: Vec<String>,
    pub cdn_providers: Vec<CdnProvider>,
    pub enable_xor_obfuscation: bool,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            browser_profile: BrowserProfile::Chrome,
            os_profile: OsProfile::Windows,
            enable_http3_masquerading: true,
            enable_domain_fronting: true,
            fronting_domains: Vec::new(),
            cdn_providers: vec![
                CdnProvider::Cloudflare,
                CdnProvider::Google,
                CdnProvider::MicrosoftAzure,
                CdnProvider::Akamai,
                CdnProvider::Fastly,
            ],
            enable_xor_obfuscation: true,
        }
    }
}

impl StealthConfig {
    pub fn from_toml(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        #[derive(Deserialize)]
        struct Root {
            stealth: Option<Section>,
        }

        #[derive(Deserialize)]
        struct Section {
            browser_profile: Option<BrowserProfile>,
            os_profile: Option<OsProfile>,
            enable_http3_masquerading: Option<bool>,
            enable_domain_fronting: Option<bool>,
            fronting_domains: Option<Vec<String>>,
            enable_xor_obfuscation: Option<bool>,
        }

        let root: Root = toml::from_str(s)?;
        let mut cfg = StealthConfig::default();
        if let Some(sec) = root.stealth {
            if let Some(v) = sec.browser_profile {
                cfg.browser_profile = v;
            }
            if let Some(v) = sec.os_profile {
                cfg.os_profile = v;
            }
            if let Some(v) = sec.enable_http3_masquerading {
                cfg.enable_http3_masquerading = v;
            }
            if let Some(v) = sec.enable_domain_fronting {
                cfg.enable_domain_fronting = v;
            }
            if let Some(v) = sec.fronting_domains {
                cfg.fronting_domains = v;
            }
            if let Some(v) = sec.enable_xor_obfuscation {
                cfg.enable_xor_obfuscation = v;
            }
        }
        Ok(cfg)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.enable_domain_fronting
            && self.fronting_domains.is_empty()
            && self.cdn_providers.is_empty()
        {
            return Err("fronting_domains required when domain fronting is enabled".into());
        }
        Ok(())
    }
}

/// The central orchestrator for all stealth techniques.
pub struct StealthManager {
    config: StealthConfig,
    fingerprint: Mutex<FingerprintProfile>,
    domain_fronter: Option<DomainFrontingManager>,
    xor_obfuscator: Option<XorObfuscator>,
}

impl StealthManager {
    /// Creates a new `StealthManager` with the given configuration.
    pub fn new(config: StealthConfig, crypto_manager: Arc<CryptoManager>) -> Self {
        let fingerprint = FingerprintProfile::new(config.browser_profile, config.os_profile);

        let domain_fronter = if config.enable_domain_fronting {
            if !config.fronting_domains.is_empty() {
                Some(DomainFrontingManager::new(config.fronting_domains.clone()))
            } else {
                Some(DomainFrontingManager::from_providers(
                    config.cdn_providers.clone(),
                ))
            }
        } else {
            None
        };

        let xor_obfuscator = if config.enable_xor_obfuscation {
            Some(XorObfuscator::new(&crypto_manager))
        } else {
            None
        };

        telemetry!(
            telemetry::STEALTH_FRONTING.set(if config.enable_domain_fronting { 1 } else { 0 })
        );
        telemetry!(telemetry::STEALTH_XOR.set(if config.enable_xor_obfuscation { 1 } else { 0 }));

        Self {
            config,
            fingerprint: Mutex::new(fingerprint),
            domain_fronter,
            xor_obfuscator,
        }
    }

    /// Returns the SNI and Host header values for a connection.
    /// Applies domain fronting if enabled.
    pub fn get_connection_headers(&self, real_host: &str) -> (String, String) {
        if let Some(fronter) = self
            .domain_fronter
            .as_ref()
            .filter(|_| self.config.enable_domain_fronting)
        {
            let fronted_domain = fronter.get_fronted_domain();
            debug!(
                "Domain fronting enabled. SNI: {}, Host: {}",
                fronted_domain, real_host
            );
            (fronted_domain, real_host.to_string()) // SNI = front, Host = real
        } else {
            (real_host.to_string(), real_host.to_string())
        }
    }

    /// Processes an outgoing packet payload, applying configured stealth
    /// techniques.
    pub fn process_outgoing_packet(&self, payload: &mut [u8]) {
        if let Some(obfuscator) = &self.xor_obfuscator {
            obfuscator.obfuscate(payload);
        }
    }

    /// Processes an incoming packet payload, reversing stealth techniques.
    pub fn process_incoming_packet(&self, payload: &mut [u8]) {
        if let Some(obfuscator) = &self.xor_obfuscator {
            obfuscator.deobfuscate(payload);
        }
    }

    /// Returns a vector of HTTP/3 headers for a masqueraded request, or
    /// `None` when masquerading is disabled.
    pub fn get_http3_header_list(&self, host: &str, path: &str) -> Option<Vec<quiche::h3::Header>> {
        if self.config.enable_http3_masquerading {
            let fp = self.fingerprint.lock().unwrap();
            Some(FakeHeaders::new(*fp).header_list(host, path))
        } else {
            None
        }
    }

    /// Installs shared key material for the XOR layer, e.g. derived from
    /// the connection's initial CID so both endpoints agree.
    pub fn set_obfuscation_key(&self, key: Vec<u8>) {
        if let Some(obfuscator) = &self.xor_obfuscator {
            obfuscator.reset_key(key);
        }
    }

    /// Changes the active fingerprint profile at runtime.
    pub fn set_fingerprint_profile(&self, profile: FingerprintProfile) {
        info!(
            "Switching fingerprint profile to {:?}/{:?}",
            profile.browser, profile.os
        );
        *self.fingerprint.lock().unwrap() = profile;
    }

    /// Returns the currently active fingerprint profile.
    pub fn current_profile(&self) -> FingerprintProfile {
        *self.fingerprint.lock().unwrap()
    }
}
