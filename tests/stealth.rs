use quiche::h3::NameValue;
use quicveil::crypto::CryptoManager;
use quicveil::stealth::{
    BrowserProfile, FingerprintProfile, OsProfile, StealthConfig, StealthManager, XorObfuscator,
};
use std::sync::Arc;

fn manager_with(config: StealthConfig) -> StealthManager {
    StealthManager::new(config, Arc::new(CryptoManager::new()))
}

#[test]
fn outgoing_packet_obfuscation_cycle() {
    let mgr = manager_with(StealthConfig::default());

    let mut payload = vec![1u8, 2, 3, 4];
    let original = payload.clone();
    mgr.process_outgoing_packet(&mut payload);
    assert_ne!(payload, original, "payload should be obfuscated");
    mgr.process_incoming_packet(&mut payload);
    assert_eq!(payload, original, "payload should roundtrip correctly");
}

#[test]
fn obfuscation_key_rolls_between_packets() {
    let obfuscator = XorObfuscator::with_key(vec![0xAB; 32]);
    let mut first = vec![0u8; 16];
    let mut second = vec![0u8; 16];
    obfuscator.obfuscate(&mut first);
    obfuscator.obfuscate(&mut second);
    assert_ne!(first, second, "successive packets must use rolled keys");
}

#[test]
fn peers_with_shared_key_interoperate() {
    let sender = XorObfuscator::with_key(vec![0x42; 32]);
    let receiver = XorObfuscator::with_key(vec![0x42; 32]);

    for round in 0u8..4 {
        let mut payload = vec![round; 100];
        let original = payload.clone();
        sender.obfuscate(&mut payload);
        receiver.deobfuscate(&mut payload);
        assert_eq!(payload, original);
    }
}

#[test]
fn domain_fronting_changes_sni() {
    let mgr = manager_with(StealthConfig::default());

    let (sni, host) = mgr.get_connection_headers("example.com");
    assert_eq!(host, "example.com");
    assert_ne!(sni, host, "SNI should differ when fronting is enabled");
}

#[test]
fn fronting_disabled_uses_real_host() {
    let config = StealthConfig {
        enable_domain_fronting: false,
        ..StealthConfig::default()
    };
    let mgr = manager_with(config);

    let (sni, host) = mgr.get_connection_headers("example.com");
    assert_eq!(sni, "example.com");
    assert_eq!(host, "example.com");
}

#[test]
fn fronting_rotates_domains() {
    let config = StealthConfig {
        fronting_domains: vec!["a.example".into(), "b.example".into()],
        ..StealthConfig::default()
    };
    let mgr = manager_with(config);

    let (first, _) = mgr.get_connection_headers("example.com");
    let (second, _) = mgr.get_connection_headers("example.com");
    assert_ne!(first, second);
}

#[test]
fn generate_http3_headers() {
    let mgr = manager_with(StealthConfig::default());

    let headers = mgr
        .get_http3_header_list("example.com", "/")
        .expect("headers");
    assert!(!headers.is_empty());

    let names: Vec<String> = headers
        .iter()
        .map(|h| String::from_utf8_lossy(h.name()).into_owned())
        .collect();
    assert_eq!(names[0], ":method");
    assert!(names.contains(&"user-agent".to_string()));
    // The default profile is Chromium-family and sends client hints.
    assert!(names.contains(&"sec-ch-ua".to_string()));
}

#[test]
fn firefox_profile_omits_client_hints() {
    let config = StealthConfig {
        browser_profile: BrowserProfile::Firefox,
        os_profile: OsProfile::Linux,
        ..StealthConfig::default()
    };
    let mgr = manager_with(config);

    let headers = mgr
        .get_http3_header_list("example.com", "/")
        .expect("headers");
    let names: Vec<String> = headers
        .iter()
        .map(|h| String::from_utf8_lossy(h.name()).into_owned())
        .collect();
    assert!(!names.contains(&"sec-ch-ua".to_string()));

    let ua = headers
        .iter()
        .find(|h| h.name() == b"user-agent")
        .map(|h| String::from_utf8_lossy(h.value()).into_owned())
        .unwrap();
    assert!(ua.contains("Firefox"));
    assert!(ua.contains("Linux"));
}

#[test]
fn profile_switch_changes_user_agent() {
    let mgr = manager_with(StealthConfig::default());
    let before = mgr.current_profile();
    assert_eq!(before.browser, BrowserProfile::Chrome);

    mgr.set_fingerprint_profile(FingerprintProfile::new(
        BrowserProfile::Safari,
        OsProfile::Macos,
    ));
    let after = mgr.current_profile();
    assert_eq!(after.browser, BrowserProfile::Safari);
    assert_ne!(before.user_agent(), after.user_agent());
}

#[test]
fn masquerading_disabled_yields_no_headers() {
    let config = StealthConfig {
        enable_http3_masquerading: false,
        ..StealthConfig::default()
    };
    let mgr = manager_with(config);
    assert!(mgr.get_http3_header_list("example.com", "/").is_none());
}

#[test]
fn parse_config_toml() {
    let cfg = StealthConfig::from_toml(
        r#"
        [stealth]
        browser_profile = "firefox"
        os_profile = "linux"
        enable_domain_fronting = true
        fronting_domains = ["cdn.example.org"]
        enable_xor_obfuscation = false
    "#,
    )
    .unwrap();
    assert_eq!(cfg.browser_profile, BrowserProfile::Firefox);
    assert_eq!(cfg.os_profile, OsProfile::Linux);
    assert_eq!(cfg.fronting_domains, vec!["cdn.example.org".to_string()]);
    assert!(!cfg.enable_xor_obfuscation);
    assert!(cfg.validate().is_ok());
}

#[test]
fn validate_requires_fronting_domains() {
    let cfg = StealthConfig {
        enable_domain_fronting: true,
        fronting_domains: Vec::new(),
        cdn_providers: Vec::new(),
        ..StealthConfig::default()
    };
    assert!(cfg.validate().is_err());
}
