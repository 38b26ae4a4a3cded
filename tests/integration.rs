use quicveil::core::QuicVeilConnection;
use quicveil::fec::FecConfig;
use quicveil::mtu::{MtuConfig, MtuDirection, MtuStatus};
use quicveil::stealth::StealthConfig;
use std::net::UdpSocket;
use std::time::Duration;

fn quiche_config() -> quiche::Config {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION).unwrap();
    config
        .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
        .unwrap();
    config.set_initial_max_data(1_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(100);
    config.set_max_idle_timeout(30_000);
    config
}

/// A stealth configuration whose transforms are deterministic for the test:
/// fronting stays on, the lockstep-sensitive XOR layer stays off.
fn stealth_config() -> StealthConfig {
    StealthConfig {
        enable_xor_obfuscation: false,
        ..StealthConfig::default()
    }
}

fn fec_config() -> FecConfig {
    FecConfig {
        enabled: false,
        ..FecConfig::default()
    }
}

fn mtu_config() -> MtuConfig {
    MtuConfig {
        min_mtu: 1200,
        max_mtu: 1400,
        step_size: 50,
        probe_timeout: Duration::from_millis(2000),
        ..MtuConfig::default()
    }
}

#[tokio::test]
async fn client_server_end_to_end_discovers_mtu() {
    let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    server_socket.set_nonblocking(true).unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    client_socket.set_nonblocking(true).unwrap();
    client_socket.connect(server_addr).unwrap();
    let client_addr = client_socket.local_addr().unwrap();

    let mut client_quiche = quiche_config();
    client_quiche.verify_peer(false);
    let mut client_conn = QuicVeilConnection::new_client(
        "example.com",
        client_addr,
        server_addr,
        client_quiche,
        stealth_config(),
        fec_config(),
        mtu_config(),
    )
    .unwrap();

    // With fronting enabled the SNI and Host header must diverge.
    let (sni, host) = client_conn
        .stealth_manager()
        .get_connection_headers("example.com");
    assert_ne!(sni, host);
    assert_eq!(host, "example.com");

    let mut server_quiche = quiche_config();
    server_quiche
        .load_cert_chain_from_pem_file("tests/data/cert.crt")
        .unwrap();
    server_quiche
        .load_priv_key_from_pem_file("tests/data/cert.key")
        .unwrap();

    let scid = quiche::ConnectionId::from_ref(&[0; quiche::MAX_CONN_ID_LEN]);
    let mut server_conn = QuicVeilConnection::new_server(
        &scid,
        None,
        server_addr,
        client_addr,
        server_quiche,
        stealth_config(),
        fec_config(),
        mtu_config(),
    )
    .unwrap();

    let mut buf = [0u8; 65535];
    let mut out = [0u8; 65535];
    let mut discovery_started = false;

    for _ in 0..600 {
        loop {
            match client_conn.send(&mut out) {
                Ok(0) => break,
                Ok(len) => {
                    client_socket.send(&out[..len]).unwrap();
                }
                Err(_) => break,
            }
        }
        loop {
            match server_socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    let _ = server_conn.recv(&buf[..len]);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("recv_from server: {}", e),
            }
        }
        loop {
            match server_conn.send(&mut out) {
                Ok(0) => break,
                Ok(len) => {
                    server_socket.send_to(&out[..len], client_addr).unwrap();
                }
                Err(_) => break,
            }
        }
        loop {
            match client_socket.recv(&mut buf) {
                Ok(len) => {
                    let _ = client_conn.recv(&buf[..len]);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("recv client: {}", e),
            }
        }

        if client_conn.conn.is_established() && !discovery_started {
            discovery_started = true;
            client_conn.start_mtu_discovery();
        }

        client_conn.update_state();
        server_conn.update_state();

        let mgr = client_conn.mtu_manager();
        if discovery_started
            && mgr.status(MtuDirection::Outgoing) == MtuStatus::Validated
            && mgr.status(MtuDirection::Incoming) == MtuStatus::Validated
        {
            break;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(discovery_started, "handshake never completed");

    let mgr = client_conn.mtu_manager();
    assert_eq!(mgr.status(MtuDirection::Outgoing), MtuStatus::Validated);
    assert_eq!(mgr.current_mtu(MtuDirection::Outgoing), 1400);
    assert_eq!(client_conn.active_mtu(), 1400);
    assert_eq!(mgr.status(MtuDirection::Incoming), MtuStatus::Validated);
    assert_eq!(mgr.current_mtu(MtuDirection::Incoming), 1400);

    // The server answered the client's probes through its incoming handler.
    let server_mgr = server_conn.mtu_manager();
    assert!(server_mgr.current_mtu(MtuDirection::Incoming) >= 1200);

    client_conn.shutdown();
    server_conn.shutdown();
}
