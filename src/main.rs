use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use quicveil::app_config::AppConfig;
use quicveil::core::QuicVeilConnection;
use quicveil::mtu::MtuDirection;
use quicveil::stealth::{BrowserProfile, OsProfile};
use quicveil::telemetry;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Serve telemetry metrics on this address
    #[clap(long, global = true, value_name = "ADDR")]
    telemetry: Option<String>,

    /// Path to a unified TOML configuration file
    #[clap(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct TunnelOpts {
    /// Browser fingerprint profile (chrome, firefox, safari, edge)
    #[clap(long, value_enum, default_value_t = BrowserProfile::Chrome)]
    profile: BrowserProfile,

    /// Operating system for the profile (windows, macos, linux, ios, android)
    #[clap(long, value_enum, default_value_t = OsProfile::Windows)]
    os: OsProfile,

    /// Domain used for fronting (can be specified multiple times)
    #[clap(long, value_delimiter = ',')]
    front_domain: Vec<String>,

    /// Disable domain fronting
    #[clap(long)]
    disable_fronting: bool,

    /// Disable XOR obfuscation
    #[clap(long)]
    disable_xor: bool,

    /// Disable XOR-parity forward error correction
    #[clap(long)]
    disable_fec: bool,

    /// MTU search floor in bytes
    #[clap(long)]
    min_mtu: Option<u16>,

    /// MTU search ceiling in bytes
    #[clap(long)]
    max_mtu: Option<u16>,

    /// Initial MTU probe step in bytes
    #[clap(long)]
    mtu_step: Option<u16>,

    /// Discover the outgoing direction only
    #[clap(long)]
    no_bidirectional: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the client
    Client {
        /// The remote server address to connect to
        #[clap(long, required = true)]
        remote: String,

        /// Local UDP address to bind
        #[clap(long, default_value = "0.0.0.0:0")]
        local: String,

        /// Host the masqueraded HTTP/3 request is for
        #[clap(long, default_value = "example.com")]
        host: String,

        /// The path to request
        #[clap(long, default_value = "/")]
        path: String,

        /// Enable certificate validation when connecting to the server
        #[clap(long)]
        verify_peer: bool,

        #[clap(flatten)]
        tunnel: TunnelOpts,
    },
    /// Runs the server
    Server {
        /// The address to listen on
        #[clap(short, long, default_value = "127.0.0.1:4433")]
        listen: String,

        /// Path to the certificate file
        #[clap(short, long, required = true)]
        cert: PathBuf,

        /// Path to the private key file
        #[clap(short, long, required = true)]
        key: PathBuf,

        #[clap(flatten)]
        tunnel: TunnelOpts,
    },
}

fn load_app_config(path: &Option<PathBuf>, tunnel: &TunnelOpts) -> AppConfig {
    let mut cfg = match path {
        Some(p) => AppConfig::from_file(p).unwrap_or_else(|e| {
            warn!("Failed to load config {}: {}, using defaults", p.display(), e);
            AppConfig::default()
        }),
        None => AppConfig::default(),
    };

    cfg.stealth.browser_profile = tunnel.profile;
    cfg.stealth.os_profile = tunnel.os;
    if !tunnel.front_domain.is_empty() {
        cfg.stealth.fronting_domains = tunnel.front_domain.clone();
    }
    if tunnel.disable_fronting {
        cfg.stealth.enable_domain_fronting = false;
    }
    if tunnel.disable_xor {
        cfg.stealth.enable_xor_obfuscation = false;
    }
    if tunnel.disable_fec {
        cfg.fec.enabled = false;
    }
    if let Some(v) = tunnel.min_mtu {
        cfg.mtu.min_mtu = v;
    }
    if let Some(v) = tunnel.max_mtu {
        cfg.mtu.max_mtu = v;
    }
    if let Some(v) = tunnel.mtu_step {
        cfg.mtu.step_size = v;
    }
    if tunnel.no_bidirectional {
        cfg.mtu.bidirectional_enabled = false;
    }
    cfg
}

fn resolve(addr: &str) -> Result<SocketAddr, String> {
    addr.to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}: {}", addr, e))?
        .next()
        .ok_or_else(|| format!("no address for {}", addr))
}

fn base_quiche_config() -> Result<quiche::Config, quiche::Error> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
    config.set_application_protos(quiche::h3::APPLICATION_PROTOCOL)?;
    config.set_initial_max_data(1_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(100);
    config.set_max_idle_timeout(30_000);
    Ok(config)
}

/// Pumps one connection until it closes: QUIC I/O, stealth/FEC transforms,
/// and the periodic state tick that drives adaptive MTU and probe timeouts.
async fn drive_connection(
    mut conn: QuicVeilConnection,
    socket: UdpSocket,
    peer: SocketAddr,
    request_path: Option<&str>,
) {
    let mut buf = [0u8; 65535];
    let mut out = [0u8; 65535];
    let mut request_sent = false;
    let mut discovery_started = false;
    let started = Instant::now();

    loop {
        // Flush everything quiche wants on the wire.
        loop {
            match conn.send(&mut out) {
                Ok(0) => break,
                Ok(len) => {
                    if let Err(e) = socket.send_to(&out[..len], peer) {
                        if e.kind() != std::io::ErrorKind::WouldBlock {
                            error!("socket send failed: {}", e);
                            return;
                        }
                        break;
                    }
                }
                Err(e) => {
                    error!("connection send failed: {}", e);
                    break;
                }
            }
        }

        // Ingest everything the socket has.
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    if let Err(e) = conn.recv(&buf[..len]) {
                        warn!("connection recv failed: {}", e);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("socket recv failed: {}", e);
                    return;
                }
            }
        }

        if conn.conn.is_established() {
            if !discovery_started {
                discovery_started = true;
                conn.start_mtu_discovery();
            }
            if let (false, Some(path)) = (request_sent, request_path) {
                request_sent = true;
                if let Err(e) = conn.send_http3_request(path) {
                    warn!("HTTP/3 request failed: {}", e);
                }
            }
        }

        let _ = conn.poll_http3();
        conn.update_state();

        if let Some(timeout) = conn.conn.timeout() {
            if timeout.is_zero() {
                conn.conn.on_timeout();
            }
        }

        if conn.conn.is_closed() {
            break;
        }
        if started.elapsed() > Duration::from_secs(60) {
            info!("Session window elapsed, closing");
            let _ = conn.conn.close(true, 0, b"done");
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    conn.shutdown();
    let stats = conn.stats();
    info!(
        "Connection closed. outgoing_mtu={} ({:?}), incoming_mtu={} ({:?}), loss={:.2}%, rtt={:.0}ms",
        conn.mtu_manager().current_mtu(MtuDirection::Outgoing),
        conn.mtu_manager().status(MtuDirection::Outgoing),
        conn.mtu_manager().current_mtu(MtuDirection::Incoming),
        conn.mtu_manager().status(MtuDirection::Incoming),
        stats.loss_rate * 100.0,
        stats.rtt,
    );
}

async fn run_client(
    remote: String,
    local: String,
    host: String,
    path: String,
    verify_peer: bool,
    app_cfg: AppConfig,
) -> Result<(), String> {
    let remote_addr = resolve(&remote)?;
    let socket = UdpSocket::bind(&local).map_err(|e| format!("bind {}: {}", local, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| format!("set_nonblocking: {}", e))?;
    let local_addr = socket.local_addr().map_err(|e| e.to_string())?;

    let mut config = base_quiche_config().map_err(|e| e.to_string())?;
    config.verify_peer(verify_peer);

    let conn = QuicVeilConnection::new_client(
        &host,
        local_addr,
        remote_addr,
        config,
        app_cfg.stealth,
        app_cfg.fec,
        app_cfg.mtu,
    )
    .map_err(|e| e.to_string())?;

    info!(
        "Connecting to {} (host header {})",
        remote_addr,
        conn.host_header()
    );
    drive_connection(conn, socket, remote_addr, Some(&path)).await;
    Ok(())
}

async fn run_server(
    listen: String,
    cert: PathBuf,
    key: PathBuf,
    app_cfg: AppConfig,
) -> Result<(), String> {
    let socket = UdpSocket::bind(&listen).map_err(|e| format!("bind {}: {}", listen, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| format!("set_nonblocking: {}", e))?;
    let local_addr = socket.local_addr().map_err(|e| e.to_string())?;
    info!("Listening on {}", local_addr);

    // Wait for the first datagram of a new connection.
    let mut buf = [0u8; 65535];
    let (len, from) = loop {
        match socket.recv_from(&mut buf) {
            Ok(v) => break v,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => return Err(format!("recv_from: {}", e)),
        }
    };

    // The first payload is a FEC-framed QUIC Initial; unwrap the shard to
    // read the header.
    let shard = quicveil::fec::Shard::from_wire(&buf[..len]).map_err(|e| e.to_string())?;
    let mut initial = shard.data.clone();
    let hdr = quiche::Header::from_slice(&mut initial, quiche::MAX_CONN_ID_LEN)
        .map_err(|e| format!("cannot parse initial packet: {}", e))?;
    info!("New connection from {} (dcid {:?})", from, hdr.dcid);

    let mut config = base_quiche_config().map_err(|e| e.to_string())?;
    config
        .load_cert_chain_from_pem_file(&cert.to_string_lossy())
        .map_err(|e| format!("load cert: {}", e))?;
    config
        .load_priv_key_from_pem_file(&key.to_string_lossy())
        .map_err(|e| format!("load key: {}", e))?;

    let scid = quiche::ConnectionId::from_ref(hdr.dcid.as_ref());
    let mut conn = QuicVeilConnection::new_server(
        &scid,
        None,
        local_addr,
        from,
        config,
        app_cfg.stealth,
        app_cfg.fec,
        app_cfg.mtu,
    )
    .map_err(|e| e.to_string())?;

    // Key control frames and obfuscation off the client's source CID, the
    // one secret both sides already share.
    conn.set_control_secret(hdr.scid.as_ref());

    if let Err(e) = conn.recv(&buf[..len]) {
        warn!("initial packet rejected: {}", e);
    }

    drive_connection(conn, socket, from, None).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    );
    logger.init();

    if let Some(addr) = &cli.telemetry {
        telemetry::set_enabled(true);
        telemetry::serve(addr);
    }

    let result = match cli.command {
        Commands::Client {
            remote,
            local,
            host,
            path,
            verify_peer,
            tunnel,
        } => {
            let app_cfg = load_app_config(&cli.config, &tunnel);
            if let Err(e) = app_cfg.validate() {
                error!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
            run_client(remote, local, host, path, verify_peer, app_cfg).await
        }
        Commands::Server {
            listen,
            cert,
            key,
            tunnel,
        } => {
            let app_cfg = load_app_config(&cli.config, &tunnel);
            if let Err(e) = app_cfg.validate() {
                error!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
            run_server(listen, cert, key, app_cfg).await
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
