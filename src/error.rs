use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("quiche error: {0}")]
    Quiche(#[from] quiche::Error),
    #[error("http/3 error: {0}")]
    Http3(#[from] quiche::h3::Error),
    #[error("fec error: {0}")]
    Fec(String),
    #[error("frame codec error: {0}")]
    Frame(String),
    #[error("crypto error: {0}")]
    Crypto(&'static str),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<&'static str> for ConnectionError {
    fn from(s: &'static str) -> Self {
        ConnectionError::Fec(s.to_string())
    }
}

impl From<String> for ConnectionError {
    fn from(s: String) -> Self {
        ConnectionError::Fec(s)
    }
}

/// Rejected configurations. These surface at construction time; once a
/// component is built it never reports a configuration fault.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mtu floor {min} exceeds ceiling {max}")]
    MtuRange { min: u16, max: u16 },
    #[error("mtu step_size must be non-zero")]
    ZeroStep,
    #[error("probe_timeout must be non-zero")]
    ZeroProbeTimeout,
    #[error("blackhole_threshold must be at least 1")]
    ZeroBlackholeThreshold,
    #[error("low_loss_threshold {low} must be below high_loss_threshold {high}")]
    LossThresholds { low: f32, high: f32 },
    #[error("{0}")]
    Invalid(String),
}
