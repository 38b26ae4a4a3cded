use crate::error::ConfigError;
use crate::fec::FecConfig;
use crate::mtu::MtuConfig;
use crate::stealth::StealthConfig;
use std::path::Path;

/// Unified configuration structure parsed from a TOML file.
#[derive(Clone)]
pub struct AppConfig {
    pub mtu: MtuConfig,
    pub stealth: StealthConfig,
    pub fec: FecConfig,
}

impl AppConfig {
    /// Load configuration from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            mtu: MtuConfig::from_toml(s).unwrap_or_default(),
            stealth: StealthConfig::from_toml(s).unwrap_or_default(),
            fec: FecConfig::from_toml(s).unwrap_or_default(),
        })
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Validate all sub-configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mtu.validate()?;
        self.stealth.validate().map_err(ConfigError::Invalid)?;
        self.fec.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mtu: MtuConfig::default(),
            stealth: StealthConfig::default(),
            fec: FecConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_file_parses_all_sections() {
        let cfg = AppConfig::from_toml(
            r#"
            [mtu]
            max_mtu = 1452

            [stealth]
            enable_domain_fronting = false

            [fec]
            data_shards = 16
        "#,
        )
        .unwrap();
        assert_eq!(cfg.mtu.max_mtu, 1452);
        assert!(!cfg.stealth.enable_domain_fronting);
        assert_eq!(cfg.fec.data_shards, 16);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_propagates_mtu_errors() {
        let mut cfg = AppConfig::default();
        cfg.mtu.min_mtu = 1600;
        assert!(cfg.validate().is_err());
    }
}
