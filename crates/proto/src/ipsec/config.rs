//! IPsec engine configuration
//!
//! Provides the configuration structure and builder for [`crate::ipsec::Ipsec`].
//! Defaults match the protocol constants; lifetimes are caller-tunable so
//! deployments can trade rekey frequency against kernel churn.

use meshguard_platform::{Mark, SaLimits};

use crate::ipsec::error::{Error, Result};

/// Mark bit reserved for this subsystem: `0x1 << 17`.
pub const DEFAULT_MARK: u32 = 0x1 << 17;

/// Configuration for the IPsec establishment engine
#[derive(Clone, Debug)]
pub struct IpsecConfig {
    /// Packet mark identifying traffic and policies owned by this process.
    pub mark: Mark,

    /// SA lifetime limits. Hard limits apply to every SA; soft limits are
    /// applied only to outbound SAs, whose soft expiry drives rekeying.
    pub limits: SaLimits,
}

impl Default for IpsecConfig {
    fn default() -> Self {
        IpsecConfig {
            mark: Mark {
                value: DEFAULT_MARK,
                mask: DEFAULT_MARK,
            },
            limits: SaLimits {
                soft_packets: 50,
                hard_packets: 100,
                soft_seconds: 10,
                hard_seconds: 14,
            },
        }
    }
}

impl IpsecConfig {
    /// Create builder for engine configuration
    pub fn builder() -> IpsecConfigBuilder {
        IpsecConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.mark.value == 0 {
            return Err(Error::Config("mark value cannot be zero".into()));
        }
        if self.mark.value & self.mark.mask != self.mark.value {
            return Err(Error::Config(
                "mark value must be covered by its mask".into(),
            ));
        }
        if self.limits.hard_packets == 0 && self.limits.hard_seconds == 0 {
            return Err(Error::Config(
                "at least one hard lifetime limit is required".into(),
            ));
        }
        if self.limits.soft_packets >= self.limits.hard_packets && self.limits.hard_packets != 0 {
            return Err(Error::Config(
                "soft packet limit must be below the hard limit".into(),
            ));
        }
        if self.limits.soft_seconds >= self.limits.hard_seconds && self.limits.hard_seconds != 0 {
            return Err(Error::Config(
                "soft time limit must be below the hard limit".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`IpsecConfig`]
#[derive(Default)]
pub struct IpsecConfigBuilder {
    mark: Option<Mark>,
    limits: Option<SaLimits>,
}

impl IpsecConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the process mark.
    pub fn with_mark(mut self, value: u32, mask: u32) -> Self {
        self.mark = Some(Mark { value, mask });
        self
    }

    /// Override the SA lifetime limits.
    pub fn with_limits(mut self, limits: SaLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<IpsecConfig> {
        let defaults = IpsecConfig::default();
        let config = IpsecConfig {
            mark: self.mark.unwrap_or(defaults.mark),
            limits: self.limits.unwrap_or(defaults.limits),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IpsecConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mark.value, 0x20000);
        assert_eq!(config.limits.hard_packets, 100);
        assert_eq!(config.limits.soft_seconds, 10);
    }

    #[test]
    fn test_builder_defaults() {
        let config = IpsecConfig::builder().build().unwrap();
        assert_eq!(config.mark.value, IpsecConfig::default().mark.value);
    }

    #[test]
    fn test_builder_overrides() {
        let config = IpsecConfig::builder()
            .with_mark(0x40000, 0x40000)
            .with_limits(SaLimits {
                soft_packets: 1000,
                hard_packets: 2000,
                soft_seconds: 60,
                hard_seconds: 120,
            })
            .build()
            .unwrap();

        assert_eq!(config.mark.value, 0x40000);
        assert_eq!(config.limits.hard_seconds, 120);
    }

    #[test]
    fn test_rejects_zero_mark() {
        let result = IpsecConfig::builder().with_mark(0, 0x20000).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_mark_outside_mask() {
        let result = IpsecConfig::builder().with_mark(0x30000, 0x20000).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_soft_at_or_above_hard() {
        let result = IpsecConfig::builder()
            .with_limits(SaLimits {
                soft_packets: 100,
                hard_packets: 100,
                soft_seconds: 10,
                hard_seconds: 14,
            })
            .build();
        assert!(result.is_err());

        let result = IpsecConfig::builder()
            .with_limits(SaLimits {
                soft_packets: 50,
                hard_packets: 100,
                soft_seconds: 20,
                hard_seconds: 14,
            })
            .build();
        assert!(result.is_err());
    }
}
