//! Capability probe configuration.
//!
//! Usually embedded as an `[io.probe]` table in the log store's config file:
//!
//! ```toml
//! max_alignment = 4096
//! min_alignment = 512
//! probe_async = true
//! file_prefix = ".probe-"
//! ```
//!
//! Every field is optional; missing ones take the defaults below.

use serde::{Deserialize, Serialize};

use crate::{IoError, IoResult};

/// Smallest alignment any block device uses.
pub const SECTOR_SIZE: usize = 512;

/// Tunables for [`Prober`](crate::Prober).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// First (largest) alignment tried, and the size of the probe file.
    pub max_alignment: usize,
    /// Last (smallest) alignment tried.
    pub min_alignment: usize,
    /// Whether to probe for non-blocking kernel AIO at all.
    pub probe_async: bool,
    /// Prefix of the temporary probe file.
    pub file_prefix: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_alignment: 4096,
            min_alignment: SECTOR_SIZE,
            probe_async: true,
            file_prefix: ".probe-".to_string(),
        }
    }
}

impl ProbeConfig {
    /// Parses and validates a TOML fragment.
    pub fn from_toml_str(s: &str) -> IoResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the alignment range is usable and the prefix is a plain
    /// filename.
    pub fn validate(&self) -> IoResult<()> {
        for (name, value) in [
            ("max_alignment", self.max_alignment),
            ("min_alignment", self.min_alignment),
        ] {
            if !value.is_power_of_two() {
                return Err(IoError::InvalidConfig(format!(
                    "{name} must be a power of two, got {value}"
                )));
            }
        }
        if self.min_alignment < SECTOR_SIZE {
            return Err(IoError::InvalidConfig(format!(
                "min_alignment must be at least {SECTOR_SIZE}, got {}",
                self.min_alignment
            )));
        }
        if self.min_alignment > self.max_alignment {
            return Err(IoError::InvalidConfig(format!(
                "min_alignment {} exceeds max_alignment {}",
                self.min_alignment, self.max_alignment
            )));
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains('/') {
            return Err(IoError::InvalidConfig(format!(
                "file_prefix must be a non-empty filename, got {:?}",
                self.file_prefix
            )));
        }
        Ok(())
    }

    /// Candidate alignments, largest first, halving down to the minimum.
    pub fn candidate_alignments(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(self.max_alignment), |&size| Some(size / 2))
            .take_while(move |&size| size >= self.min_alignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn defaults_are_valid() {
        let config = ProbeConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.candidate_alignments().collect::<Vec<_>>(),
            vec![4096, 2048, 1024, 512]
        );
    }

    #[test]
    fn empty_toml_yields_defaults() {
        assert_eq!(ProbeConfig::from_toml_str("").unwrap(), ProbeConfig::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = ProbeConfig::from_toml_str("max_alignment = 65536\nprobe_async = false").unwrap();
        assert_eq!(config.max_alignment, 65536);
        assert!(!config.probe_async);
        assert_eq!(config.min_alignment, 512);
        assert_eq!(config.candidate_alignments().count(), 8);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = ProbeConfig::from_toml_str("max_alignment = \"big\"").unwrap_err();
        assert!(matches!(err, IoError::ConfigParse { .. }));
    }

    #[test_case("max_alignment = 3000"; "max not power of two")]
    #[test_case("min_alignment = 256"; "min below sector")]
    #[test_case("min_alignment = 8192"; "min above max")]
    #[test_case("file_prefix = \"\""; "empty prefix")]
    #[test_case("file_prefix = \"a/b\""; "prefix with separator")]
    fn invalid_values_are_rejected(toml: &str) {
        let err = ProbeConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, IoError::InvalidConfig(_)), "{err}");
    }
}
