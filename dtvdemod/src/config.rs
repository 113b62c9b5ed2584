//! Device configuration.
//!
//! Every knob has a default matching the shipped driver, so an empty file
//! (or no file at all) gives the stock behaviour. Sections:
//! - `[device]`: chip variant, DVB-C clock source, capture buffer, mode delays
//! - `[timers]`: detection and re-issue windows per standard
//! - `[dvbc]`, `[dvbt]`, `[atsc]`, `[dtmb]`: per-standard acquisition tuning

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dtvdemod_types::ChipVariant;

use crate::clock::DvbcClockMode;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Complete device configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemodConfig {
    pub device: DeviceSection,
    pub timers: TimerSection,
    pub dvbc: DvbcSection,
    pub dvbt: DvbtSection,
    pub atsc: AtscSection,
    pub dtmb: DtmbSection,
}

impl DemodConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub chip: ChipVariant,
    pub dvbc_clock: DvbcClockMode,
    /// Symbol capture buffer for DTMB and DVB-T, 0 disables allocation.
    pub capture_buffer_bytes: u32,
    /// Base of the reserved capture region.
    pub capture_base: u32,
    pub leave_settle_ms: u64,
    pub unknown_mode_delay_ms: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            chip: ChipVariant::Txl,
            dvbc_clock: DvbcClockMode::Adc,
            capture_buffer_bytes: 8 * 1024 * 1024, // 8MB
            capture_base: 0x0f00_0000,
            leave_settle_ms: 200,
            unknown_mode_delay_ms: 5000,
        }
    }
}

impl DeviceSection {
    pub fn leave_settle(&self) -> Duration {
        ms(self.leave_settle_ms)
    }

    pub fn unknown_mode_delay(&self) -> Duration {
        ms(self.unknown_mode_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSection {
    pub dvbc_detect_ms: u64,
    pub dvbc_set_ms: u64,
    pub dvbt_detect_ms: u64,
    pub dvbt_set_ms: u64,
    pub atsc_detect_ms: u64,
    pub dtmb_detect_ms: u64,
    /// Time after detection starts before tuner power is trusted.
    pub tuner_settle_ms: u64,
}

impl Default for TimerSection {
    fn default() -> Self {
        Self {
            dvbc_detect_ms: 3000,
            dvbc_set_ms: 4000,
            dvbt_detect_ms: 2000,
            dvbt_set_ms: 4000,
            atsc_detect_ms: 4000,
            dtmb_detect_ms: 500,
            tuner_settle_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DvbcSection {
    /// Let the engine track the symbol rate after the first lock.
    pub auto_symbol_rate: bool,
    /// Run the CCI helper task while DVB-C is active.
    pub cci_task: bool,
    pub cci_period_ms: u64,
    /// Below this tuner power (dBm) the channel is declared empty.
    pub min_strength_dbm: i32,
    pub tune_delay_ms: u64,
}

impl Default for DvbcSection {
    fn default() -> Self {
        Self {
            auto_symbol_rate: false,
            cci_task: true,
            cci_period_ms: 500,
            min_strength_dbm: -87,
            tune_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DvbtSection {
    pub tune_delay_ms: u64,
}

impl Default for DvbtSection {
    fn default() -> Self {
        Self { tune_delay_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtscSection {
    /// Number of CFO candidates tried (3, 5 or 7).
    pub cfo_count: usize,
    /// Field-test mode: single candidate, longer carrier-lock wait.
    pub field_test: bool,
    pub cr_lock_polls: u32,
    pub field_test_cr_lock_polls: u32,
    pub peak_lock_polls: u32,
    pub poll_interval_ms: u64,
    /// Polls waiting for full lock after a successful CFO search.
    pub lock_wait_polls: u32,
    pub cci_enable: bool,
    pub cci_passes: u32,
    pub cci_threshold: u32,
    pub vsb_min_strength_dbm: i32,
    pub j83b_min_strength_dbm: i32,
    pub vsb_detect_retries: u32,
    pub j83b_detect_retries: u32,
    pub j83b_signal_checks: u32,
    pub j83b_signal_check_ms: u64,
    pub j83b_retry_interval_ms: u64,
    /// Tuner settle time before the first VSB detect.
    pub tuner_delay_ms: u64,
    /// SNR reads averaged before choosing a performance profile.
    pub snr_samples: u32,
    /// Equaliser auto-recovery, opened below and closed above an SNR band.
    pub ar_enable: bool,
    pub ar_open_below_db: u32,
    pub ar_close_above_db: u32,
    /// Retry unlocked J.83B channels on the IRC and HRC frequency plans.
    pub auto_search_std: bool,
    pub std_lock_timeout_ms: u64,
    pub tune_delay_ms: u64,
}

impl Default for AtscSection {
    fn default() -> Self {
        Self {
            cfo_count: 7,
            field_test: false,
            cr_lock_polls: 3,
            field_test_cr_lock_polls: 20,
            peak_lock_polls: 30,
            poll_interval_ms: 20,
            lock_wait_polls: 80,
            cci_enable: true,
            cci_passes: 4,
            cci_threshold: 800,
            vsb_min_strength_dbm: -87,
            j83b_min_strength_dbm: -76,
            vsb_detect_retries: 2,
            j83b_detect_retries: 10,
            j83b_signal_checks: 5,
            j83b_signal_check_ms: 25,
            j83b_retry_interval_ms: 50,
            tuner_delay_ms: 100,
            snr_samples: 100,
            ar_enable: false,
            ar_open_below_db: 12,
            ar_close_above_db: 15,
            auto_search_std: false,
            std_lock_timeout_ms: 1000,
            tune_delay_ms: 500,
        }
    }
}

impl AtscSection {
    pub fn poll_interval(&self) -> Duration {
        ms(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtmbSection {
    /// No-signal calibration passes before a full reset.
    pub no_signal_passes: u32,
    /// BCH error growth per sample that triggers a reset.
    pub bch_growth_threshold: u32,
    /// Poll cycles waiting for relock after a BCH reset.
    pub bch_retry_bound: u32,
    pub delay_have_signal_ms: u64,
    pub delay_no_signal_ms: u64,
    pub delay_steady_ms: u64,
    /// Idle poll period while no tune is active.
    pub delay_idle_ms: u64,
    pub first_detect_probes: u32,
    pub first_detect_interval_ms: u64,
    /// Wait after retuning the tuner before programming the engine.
    pub tuner_settle_ms: u64,
    pub tune_delay_ms: u64,
}

impl Default for DtmbSection {
    fn default() -> Self {
        Self {
            no_signal_passes: 10,
            bch_growth_threshold: 50,
            bch_retry_bound: 3,
            delay_have_signal_ms: 100,
            delay_no_signal_ms: 120,
            delay_steady_ms: 300,
            delay_idle_ms: 3000,
            first_detect_probes: 4,
            first_detect_interval_ms: 50,
            tuner_settle_ms: 100,
            tune_delay_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DemodConfig::from_toml("").unwrap();
        assert_eq!(config, DemodConfig::default());
        assert_eq!(config.timers.dvbc_detect_ms, 3000);
        assert_eq!(config.dtmb.no_signal_passes, 10);
        assert_eq!(config.atsc.peak_lock_polls, 30);
    }

    #[test]
    fn test_partial_sections() {
        let config = DemodConfig::from_toml(
            r#"
            [device]
            chip = "txlx"
            dvbc_clock = "crystal"

            [atsc]
            field_test = true
            cfo_count = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.device.chip, ChipVariant::Txlx);
        assert_eq!(config.device.dvbc_clock, DvbcClockMode::Crystal);
        assert!(config.atsc.field_test);
        assert_eq!(config.atsc.cfo_count, 3);
        assert_eq!(config.atsc.cr_lock_polls, 3);
        assert_eq!(config.device.leave_settle(), Duration::from_millis(200));
    }

    #[test]
    fn test_bad_config_is_parse_error() {
        let err = DemodConfig::from_toml("[device]\nchip = 42\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
