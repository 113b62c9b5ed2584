//! Error types for the demodulator control plane.

use thiserror::Error;

use crate::chip::ChipVariant;
use crate::types::{AddressSpace, DeliverySystem};

/// Result alias used throughout the control plane.
pub type Result<T> = std::result::Result<T, DemodError>;

/// Top-level error.
///
/// `Timeout` is an expected acquisition outcome and is normally reported as a
/// lock status rather than through this type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemodError {
    /// Channel parameters were out of range and have been clamped.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Delivery system not available on this chip.
    #[error("Delivery system {system} is not supported by chip {variant}")]
    Capability {
        system: DeliverySystem,
        variant: ChipVariant,
    },

    /// No PLL solution for the requested clocks.
    #[error("Clock synthesis failed: {0}")]
    ClockSynthesis(#[from] ClockSynthesisError),

    #[error("Tuner error: {0}")]
    Tuner(#[from] TunerError),

    #[error("Register access failed: {0}")]
    Register(#[from] RegisterError),

    /// Acquisition reached its terminal timeout state.
    #[error("Acquisition timed out")]
    Timeout,

    /// An acquisition search was cancelled by a mode change.
    #[error("Operation aborted by mode change")]
    Aborted,

    /// A channel operation was issued before the standard was initialised.
    #[error("Standard is not initialised")]
    NotInitialized,

    /// Capture memory could not be reserved.
    #[error("Capture memory allocation failed: {0}")]
    CaptureMemory(String),
}

/// Out-of-range channel parameter, recoverable after clamping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field} {requested} out of range, using {applied}")]
pub struct ConfigurationError {
    /// Parameter name.
    pub field: &'static str,
    /// Value as requested.
    pub requested: u32,
    /// Value actually programmed.
    pub applied: u32,
}

/// PLL search failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockSynthesisError {
    /// No multiplier/divider combination keeps the VCO inside its range.
    #[error("no PLL solution for ref={reference_khz}kHz a={target_a_khz}kHz b={target_b_khz}kHz")]
    NoSolution {
        reference_khz: u32,
        target_a_khz: u32,
        target_b_khz: u32,
    },

    /// A requested output frequency is zero or above the VCO range.
    #[error("invalid target frequency: {0}kHz")]
    InvalidTarget(u32),
}

/// Tuner collaborator failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunerError {
    #[error("no tuner attached")]
    Absent,

    #[error("tuner not responding: {0}")]
    Unresponsive(String),
}

/// Register bus failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("register {space:?}+0x{offset:x} is not mapped")]
    Unmapped { space: AddressSpace, offset: u32 },

    #[error("bus error: {0}")]
    Bus(String),
}

/// Numeric error codes exposed to callers that cannot carry Rust errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0x0000,
    Unknown = 0x0001,
    Configuration = 0x0002,
    Capability = 0x0003,
    ClockSynthesis = 0x0004,
    Tuner = 0x0005,
    Register = 0x0006,
    Timeout = 0x0007,
    Aborted = 0x0008,
    NotInitialized = 0x0009,
    CaptureMemory = 0x000A,
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => ErrorCode::Success,
            0x0002 => ErrorCode::Configuration,
            0x0003 => ErrorCode::Capability,
            0x0004 => ErrorCode::ClockSynthesis,
            0x0005 => ErrorCode::Tuner,
            0x0006 => ErrorCode::Register,
            0x0007 => ErrorCode::Timeout,
            0x0008 => ErrorCode::Aborted,
            0x0009 => ErrorCode::NotInitialized,
            0x000A => ErrorCode::CaptureMemory,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<&DemodError> for ErrorCode {
    fn from(err: &DemodError) -> Self {
        match err {
            DemodError::Configuration(_) => ErrorCode::Configuration,
            DemodError::Capability { .. } => ErrorCode::Capability,
            DemodError::ClockSynthesis(_) => ErrorCode::ClockSynthesis,
            DemodError::Tuner(_) => ErrorCode::Tuner,
            DemodError::Register(_) => ErrorCode::Register,
            DemodError::Timeout => ErrorCode::Timeout,
            DemodError::Aborted => ErrorCode::Aborted,
            DemodError::NotInitialized => ErrorCode::NotInitialized,
            DemodError::CaptureMemory(_) => ErrorCode::CaptureMemory,
        }
    }
}

impl DemodError {
    /// Errors after which the device keeps running with degraded function.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DemodError::Configuration(_)
                | DemodError::Tuner(_)
                | DemodError::Timeout
                | DemodError::Aborted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = DemodError::Capability {
            system: DeliverySystem::Dvbs2,
            variant: ChipVariant::Txl,
        };
        assert_eq!(ErrorCode::from(&err), ErrorCode::Capability);
        assert_eq!(ErrorCode::from(0x0004), ErrorCode::ClockSynthesis);
        assert_eq!(ErrorCode::from(0xFFFF), ErrorCode::Unknown);
    }

    #[test]
    fn test_configuration_error_display() {
        let err = ConfigurationError {
            field: "symbol_rate",
            requested: 500,
            applied: 5361,
        };
        assert_eq!(err.to_string(), "symbol_rate 500 out of range, using 5361");
        assert!(DemodError::from(err).is_recoverable());
    }
}
