//! Shared definitions for the DTV demodulator control plane.
//!
//! This crate contains:
//! - Delivery-system tags and their demodulator categories
//! - Channel parameter, lock status and signal metric types
//! - The chip-variant capability table
//! - Error types

pub mod chip;
pub mod error;
pub mod types;

pub use chip::{Capabilities, ChipVariant, EngineVersion, OffsetScheme, PllFamily};
pub use error::{
    ClockSynthesisError, ConfigurationError, DemodError, ErrorCode, RegisterError, Result,
    TunerError,
};
pub use types::*;
