//! Tuner seam.
//!
//! The RF tuner has its own driver; the demodulator only needs its input
//! power, a way to retune it, and release.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use log::debug;

use dtvdemod_types::{FrontendParams, TunerError};

/// RF tuner collaborator.
pub trait TunerDriver: Send + Sync {
    /// Input power in dBm.
    fn get_strength(&self) -> Result<i32, TunerError>;
    fn set_params(&self, params: &FrontendParams) -> Result<(), TunerError>;
    fn release(&self);
}

/// Map tuner power to the 0..=100 strength scale; absent tuner reads as 0.
pub fn strength_percent(power: Result<i32, TunerError>) -> u16 {
    match power {
        Ok(dbm) => (dbm + 100).clamp(0, 100) as u16,
        Err(_) => 0,
    }
}

/// Tuner reporting a settable, fixed input power.
pub struct FixedTuner {
    strength_dbm: AtomicI32,
    frequency_hz: AtomicU32,
    tune_count: AtomicU32,
    released: AtomicBool,
}

impl FixedTuner {
    pub fn new(strength_dbm: i32) -> Self {
        Self {
            strength_dbm: AtomicI32::new(strength_dbm),
            frequency_hz: AtomicU32::new(0),
            tune_count: AtomicU32::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn set_strength(&self, dbm: i32) {
        self.strength_dbm.store(dbm, Ordering::SeqCst);
    }

    /// Frequency of the last `set_params` call.
    pub fn frequency_hz(&self) -> u32 {
        self.frequency_hz.load(Ordering::SeqCst)
    }

    pub fn tune_count(&self) -> u32 {
        self.tune_count.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl TunerDriver for FixedTuner {
    fn get_strength(&self) -> Result<i32, TunerError> {
        Ok(self.strength_dbm.load(Ordering::SeqCst))
    }

    fn set_params(&self, params: &FrontendParams) -> Result<(), TunerError> {
        debug!("[FixedTuner] tune to {} Hz", params.frequency_hz);
        self.frequency_hz.store(params.frequency_hz, Ordering::SeqCst);
        self.tune_count.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
