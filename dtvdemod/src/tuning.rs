//! Re-tune versus poll decisions around the active driver.

use log::{debug, info};

use dtvdemod_types::{FrontendParams, LockStatus, Result};

use crate::standard::{ActiveStandard, DriverContext, StandardDriver, TuneOutcome};

#[derive(Debug, Default)]
pub struct TuningStateMachine {
    /// Set by a re-tune; polls report Unset until then.
    detect_enabled: bool,
    last_lock: Option<bool>,
}

impl TuningStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detect_enabled(&self) -> bool {
        self.detect_enabled
    }

    /// Forget the current acquisition (mode change).
    pub fn reset(&mut self) {
        self.detect_enabled = false;
        self.last_lock = None;
    }

    pub async fn tune(
        &mut self,
        driver: Option<&mut ActiveStandard>,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
        re_tune: bool,
        mode_flags: u32,
    ) -> Result<TuneOutcome> {
        let Some(driver) = driver else {
            debug!("[Tuning] no active mode");
            return Ok(TuneOutcome {
                delay: ctx.config.device.unknown_mode_delay(),
                status: LockStatus::UNSET,
            });
        };

        if re_tune {
            self.detect_enabled = true;
            self.last_lock = None;
        } else if !self.detect_enabled {
            return Ok(TuneOutcome {
                delay: driver.tune_settings().min_delay,
                status: LockStatus::UNSET,
            });
        }

        let outcome = driver.tune(ctx, params, re_tune, mode_flags).await?;
        let locked = outcome.status.is_locked();
        if self.last_lock != Some(locked) {
            if locked {
                info!("[{}] !! >> LOCK << !!", driver.mode());
            } else if self.last_lock.is_some() {
                info!("[{}] !! >> UNLOCK << !!", driver.mode());
            }
            self.last_lock = Some(locked);
        }
        debug!(
            "[Tuning] {} re_tune={} -> {}, next poll in {:?}",
            driver.mode(),
            re_tune,
            outcome.status,
            outcome.delay
        );
        Ok(outcome)
    }
}
