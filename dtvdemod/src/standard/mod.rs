//! Per-standard demodulator drivers.
//!
//! Every engine implements [`StandardDriver`]. The mode controller holds the
//! active one as an [`ActiveStandard`] and dispatches by enum match.

pub mod atsc;
pub mod dtmb;
pub mod dvbc;
pub mod dvbt;
pub mod snr;

use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use dtvdemod_types::{
    ChipVariant, ConfigurationError, DemodError, DemodMode, FrontendParams, LockStatus, Result,
    SignalMetrics, TunerError,
};

use crate::clock::ClockPlan;
use crate::config::DemodConfig;
use crate::regs::Hal;
use crate::timer::{TimerId, Timers};

pub use atsc::AtscDriver;
pub use dtmb::DtmbDriver;
pub use dvbc::DvbcDriver;
pub use dvbt::DvbtDriver;

/// Frontend-core flag: tune once, never re-issue the channel.
pub const TUNE_MODE_ONESHOT: u32 = 0x01;

/// Result of one tune step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneOutcome {
    /// Time the caller should wait before polling again.
    pub delay: Duration,
    pub status: LockStatus,
}

/// What `set_channel` did with the requested parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Applied,
    /// Programmed after clamping out-of-range values.
    Clamped(Vec<ConfigurationError>),
    /// Skipped: an automatic tracking pass for this frequency is still running.
    Suppressed,
}

/// Caller-side pacing hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneSettings {
    pub min_delay: Duration,
}

/// Everything a driver call may touch besides its own state.
pub struct DriverContext<'a> {
    pub hal: &'a Hal,
    pub timers: &'a mut Timers,
    pub config: &'a DemodConfig,
    pub variant: ChipVariant,
    pub abort: &'a CancellationToken,
}

impl DriverContext<'_> {
    /// Fail with `Aborted` once a mode change has been requested.
    pub fn check_abort(&self) -> Result<()> {
        if self.abort.is_cancelled() {
            return Err(DemodError::Aborted);
        }
        Ok(())
    }

    /// Sleep that ends early with `Aborted` on a mode change.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.abort.cancelled() => Err(DemodError::Aborted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Tuner power in dBm.
    pub fn tuner_strength(&self) -> std::result::Result<i32, TunerError> {
        self.hal.tuner_strength()
    }

    /// Tuner power is known and below `threshold_dbm`.
    ///
    /// An absent tuner never counts as weak, so acquisition still runs.
    pub fn tuner_below(&self, threshold_dbm: i32) -> bool {
        matches!(self.tuner_strength(), Ok(dbm) if dbm < threshold_dbm)
    }

    /// Retune the RF tuner; a missing or failing tuner is logged, not fatal.
    pub fn tune_tuner(&self, params: &FrontendParams) {
        match self.hal.tuner() {
            Some(tuner) => {
                if let Err(e) = tuner.set_params(params) {
                    warn!("[Tuner] set_params failed: {}", e);
                }
            }
            None => warn!("[Tuner] no tuner attached, engine programmed only"),
        }
    }
}

/// Capability interface of one demodulation engine.
#[allow(async_fn_in_trait)]
pub trait StandardDriver {
    fn mode(&self) -> DemodMode;

    /// Configure the clock pair and reset the engine.
    async fn init(&mut self, ctx: &mut DriverContext<'_>) -> Result<ClockPlan>;

    /// Program a channel and restart acquisition.
    async fn set_channel(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
    ) -> Result<ChannelOutcome>;

    async fn read_status(&mut self, ctx: &mut DriverContext<'_>) -> Result<LockStatus>;

    async fn read_metrics(&mut self, ctx: &mut DriverContext<'_>) -> Result<SignalMetrics>;

    /// Full set_channel + first detect when `re_tune`, otherwise one poll.
    async fn tune(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
        re_tune: bool,
        mode_flags: u32,
    ) -> Result<TuneOutcome>;

    /// Undo set_channel side effects.
    async fn release(&mut self, ctx: &mut DriverContext<'_>) -> Result<()>;

    fn tune_settings(&self) -> TuneSettings;
}

/// Steady-state poll shared by the DVB-C and OFDM drivers.
///
/// Unlocked for longer than the Set window re-issues the channel, unless
/// the caller asked for a one-shot tune.
pub(crate) async fn poll_with_reissue<D: StandardDriver>(
    driver: &mut D,
    ctx: &mut DriverContext<'_>,
    params: &FrontendParams,
    mode_flags: u32,
) -> Result<LockStatus> {
    let status = driver.read_status(ctx).await?;
    if status.is_locked() {
        ctx.timers.disable(TimerId::Set);
    } else if !ctx.timers.is_enabled(TimerId::Set) {
        ctx.timers.begin(TimerId::Set);
    }

    if ctx.timers.is_enough(TimerId::Set) {
        if mode_flags & TUNE_MODE_ONESHOT == 0 {
            info!("[{}] unlocked past the set window, re-issuing channel", driver.mode());
            driver.set_channel(ctx, params).await?;
        }
        ctx.timers.disable(TimerId::Set);
    }
    Ok(status)
}

/// The engine selected by the mode controller.
pub enum ActiveStandard {
    Dvbc(DvbcDriver),
    Dvbt(DvbtDriver),
    Atsc(AtscDriver),
    Dtmb(DtmbDriver),
}

impl ActiveStandard {
    /// Driver for a demodulator category, `None` for Unknown.
    pub fn for_mode(mode: DemodMode, config: &DemodConfig) -> Option<Self> {
        match mode {
            DemodMode::Dvbc => Some(ActiveStandard::Dvbc(DvbcDriver::new(config))),
            DemodMode::Dvbt => Some(ActiveStandard::Dvbt(DvbtDriver::new(false))),
            DemodMode::Isdbt => Some(ActiveStandard::Dvbt(DvbtDriver::new(true))),
            DemodMode::Atsc => Some(ActiveStandard::Atsc(AtscDriver::new())),
            DemodMode::Dtmb => Some(ActiveStandard::Dtmb(DtmbDriver::new(config))),
            DemodMode::Unknown => None,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $driver:ident => $body:expr) => {
        match $self {
            ActiveStandard::Dvbc($driver) => $body,
            ActiveStandard::Dvbt($driver) => $body,
            ActiveStandard::Atsc($driver) => $body,
            ActiveStandard::Dtmb($driver) => $body,
        }
    };
}

impl StandardDriver for ActiveStandard {
    fn mode(&self) -> DemodMode {
        dispatch!(self, d => d.mode())
    }

    async fn init(&mut self, ctx: &mut DriverContext<'_>) -> Result<ClockPlan> {
        dispatch!(self, d => d.init(ctx).await)
    }

    async fn set_channel(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
    ) -> Result<ChannelOutcome> {
        dispatch!(self, d => d.set_channel(ctx, params).await)
    }

    async fn read_status(&mut self, ctx: &mut DriverContext<'_>) -> Result<LockStatus> {
        dispatch!(self, d => d.read_status(ctx).await)
    }

    async fn read_metrics(&mut self, ctx: &mut DriverContext<'_>) -> Result<SignalMetrics> {
        dispatch!(self, d => d.read_metrics(ctx).await)
    }

    async fn tune(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
        re_tune: bool,
        mode_flags: u32,
    ) -> Result<TuneOutcome> {
        dispatch!(self, d => d.tune(ctx, params, re_tune, mode_flags).await)
    }

    async fn release(&mut self, ctx: &mut DriverContext<'_>) -> Result<()> {
        dispatch!(self, d => d.release(ctx).await)
    }

    fn tune_settings(&self) -> TuneSettings {
        dispatch!(self, d => d.tune_settings())
    }
}
