//! DTMB driver.
//!
//! A re-tune runs a short first-detect probe and hands the result to the
//! background [`PollMachine`], which owns the lock status from then on.
//! Tl1 skips the first detect; an unlocked status reads as unset until the
//! detect window closes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use dtvdemod_types::{
    AddressSpace, ChipVariant, DemodMode, FrontendParams, LockStatus, Result, SignalMetrics,
};

use crate::clock::{self, ClockPlan};
use crate::dtmb_poll::{reg, DtmbProbe, PollMachine, PollState};
use crate::timer::TimerId;
use crate::tuner::strength_percent;

use super::snr::convert_snr;
use super::{ChannelOutcome, DriverContext, StandardDriver, TuneOutcome, TuneSettings};

/// Verdict of the first-detect probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstDetect {
    Locked,
    NoSignal,
    /// Frame headers seen but no FEC lock yet.
    Undetermined,
}

pub struct DtmbDriver {
    machine: Arc<parking_lot::Mutex<PollMachine>>,
}

impl DtmbDriver {
    pub fn new(config: &crate::config::DemodConfig) -> Self {
        Self {
            machine: Arc::new(parking_lot::Mutex::new(PollMachine::new(&config.dtmb))),
        }
    }

    /// Machine shared with the poll task.
    pub fn poll_machine(&self) -> Arc<parking_lot::Mutex<PollMachine>> {
        self.machine.clone()
    }

    /// Probe for lock every `first_detect_interval_ms`, up to `first_detect_probes` times.
    pub async fn first_detect(&self, ctx: &DriverContext<'_>) -> Result<FirstDetect> {
        let config = &ctx.config.dtmb;
        let mut signal = false;
        for probe in 0..config.first_detect_probes {
            ctx.check_abort()?;
            {
                let mut regs = ctx.hal.regs().await;
                if regs.fec_locked()? {
                    debug!("[DTMB] first detect locked at probe {}", probe);
                    return Ok(FirstDetect::Locked);
                }
                signal |= regs.read(AddressSpace::Dtmb, reg::SIGNAL)? != 0;
            }
            ctx.sleep(Duration::from_millis(config.first_detect_interval_ms))
                .await?;
        }
        Ok(if signal {
            FirstDetect::Undetermined
        } else {
            FirstDetect::NoSignal
        })
    }
}

impl StandardDriver for DtmbDriver {
    fn mode(&self) -> DemodMode {
        DemodMode::Dtmb
    }

    async fn init(&mut self, ctx: &mut DriverContext<'_>) -> Result<ClockPlan> {
        let (adc_khz, sys_khz) =
            clock::demod_clock_pair(DemodMode::Dtmb, ctx.variant, ctx.config.device.dvbc_clock);
        let regs = ctx.hal.regs().await;
        let plan = clock::configure(&regs, ctx.variant, adc_khz, sys_khz)?;
        regs.write(AddressSpace::Dtmb, reg::CTRL, 0)?;
        self.machine.lock().stop();
        info!("[DTMB] init");
        Ok(plan)
    }

    async fn set_channel(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
    ) -> Result<ChannelOutcome> {
        ctx.tune_tuner(params);
        ctx.sleep(Duration::from_millis(ctx.config.dtmb.tuner_settle_ms))
            .await?;
        let mut regs = ctx.hal.regs().await;
        regs.write(AddressSpace::Dtmb, reg::CH_FREQ, params.frequency_hz / 1000)?;
        regs.reset(false)?;
        Ok(ChannelOutcome::Applied)
    }

    async fn read_status(&mut self, ctx: &mut DriverContext<'_>) -> Result<LockStatus> {
        let status = self.machine.lock().last_status();
        if ctx.variant != ChipVariant::Tl1 || status.is_locked() {
            return Ok(status);
        }
        if ctx.timers.not_enough(TimerId::Detect) {
            return Ok(LockStatus::UNSET);
        }
        ctx.timers.disable(TimerId::Detect);
        Ok(LockStatus::TIMEOUT)
    }

    async fn read_metrics(&mut self, ctx: &mut DriverContext<'_>) -> Result<SignalMetrics> {
        let raw = {
            let regs = ctx.hal.regs().await;
            regs.read(AddressSpace::Dtmb, reg::CHE_SNR)? & 0x3fff
        };
        Ok(SignalMetrics {
            ber: 0,
            snr: convert_snr(raw),
            strength: strength_percent(ctx.tuner_strength()),
            ucblocks: 0,
        })
    }

    async fn tune(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
        re_tune: bool,
        _mode_flags: u32,
    ) -> Result<TuneOutcome> {
        let delay = Duration::from_millis(ctx.config.dtmb.tune_delay_ms);
        if !re_tune {
            let status = self.read_status(ctx).await?;
            return Ok(TuneOutcome { delay, status });
        }

        self.machine.lock().stop();
        self.set_channel(ctx, params).await?;

        let verdict = if ctx.variant == ChipVariant::Tl1 {
            ctx.timers.begin(TimerId::Detect);
            FirstDetect::Undetermined
        } else {
            self.first_detect(ctx).await?
        };

        let state = match verdict {
            FirstDetect::Locked => PollState::HasSignalCheck,
            FirstDetect::NoSignal => PollState::NoSignalCheck,
            FirstDetect::Undetermined => {
                let mut regs = ctx.hal.regs().await;
                if regs.fec_locked()? {
                    PollState::HasSignalCheck
                } else {
                    PollState::NoSignalCheck
                }
            }
        };
        debug!("[DTMB] first detect {:?}, poll from {:?}", verdict, state);

        self.machine.lock().start_tune(state);
        let status = self.read_status(ctx).await?;
        Ok(TuneOutcome { delay, status })
    }

    async fn release(&mut self, _ctx: &mut DriverContext<'_>) -> Result<()> {
        self.machine.lock().stop();
        Ok(())
    }

    fn tune_settings(&self) -> TuneSettings {
        TuneSettings {
            min_delay: Duration::from_millis(300),
        }
    }
}
