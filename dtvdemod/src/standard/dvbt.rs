//! DVB-T and ISDB-T driver.
//!
//! Both share the OFDM engine; only the standard select word differs.

use std::time::Duration;

use log::{debug, info};

use dtvdemod_types::{AddressSpace, DemodMode, FrontendParams, LockStatus, Result, SignalMetrics};

use crate::clock::{self, ClockPlan};
use crate::timer::TimerId;
use crate::tuner::strength_percent;

use super::{
    poll_with_reissue, ChannelOutcome, DriverContext, StandardDriver, TuneOutcome, TuneSettings,
};

pub mod reg {
    pub const CTRL: u32 = 0x00;
    pub const CH_FREQ: u32 = 0x01;
    pub const BANDWIDTH: u32 = 0x02;
    /// 0 single AGC, 1 dual AGC.
    pub const AGC_MODE: u32 = 0x03;
    /// 1 DVB-T, 2 ISDB-T.
    pub const STANDARD: u32 = 0x04;
    /// Sync indicator, bits 29:20.
    pub const SYNC: u32 = 0x0a;
    /// Capture buffer base.
    pub const CAPTURE_BASE: u32 = 0x10;
    /// OFDM FSM state, bits 3:0.
    pub const FSM: u32 = 0x2a;
    pub const SNR: u32 = 0x2b;
    pub const BER: u32 = 0x2c;
}

const CTRL_RESET: u32 = 1 << 0;
const DUAL_AGC: u32 = 1;

/// Engine bandwidth code for a bandwidth in Hz; anything unknown is auto.
pub fn bandwidth_code(bandwidth_hz: u32) -> u32 {
    match bandwidth_hz {
        8_000_000 => 0,
        7_000_000 => 1,
        6_000_000 => 2,
        0 => 3,
        5_000_000 => 4,
        10_000_000 => 5,
        1_712_000 => 6,
        _ => 3,
    }
}

pub struct DvbtDriver {
    isdbt: bool,
}

impl DvbtDriver {
    pub fn new(isdbt: bool) -> Self {
        Self { isdbt }
    }

    fn standard_word(&self) -> u32 {
        if self.isdbt {
            2
        } else {
            1
        }
    }
}

impl StandardDriver for DvbtDriver {
    fn mode(&self) -> DemodMode {
        if self.isdbt {
            DemodMode::Isdbt
        } else {
            DemodMode::Dvbt
        }
    }

    async fn init(&mut self, ctx: &mut DriverContext<'_>) -> Result<ClockPlan> {
        let (adc_khz, sys_khz) = clock::demod_clock_pair(
            self.mode(),
            ctx.variant,
            ctx.config.device.dvbc_clock,
        );
        let regs = ctx.hal.regs().await;
        let plan = clock::configure(&regs, ctx.variant, adc_khz, sys_khz)?;
        regs.write(AddressSpace::Dvbt, reg::CTRL, CTRL_RESET)?;
        regs.write(AddressSpace::Dvbt, reg::CTRL, 0)?;
        info!("[{}] init", self.mode());
        Ok(plan)
    }

    async fn set_channel(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
    ) -> Result<ChannelOutcome> {
        let bandwidth = bandwidth_code(params.bandwidth_hz);
        debug!(
            "[{}] {} kHz, bandwidth {} Hz (code {})",
            self.mode(),
            params.frequency_hz / 1000,
            params.bandwidth_hz,
            bandwidth
        );
        ctx.tune_tuner(params);

        let regs = ctx.hal.regs().await;
        regs.write(AddressSpace::Dvbt, reg::CTRL, CTRL_RESET)?;
        regs.write(AddressSpace::Dvbt, reg::CH_FREQ, params.frequency_hz / 1000)?;
        regs.write(AddressSpace::Dvbt, reg::BANDWIDTH, bandwidth)?;
        regs.write(AddressSpace::Dvbt, reg::AGC_MODE, DUAL_AGC)?;
        regs.write(AddressSpace::Dvbt, reg::STANDARD, self.standard_word())?;
        regs.write(AddressSpace::Dvbt, reg::CTRL, 0)?;
        Ok(ChannelOutcome::Applied)
    }

    async fn read_status(&mut self, ctx: &mut DriverContext<'_>) -> Result<LockStatus> {
        let locked = {
            let regs = ctx.hal.regs().await;
            let fsm = regs.read(AddressSpace::Dvbt, reg::FSM)? & 0xf;
            let sync = (regs.read(AddressSpace::Dvbt, reg::SYNC)? >> 20) & 0x3ff;
            matches!(fsm, 9 | 10) && sync != 0
        };
        if locked {
            return Ok(LockStatus::LOCKED);
        }
        if ctx.timers.not_enough(TimerId::Detect) {
            return Ok(LockStatus::UNSET);
        }
        ctx.timers.disable(TimerId::Detect);
        Ok(LockStatus::TIMEOUT)
    }

    async fn read_metrics(&mut self, ctx: &mut DriverContext<'_>) -> Result<SignalMetrics> {
        let regs = ctx.hal.regs().await;
        Ok(SignalMetrics {
            ber: regs.read(AddressSpace::Dvbt, reg::BER)? & 0xffff,
            snr: (regs.read(AddressSpace::Dvbt, reg::SNR)? / 8) as u16,
            strength: strength_percent(ctx.tuner_strength()),
            ucblocks: 0,
        })
    }

    async fn tune(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
        re_tune: bool,
        mode_flags: u32,
    ) -> Result<TuneOutcome> {
        let delay = Duration::from_millis(ctx.config.dvbt.tune_delay_ms);
        let status = if re_tune {
            ctx.timers.begin(TimerId::Detect);
            self.set_channel(ctx, params).await?;
            self.read_status(ctx).await?
        } else {
            poll_with_reissue(self, ctx, params, mode_flags).await?
        };
        Ok(TuneOutcome { delay, status })
    }

    async fn release(&mut self, ctx: &mut DriverContext<'_>) -> Result<()> {
        ctx.timers.disable(TimerId::Set);
        Ok(())
    }

    fn tune_settings(&self) -> TuneSettings {
        let min_delay = if self.isdbt { 300 } else { 500 };
        TuneSettings {
            min_delay: Duration::from_millis(min_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemodConfig;
    use crate::regs::{Hal, MemoryBus};
    use crate::timer::Timers;
    use dtvdemod_types::{ChipVariant, DeliverySystem, Modulation};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn terrestrial(bandwidth_hz: u32) -> FrontendParams {
        FrontendParams {
            delivery_system: DeliverySystem::Dvbt,
            frequency_hz: 506_000_000,
            symbol_rate: 0,
            modulation: Modulation::QamAuto,
            bandwidth_hz,
        }
    }

    #[test]
    fn test_bandwidth_codes() {
        assert_eq!(bandwidth_code(8_000_000), 0);
        assert_eq!(bandwidth_code(6_000_000), 2);
        assert_eq!(bandwidth_code(1_712_000), 6);
        assert_eq!(bandwidth_code(0), 3);
        assert_eq!(bandwidth_code(9_000_000), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_requires_fsm_and_sync() {
        let bus = Arc::new(MemoryBus::new());
        let hal = Hal::new(bus.clone(), None, ChipVariant::Txl);
        let mut timers = Timers::new();
        timers.set_max(TimerId::Detect, Duration::from_millis(2000));
        let config = DemodConfig::default();
        let abort = CancellationToken::new();
        let mut ctx = DriverContext {
            hal: &hal,
            timers: &mut timers,
            config: &config,
            variant: ChipVariant::Txl,
            abort: &abort,
        };
        let mut driver = DvbtDriver::new(true);

        let outcome = driver
            .tune(&mut ctx, &terrestrial(6_000_000), true, 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, LockStatus::UNSET);
        assert_eq!(bus.peek(AddressSpace::Dvbt, reg::STANDARD), 2);
        assert_eq!(bus.peek(AddressSpace::Dvbt, reg::BANDWIDTH), 2);

        bus.preset(AddressSpace::Dvbt, reg::FSM, 9);
        assert_eq!(driver.read_status(&mut ctx).await.unwrap(), LockStatus::UNSET);

        bus.preset(AddressSpace::Dvbt, reg::SYNC, 1 << 20);
        assert!(driver.read_status(&mut ctx).await.unwrap().is_locked());

        bus.preset(AddressSpace::Dvbt, reg::FSM, 4);
        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(driver.read_status(&mut ctx).await.unwrap(), LockStatus::TIMEOUT);
    }

    #[tokio::test]
    async fn test_metrics_scaling() {
        let bus = Arc::new(MemoryBus::new());
        bus.preset(AddressSpace::Dvbt, reg::SNR, 8 * 27);
        bus.preset(AddressSpace::Dvbt, reg::BER, 0x0012_0034);
        let hal = Hal::new(bus, None, ChipVariant::Txl);
        let mut timers = Timers::new();
        let config = DemodConfig::default();
        let abort = CancellationToken::new();
        let mut ctx = DriverContext {
            hal: &hal,
            timers: &mut timers,
            config: &config,
            variant: ChipVariant::Txl,
            abort: &abort,
        };
        let metrics = DvbtDriver::new(false).read_metrics(&mut ctx).await.unwrap();
        assert_eq!(metrics.snr, 27);
        assert_eq!(metrics.ber, 0x34);
        assert_eq!(metrics.strength, 0);
    }
}
