//! DVB-C (Annex A/C) driver.
//!
//! - Out-of-range symbol rate or frequency is clamped and reported, never fatal
//! - QAM128 needs the ADC-driven clock pair; a crystal-mode engine is re-initialised
//! - Automatic symbol-rate tracking suppresses re-entry for the same frequency
//!   until the engine has locked once
//! - A helper task watches the CCI indicator and toggles the notch filter

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use dtvdemod_types::{
    AddressSpace, ConfigurationError, DemodMode, EngineVersion, FrontendParams, LockStatus,
    Modulation, Result, SignalMetrics,
};

use crate::clock::{self, ClockPlan, DvbcClockMode};
use crate::config::DemodConfig;
use crate::regs::{Hal, Regs};
use crate::timer::TimerId;
use crate::tuner::strength_percent;

use super::{
    poll_with_reissue, ChannelOutcome, DriverContext, StandardDriver, TuneOutcome, TuneSettings,
};

/// QAM engine registers (word offsets in the DVB-C block).
pub mod reg {
    pub const STATUS: u32 = 0x00;
    /// Constellation select, bits 2:0.
    pub const MODE: u32 = 0x02;
    pub const SNR: u32 = 0x05;
    /// Channel status, bit 0 is lock.
    pub const CH_STATUS: u32 = 0x06;
    /// Global control: bit 0 soft enable, bit 4 FSM enable.
    pub const GCTL0: u32 = 0x07;
    pub const SYMBOL_RATE: u32 = 0x0d;
    pub const CH_FREQ: u32 = 0x0e;
    pub const AUTO_SYMTRACK: u32 = 0x0c;
    pub const BER: u32 = 0x33;
    /// Acquisition FSM state, bits 3:0.
    pub const FSM_STATUS: u32 = 0x31;
    pub const IRQ_MASK: u32 = 0x34;
    pub const CCI_STATUS: u32 = 0x36;
    pub const CCI_NOTCH: u32 = 0x37;
    pub const EXT_CTRL: u32 = 0x7b;
}

const GCTL_SOFT_ENABLE: u32 = 1 << 0;
const GCTL_FSM_ENABLE: u32 = 1 << 4;
const GCTL_DEFAULT: u32 = 0x0000_0f00;
const CCI_DETECTED: u32 = 1 << 0;
const NOTCH_ENABLE: u32 = 1 << 0;

pub const SYMBOL_RATE_MIN_KSYM: u32 = 1000;
pub const SYMBOL_RATE_MAX_KSYM: u32 = 7000;
pub const SYMBOL_RATE_DEFAULT_KSYM: u32 = 5361;
pub const FREQUENCY_MIN_KHZ: u32 = 1000;
pub const FREQUENCY_MAX_KHZ: u32 = 900_000;
pub const FREQUENCY_DEFAULT_KHZ: u32 = 474_000;

/// Engine constellation code.
pub fn qam_code(modulation: Modulation) -> u32 {
    match modulation {
        Modulation::Qam16 => 0,
        Modulation::Qam32 => 1,
        Modulation::Qam64 => 2,
        Modulation::Qam128 => 3,
        Modulation::Qam256 => 4,
        Modulation::Vsb8 => 5,
        Modulation::QamAuto => 6,
        _ => 2,
    }
}

/// Channel as programmed into the QAM engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DvbcChannel {
    pub frequency_khz: u32,
    pub symbol_rate_ksym: u32,
    pub qam: u32,
}

impl DvbcChannel {
    /// Derive the engine channel, clamping out-of-range values.
    pub fn clamped(params: &FrontendParams) -> (Self, Vec<ConfigurationError>) {
        let mut clamped = Vec::new();

        let mut symbol_rate_ksym = params.symbol_rate / 1000;
        if !(SYMBOL_RATE_MIN_KSYM..=SYMBOL_RATE_MAX_KSYM).contains(&symbol_rate_ksym) {
            clamped.push(ConfigurationError {
                field: "symbol_rate_ksym",
                requested: symbol_rate_ksym,
                applied: SYMBOL_RATE_DEFAULT_KSYM,
            });
            symbol_rate_ksym = SYMBOL_RATE_DEFAULT_KSYM;
        }

        let mut frequency_khz = params.frequency_hz / 1000;
        if !(FREQUENCY_MIN_KHZ..=FREQUENCY_MAX_KHZ).contains(&frequency_khz) {
            clamped.push(ConfigurationError {
                field: "frequency_khz",
                requested: frequency_khz,
                applied: FREQUENCY_DEFAULT_KHZ,
            });
            frequency_khz = FREQUENCY_DEFAULT_KHZ;
        }

        let channel = Self {
            frequency_khz,
            symbol_rate_ksym,
            qam: qam_code(params.modulation),
        };
        (channel, clamped)
    }
}

/// Reset the QAM engine and program a channel.
///
/// Shared with the J.83B path of the ATSC driver.
pub fn program(regs: &Regs<'_>, channel: &DvbcChannel) -> Result<()> {
    regs.write(AddressSpace::Dvbc, reg::IRQ_MASK, 0)?;
    regs.modify(AddressSpace::Dvbc, reg::GCTL0, GCTL_FSM_ENABLE, 0)?;
    regs.modify(AddressSpace::Dvbc, reg::GCTL0, GCTL_SOFT_ENABLE, 0)?;
    regs.modify(AddressSpace::Dvbc, reg::GCTL0, GCTL_SOFT_ENABLE, GCTL_SOFT_ENABLE)?;
    regs.write(AddressSpace::Dvbc, reg::STATUS, 0)?;
    regs.write(AddressSpace::Dvbc, reg::GCTL0, GCTL_DEFAULT)?;
    regs.modify(AddressSpace::Dvbc, reg::MODE, 0x7, channel.qam)?;
    regs.write(AddressSpace::Dvbc, reg::SYMBOL_RATE, channel.symbol_rate_ksym)?;
    regs.write(AddressSpace::Dvbc, reg::CH_FREQ, channel.frequency_khz)?;
    regs.modify(AddressSpace::Dvbc, reg::GCTL0, GCTL_FSM_ENABLE, GCTL_FSM_ENABLE)?;
    debug!(
        "[DVBC] programmed {} kHz, {} ksym/s, qam {}",
        channel.frequency_khz, channel.symbol_rate_ksym, channel.qam
    );
    Ok(())
}

pub fn is_locked(regs: &Regs<'_>) -> Result<bool> {
    Ok(regs.read(AddressSpace::Dvbc, reg::CH_STATUS)? & 0x1 != 0)
}

/// Acquisition FSM state; 3 and above means a carrier is present.
pub fn fsm_status(regs: &Regs<'_>) -> Result<u32> {
    Ok(regs.read(AddressSpace::Dvbc, reg::FSM_STATUS)? & 0xf)
}

/// SNR in dB.
pub fn snr_db(regs: &Regs<'_>) -> Result<u16> {
    Ok((regs.read(AddressSpace::Dvbc, reg::SNR)? / 100) as u16)
}

pub struct DvbcDriver {
    clock_mode: DvbcClockMode,
    auto_symbol_rate: bool,
    /// Re-entry allowed even for the last frequency.
    trigger: bool,
    /// Symbol-rate tracking enabled for the current channel.
    tracking: bool,
    last_frequency_khz: Option<u32>,
}

impl DvbcDriver {
    pub fn new(config: &DemodConfig) -> Self {
        Self {
            clock_mode: config.device.dvbc_clock,
            auto_symbol_rate: config.dvbc.auto_symbol_rate,
            trigger: true,
            tracking: false,
            last_frequency_khz: None,
        }
    }

    pub fn clock_mode(&self) -> DvbcClockMode {
        self.clock_mode
    }

    async fn configure_clock(&mut self, ctx: &mut DriverContext<'_>) -> Result<ClockPlan> {
        let (adc_khz, sys_khz) =
            clock::demod_clock_pair(DemodMode::Dvbc, ctx.variant, self.clock_mode);
        let regs = ctx.hal.regs().await;
        clock::configure(&regs, ctx.variant, adc_khz, sys_khz)
    }
}

impl StandardDriver for DvbcDriver {
    fn mode(&self) -> DemodMode {
        DemodMode::Dvbc
    }

    async fn init(&mut self, ctx: &mut DriverContext<'_>) -> Result<ClockPlan> {
        let plan = self.configure_clock(ctx).await?;
        self.last_frequency_khz = None;
        info!("[DVBC] init, {:?} clock", self.clock_mode);
        Ok(plan)
    }

    async fn set_channel(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
    ) -> Result<ChannelOutcome> {
        let (channel, clamped) = DvbcChannel::clamped(params);
        for e in &clamped {
            warn!("[DVBC] {}", e);
        }

        if channel.qam == qam_code(Modulation::Qam128) && self.clock_mode != DvbcClockMode::Adc {
            info!("[DVBC] QAM128 needs the ADC clock, re-initialising");
            self.clock_mode = DvbcClockMode::Adc;
            self.configure_clock(ctx).await?;
        }

        if self.auto_symbol_rate
            && !self.trigger
            && self.last_frequency_khz == Some(channel.frequency_khz)
        {
            debug!("[DVBC] auto symbol rate tracking in progress, skipping");
            return Ok(ChannelOutcome::Suppressed);
        }
        self.trigger = false;

        let mut tuned = *params;
        tuned.frequency_hz = channel.frequency_khz * 1000;
        tuned.symbol_rate = channel.symbol_rate_ksym * 1000;
        ctx.tune_tuner(&tuned);

        {
            let regs = ctx.hal.regs().await;
            program(&regs, &channel)?;
            if ctx.variant.capabilities().dvbc == EngineVersion::V3 {
                regs.write(AddressSpace::Dvbc, reg::EXT_CTRL, 0x1)?;
            }
        }
        self.tracking = false;
        self.last_frequency_khz = Some(channel.frequency_khz);

        if clamped.is_empty() {
            Ok(ChannelOutcome::Applied)
        } else {
            Ok(ChannelOutcome::Clamped(clamped))
        }
    }

    async fn read_status(&mut self, ctx: &mut DriverContext<'_>) -> Result<LockStatus> {
        if !ctx.timers.tuner_not_enough() && ctx.tuner_below(ctx.config.dvbc.min_strength_dbm) {
            return Ok(LockStatus::TIMEOUT);
        }

        let locked = {
            let regs = ctx.hal.regs().await;
            let locked = is_locked(&regs)?;
            if locked && self.auto_symbol_rate && !self.tracking {
                regs.write(AddressSpace::Dvbc, reg::AUTO_SYMTRACK, 0x1)?;
                self.tracking = true;
                debug!("[DVBC] locked, symbol rate tracking on");
            }
            locked
        };
        if locked {
            self.trigger = true;
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
            ber: regs.read(AddressSpace::Dvbc, reg::BER)?,
            snr: snr_db(&regs)?,
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
        let delay = Duration::from_millis(ctx.config.dvbc.tune_delay_ms);
        let status = if re_tune {
            self.set_channel(ctx, params).await?;
            ctx.timers.begin(TimerId::Detect);
            self.read_status(ctx).await?
        } else {
            poll_with_reissue(self, ctx, params, mode_flags).await?
        };
        Ok(TuneOutcome { delay, status })
    }

    async fn release(&mut self, ctx: &mut DriverContext<'_>) -> Result<()> {
        ctx.timers.disable(TimerId::Set);
        self.last_frequency_khz = None;
        self.tracking = false;
        Ok(())
    }

    fn tune_settings(&self) -> TuneSettings {
        TuneSettings {
            min_delay: Duration::from_millis(300),
        }
    }
}

/// Body of the CCI helper task.
///
/// Samples the CCI indicator every `period` and switches the notch filter
/// when the indicator changes.
pub async fn run_cci_task(hal: Arc<Hal>, period: Duration, token: CancellationToken) {
    let mut notch_on = false;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        let regs = hal.regs().await;
        let detected = match regs.read(AddressSpace::Dvbc, reg::CCI_STATUS) {
            Ok(value) => value & CCI_DETECTED != 0,
            Err(e) => {
                warn!("[DVBC] cci sample failed: {}", e);
                continue;
            }
        };
        if detected == notch_on {
            continue;
        }
        let bits = if detected { NOTCH_ENABLE } else { 0 };
        match regs.modify(AddressSpace::Dvbc, reg::CCI_NOTCH, NOTCH_ENABLE, bits) {
            Ok(()) => {
                notch_on = detected;
                debug!("[DVBC] cci notch {}", if detected { "on" } else { "off" });
            }
            Err(e) => warn!("[DVBC] cci notch update failed: {}", e),
        }
    }
    debug!("[DVBC] cci task exit");
}
