//! ATSC driver: 8-VSB plus J.83B cable on the QAM path.
//!
//! VSB acquisition is driven by [`AtscSearch`]; J.83B reuses the DVB-C
//! engine programming with the fixed Annex B symbol rates.

use std::time::Duration;

use log::{debug, info};

use dtvdemod_types::{
    AddressSpace, ChipVariant, DeliverySystem, DemodMode, FrontendParams, LockStatus, Modulation,
    Result, SignalMetrics,
};

use crate::atsc_search::{self, fsm, AcquireOutcome, AtscSearch};
use crate::clock::{self, ClockPlan, DvbcClockMode};
use crate::power;
use crate::timer::TimerId;
use crate::tuner::strength_percent;

use super::dvbc::{self, DvbcChannel};
use super::snr::atsc_snr_db10;
use super::{ChannelOutcome, DriverContext, StandardDriver, TuneOutcome, TuneSettings};

/// Demod clock gate words for the two paths.
const CLK_QAM: u32 = 0x502;
const CLK_VSB: u32 = 0x507;

const J83B_QAM64_KSYM: u32 = 5057;
const J83B_QAM256_KSYM: u32 = 5361;

/// DVB-C FSM level meaning a carrier is present.
const QAM_SIGNAL: u32 = 3;

/// Frequency shifts, in kHz, tried for an unlocked J.83B channel.
///
/// Channels 5 and 6 (79 and 85 MHz) move by +2 MHz on the IRC plan;
/// every channel moves by -1.25 MHz on the HRC plan.
pub fn frequency_plan_offsets(frequency_hz: u32) -> &'static [i32] {
    match frequency_hz {
        79_000_000 | 85_000_000 => &[2000, -1250],
        _ => &[-1250],
    }
}

fn is_j83b(params: &FrontendParams) -> bool {
    params.delivery_system == DeliverySystem::DvbcAnnexB || params.modulation.is_qam()
}

fn j83b_channel(params: &FrontendParams, shift_khz: i32) -> DvbcChannel {
    let symbol_rate_ksym = if params.modulation == Modulation::Qam64 {
        J83B_QAM64_KSYM
    } else {
        J83B_QAM256_KSYM
    };
    let frequency_khz = (i64::from(params.frequency_hz / 1000) + i64::from(shift_khz)).max(0) as u32;
    DvbcChannel {
        frequency_khz,
        symbol_rate_ksym,
        qam: dvbc::qam_code(params.modulation),
    }
}

pub struct AtscDriver {
    search: AtscSearch,
    /// Current channel is J.83B.
    qam: bool,
    /// Lock seen on the previous VSB status read.
    last_lock: bool,
    params: Option<FrontendParams>,
}

impl Default for AtscDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AtscDriver {
    pub fn new() -> Self {
        Self {
            search: AtscSearch::new(),
            qam: false,
            last_lock: false,
            params: None,
        }
    }

    pub fn is_qam(&self) -> bool {
        self.qam
    }

    async fn program_qam(&self, ctx: &DriverContext<'_>, channel: &DvbcChannel) -> Result<()> {
        let regs = ctx.hal.regs().await;
        regs.write(AddressSpace::Hiu, clock::reg::DEMOD_CLK_CNTL, CLK_QAM)?;
        power::select_mode(&regs, DemodMode::Dvbc, ctx.variant)?;
        dvbc::program(&regs, channel)
    }

    async fn qam_locked(&self, ctx: &DriverContext<'_>) -> Result<bool> {
        let regs = ctx.hal.regs().await;
        dvbc::is_locked(&regs)
    }

    /// Wait briefly for the QAM engine to report a carrier.
    async fn qam_signal_present(&self, ctx: &DriverContext<'_>) -> Result<bool> {
        let config = &ctx.config.atsc;
        for _ in 0..config.j83b_signal_checks {
            ctx.sleep(Duration::from_millis(config.j83b_signal_check_ms))
                .await?;
            let status = {
                let regs = ctx.hal.regs().await;
                dvbc::fsm_status(&regs)?
            };
            if status >= QAM_SIGNAL {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Tl1 reads unset while the detect window is open, then times out.
    async fn vsb_status(&mut self, ctx: &mut DriverContext<'_>) -> Result<LockStatus> {
        let state = atsc_search::read_fsm(ctx).await?;
        let locked = state >= fsm::VSB_LOCK || (self.last_lock && state >= fsm::ATSC_LOCK);
        if locked != self.last_lock {
            debug!("[ATSC] fsm 0x{:x}, lock {}", state, locked);
        }
        self.last_lock = locked;
        if locked {
            return Ok(LockStatus::LOCKED);
        }
        self.search.clear_profile();
        if ctx.variant == ChipVariant::Tl1 && ctx.timers.not_enough(TimerId::Detect) {
            return Ok(LockStatus::UNSET);
        }
        ctx.timers.disable(TimerId::Detect);
        Ok(LockStatus::TIMEOUT)
    }

    async fn vsb_detect_first(&mut self, ctx: &mut DriverContext<'_>) -> Result<LockStatus> {
        let config = &ctx.config.atsc;
        ctx.sleep(Duration::from_millis(config.tuner_delay_ms)).await?;
        if ctx.tuner_below(config.vsb_min_strength_dbm) {
            info!("[ATSC] tuner power too low, no signal");
            return Ok(LockStatus::TIMEOUT);
        }

        for _ in 0..config.vsb_detect_retries {
            ctx.check_abort()?;
            if self.search.acquire(ctx).await? == AcquireOutcome::CfoFail {
                debug!("[ATSC] no carrier found");
            }
            if self.vsb_status(ctx).await?.is_locked() {
                return Ok(LockStatus::LOCKED);
            }
            if atsc_search::read_fsm(ctx).await? < fsm::SIGNAL {
                return Ok(LockStatus::TIMEOUT);
            }
        }
        Ok(LockStatus::UNSET)
    }

    async fn j83b_detect_first(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
    ) -> Result<LockStatus> {
        let config = &ctx.config.atsc;
        if ctx.tuner_below(config.j83b_min_strength_dbm) {
            info!("[J83B] tuner power too low, no signal");
            return Ok(LockStatus::TIMEOUT);
        }

        let mut status = LockStatus::TIMEOUT;
        for _ in 0..config.j83b_detect_retries {
            ctx.check_abort()?;
            if self.qam_locked(ctx).await? {
                status = LockStatus::LOCKED;
                break;
            }
            if !self.qam_signal_present(ctx).await? {
                break;
            }
            ctx.sleep(Duration::from_millis(config.j83b_retry_interval_ms))
                .await?;
        }

        if !status.is_locked() && config.auto_search_std {
            status = self.search_frequency_plans(ctx, params).await?;
        }
        Ok(status)
    }

    async fn search_frequency_plans(
        &mut self,
        ctx: &DriverContext<'_>,
        params: &FrontendParams,
    ) -> Result<LockStatus> {
        let timeout = Duration::from_millis(ctx.config.atsc.std_lock_timeout_ms);
        for &shift in frequency_plan_offsets(params.frequency_hz) {
            ctx.check_abort()?;
            let channel = j83b_channel(params, shift);
            self.program_qam(ctx, &channel).await?;
            ctx.sleep(timeout).await?;
            if self.qam_locked(ctx).await? {
                info!("[J83B] locked on plan shift {:+} kHz", shift);
                return Ok(LockStatus::LOCKED);
            }
        }
        self.program_qam(ctx, &j83b_channel(params, 0)).await?;
        Ok(LockStatus::TIMEOUT)
    }

    async fn j83b_poll(&mut self, ctx: &DriverContext<'_>) -> Result<LockStatus> {
        if ctx.tuner_below(ctx.config.atsc.j83b_min_strength_dbm) {
            debug!("[J83B] tuner power too low, no signal");
            return Ok(LockStatus::TIMEOUT);
        }
        if self.qam_locked(ctx).await? {
            return Ok(LockStatus::LOCKED);
        }
        if self.qam_signal_present(ctx).await? {
            Ok(LockStatus::UNSET)
        } else {
            Ok(LockStatus::TIMEOUT)
        }
    }
}

impl StandardDriver for AtscDriver {
    fn mode(&self) -> DemodMode {
        DemodMode::Atsc
    }

    async fn init(&mut self, ctx: &mut DriverContext<'_>) -> Result<ClockPlan> {
        let (adc_khz, sys_khz) =
            clock::demod_clock_pair(DemodMode::Atsc, ctx.variant, DvbcClockMode::Adc);
        let plan = {
            let regs = ctx.hal.regs().await;
            clock::configure(&regs, ctx.variant, adc_khz, sys_khz)?
        };
        self.search.restart(ctx).await?;
        self.qam = false;
        self.last_lock = false;
        info!("[ATSC] init");
        Ok(plan)
    }

    async fn set_channel(
        &mut self,
        ctx: &mut DriverContext<'_>,
        params: &FrontendParams,
    ) -> Result<ChannelOutcome> {
        ctx.tune_tuner(params);
        self.qam = is_j83b(params);
        self.last_lock = false;
        self.params = Some(*params);
        self.search.new_channel();

        if self.qam {
            let channel = j83b_channel(params, 0);
            debug!(
                "[J83B] {} kHz at {} ksym/s",
                channel.frequency_khz, channel.symbol_rate_ksym
            );
            self.program_qam(ctx, &channel).await?;
        } else {
            {
                let regs = ctx.hal.regs().await;
                regs.write(AddressSpace::Hiu, clock::reg::DEMOD_CLK_CNTL, CLK_VSB)?;
                power::select_mode(&regs, DemodMode::Atsc, ctx.variant)?;
            }
            self.search.restart(ctx).await?;
            if ctx.variant == ChipVariant::Tl1 {
                ctx.timers.begin(TimerId::Detect);
            }
        }
        Ok(ChannelOutcome::Applied)
    }

    async fn read_status(&mut self, ctx: &mut DriverContext<'_>) -> Result<LockStatus> {
        if self.qam {
            let locked = self.qam_locked(ctx).await?;
            return Ok(if locked {
                LockStatus::LOCKED
            } else {
                LockStatus::UNSET
            });
        }
        self.vsb_status(ctx).await
    }

    async fn read_metrics(&mut self, ctx: &mut DriverContext<'_>) -> Result<SignalMetrics> {
        let strength = strength_percent(ctx.tuner_strength());
        if self.qam {
            let regs = ctx.hal.regs().await;
            return Ok(SignalMetrics {
                ber: regs.read(AddressSpace::Dvbc, dvbc::reg::BER)?,
                snr: dvbc::snr_db(&regs)?,
                strength,
                ucblocks: 0,
            });
        }
        let ber = {
            let regs = ctx.hal.regs().await;
            regs.read(AddressSpace::Atsc, atsc_search::reg::FSM)? & 0xffff
        };
        let snr = atsc_snr_db10(atsc_search::read_snr_raw(ctx).await?) / 10;
        Ok(SignalMetrics {
            ber,
            snr,
            strength,
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
        let delay = Duration::from_millis(ctx.config.atsc.tune_delay_ms);
        let status = if re_tune {
            self.set_channel(ctx, params).await?;
            if self.qam {
                self.j83b_detect_first(ctx, params).await?
            } else {
                self.vsb_detect_first(ctx).await?
            }
        } else if self.qam {
            self.j83b_poll(ctx).await?
        } else {
            self.search.acquire(ctx).await?;
            self.vsb_status(ctx).await?
        };
        Ok(TuneOutcome { delay, status })
    }

    async fn release(&mut self, _ctx: &mut DriverContext<'_>) -> Result<()> {
        self.search.clear_profile();
        self.last_lock = false;
        self.params = None;
        Ok(())
    }

    fn tune_settings(&self) -> TuneSettings {
        TuneSettings {
            min_delay: Duration::from_millis(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemodConfig;
    use crate::regs::{Hal, MemoryBus};
    use crate::timer::Timers;
    use crate::tuner::FixedTuner;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct Rig {
        bus: Arc<MemoryBus>,
        tuner: Arc<FixedTuner>,
        hal: Hal,
        timers: Timers,
        config: DemodConfig,
        variant: ChipVariant,
        abort: CancellationToken,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_variant(ChipVariant::Txlx)
        }

        fn with_variant(variant: ChipVariant) -> Self {
            let bus = Arc::new(MemoryBus::new());
            let tuner = Arc::new(FixedTuner::new(-50));
            let hal = Hal::new(bus.clone(), Some(tuner.clone()), variant);
            let config = DemodConfig::default();
            let mut timers = Timers::new();
            timers.set_max(
                TimerId::Detect,
                Duration::from_millis(config.timers.atsc_detect_ms),
            );
            Self {
                bus,
                tuner,
                hal,
                timers,
                config,
                variant,
                abort: CancellationToken::new(),
            }
        }

        fn ctx(&mut self) -> DriverContext<'_> {
            DriverContext {
                hal: &self.hal,
                timers: &mut self.timers,
                config: &self.config,
                variant: self.variant,
                abort: &self.abort,
            }
        }
    }

    fn vsb() -> FrontendParams {
        FrontendParams {
            delivery_system: DeliverySystem::Atsc,
            frequency_hz: 527_000_000,
            symbol_rate: 0,
            modulation: Modulation::Vsb8,
            bandwidth_hz: 6_000_000,
        }
    }

    fn j83b(modulation: Modulation) -> FrontendParams {
        FrontendParams {
            delivery_system: DeliverySystem::DvbcAnnexB,
            frequency_hz: 79_000_000,
            symbol_rate: 0,
            modulation,
            bandwidth_hz: 0,
        }
    }

    #[test]
    fn test_frequency_plans() {
        assert_eq!(frequency_plan_offsets(79_000_000), &[2000, -1250]);
        assert_eq!(frequency_plan_offsets(85_000_000), &[2000, -1250]);
        assert_eq!(frequency_plan_offsets(57_000_000), &[-1250]);
    }

    #[tokio::test]
    async fn test_j83b_symbol_rates() {
        let mut rig = Rig::new();
        let mut driver = AtscDriver::new();
        driver
            .set_channel(&mut rig.ctx(), &j83b(Modulation::Qam64))
            .await
            .unwrap();
        assert!(driver.is_qam());
        assert_eq!(rig.bus.peek(AddressSpace::Dvbc, dvbc::reg::SYMBOL_RATE), 5057);

        driver
            .set_channel(&mut rig.ctx(), &j83b(Modulation::Qam256))
            .await
            .unwrap();
        assert_eq!(rig.bus.peek(AddressSpace::Dvbc, dvbc::reg::SYMBOL_RATE), 5361);
        assert_eq!(rig.bus.peek(AddressSpace::Hiu, clock::reg::DEMOD_CLK_CNTL), CLK_QAM);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vsb_hysteresis() {
        let mut rig = Rig::new();
        let mut driver = AtscDriver::new();
        driver.set_channel(&mut rig.ctx(), &vsb()).await.unwrap();

        rig.bus.preset(AddressSpace::Atsc, atsc_search::reg::FSM, fsm::ATSC_LOCK);
        assert_eq!(
            driver.read_status(&mut rig.ctx()).await.unwrap(),
            LockStatus::TIMEOUT
        );

        rig.bus.preset(AddressSpace::Atsc, atsc_search::reg::FSM, fsm::VSB_LOCK);
        assert!(driver.read_status(&mut rig.ctx()).await.unwrap().is_locked());

        rig.bus.preset(AddressSpace::Atsc, atsc_search::reg::FSM, fsm::ATSC_LOCK);
        assert!(driver.read_status(&mut rig.ctx()).await.unwrap().is_locked());

        rig.bus.preset(AddressSpace::Atsc, atsc_search::reg::FSM, fsm::SYNC);
        assert_eq!(
            driver.read_status(&mut rig.ctx()).await.unwrap(),
            LockStatus::TIMEOUT
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_vsb_weak_tuner_times_out_without_search() {
        let mut rig = Rig::new();
        rig.tuner.set_strength(-90);
        let mut driver = AtscDriver::new();
        let outcome = driver.tune(&mut rig.ctx(), &vsb(), true, 0).await.unwrap();
        assert_eq!(outcome.status, LockStatus::TIMEOUT);
        assert_eq!(outcome.delay, Duration::from_millis(500));
        assert!(rig
            .bus
            .writes_to(AddressSpace::Atsc, atsc_search::reg::CCI_TRIGGER)
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vsb_no_signal_times_out() {
        let mut rig = Rig::new();
        rig.config.atsc.cci_enable = false;
        let mut driver = AtscDriver::new();
        let outcome = driver.tune(&mut rig.ctx(), &vsb(), true, 0).await.unwrap();
        assert_eq!(outcome.status, LockStatus::TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tl1_vsb_times_out_after_detect_window() {
        let mut rig = Rig::with_variant(ChipVariant::Tl1);
        rig.config.atsc.cci_enable = false;
        let mut driver = AtscDriver::new();
        driver.set_channel(&mut rig.ctx(), &vsb()).await.unwrap();
        assert!(rig.timers.is_enabled(TimerId::Detect));
        assert_eq!(
            driver.read_status(&mut rig.ctx()).await.unwrap(),
            LockStatus::UNSET
        );

        // no carrier: every poll runs a failing search
        let start = tokio::time::Instant::now();
        let mut statuses = Vec::new();
        while start.elapsed() < Duration::from_millis(6000) {
            let outcome = driver.tune(&mut rig.ctx(), &vsb(), false, 0).await.unwrap();
            statuses.push(outcome.status);
        }
        assert_eq!(statuses.first(), Some(&LockStatus::UNSET));
        assert_eq!(statuses.last(), Some(&LockStatus::TIMEOUT));
        assert!(!statuses.iter().any(|s| s.is_locked()));
        assert!(!rig.timers.is_enabled(TimerId::Detect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_chips_time_out_without_window() {
        let mut rig = Rig::new();
        let mut driver = AtscDriver::new();
        driver.set_channel(&mut rig.ctx(), &vsb()).await.unwrap();
        assert!(!rig.timers.is_enabled(TimerId::Detect));
        assert_eq!(
            driver.read_status(&mut rig.ctx()).await.unwrap(),
            LockStatus::TIMEOUT
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_j83b_first_detect() {
        let mut rig = Rig::new();
        let mut driver = AtscDriver::new();

        // carrier but no lock on every pass
        rig.bus.preset(AddressSpace::Dvbc, dvbc::reg::FSM_STATUS, 5);
        let outcome = driver
            .tune(&mut rig.ctx(), &j83b(Modulation::Qam256), true, 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, LockStatus::TIMEOUT);

        rig.bus.preset(AddressSpace::Dvbc, dvbc::reg::CH_STATUS, 1);
        let outcome = driver
            .tune(&mut rig.ctx(), &j83b(Modulation::Qam256), true, 0)
            .await
            .unwrap();
        assert!(outcome.status.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_j83b_weak_tuner() {
        let mut rig = Rig::new();
        rig.tuner.set_strength(-80);
        let mut driver = AtscDriver::new();
        let outcome = driver
            .tune(&mut rig.ctx(), &j83b(Modulation::Qam64), true, 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, LockStatus::TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_j83b_poll_gated_on_tuner_power() {
        let mut rig = Rig::new();
        let mut driver = AtscDriver::new();
        driver
            .set_channel(&mut rig.ctx(), &j83b(Modulation::Qam64))
            .await
            .unwrap();
        // carrier but no lock
        rig.bus.preset(AddressSpace::Dvbc, dvbc::reg::FSM_STATUS, 5);
        let outcome = driver
            .tune(&mut rig.ctx(), &j83b(Modulation::Qam64), false, 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, LockStatus::UNSET);

        rig.tuner.set_strength(-80);
        rig.bus.preset(AddressSpace::Dvbc, dvbc::reg::CH_STATUS, 1);
        let outcome = driver
            .tune(&mut rig.ctx(), &j83b(Modulation::Qam64), false, 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, LockStatus::TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_j83b_frequency_plan_retry() {
        let mut rig = Rig::new();
        rig.config.atsc.auto_search_std = true;
        let mut driver = AtscDriver::new();
        let outcome = driver
            .tune(&mut rig.ctx(), &j83b(Modulation::Qam64), true, 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, LockStatus::TIMEOUT);
        assert_eq!(
            rig.bus.writes_to(AddressSpace::Dvbc, dvbc::reg::CH_FREQ),
            vec![79_000, 81_000, 77_750, 79_000]
        );
    }

    #[tokio::test]
    async fn test_vsb_metrics() {
        let mut rig = Rig::new();
        rig.bus.preset(AddressSpace::Atsc, atsc_search::reg::FSM, 0x1_0079);
        rig.bus.preset(AddressSpace::Atsc, atsc_search::reg::SNR_HI, 0);
        rig.bus.preset(AddressSpace::Atsc, atsc_search::reg::SNR_LO, 54);
        let mut driver = AtscDriver::new();
        let metrics = driver.read_metrics(&mut rig.ctx()).await.unwrap();
        assert_eq!(metrics.ber, 0x79);
        assert_eq!(metrics.snr, 26);
        assert_eq!(metrics.strength, 50);
    }
}
