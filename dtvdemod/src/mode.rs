//! Demodulator mode lifecycle.
//!
//! The [`ModeController`] owns the device context and the active driver.
//! A mode is entered and left only through `enter_mode`, `leave_mode` and
//! `delsys_set`:
//! - enter powers the domain, programs the clocks, initialises the engine
//!   and starts the standard's helper task
//! - leave stops helper tasks, powers everything down and waits the settle time
//! - a failed enter rolls back to Unknown

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use dtvdemod_types::{
    AddressSpace, ChipVariant, DeliverySystem, DemodError, DemodMode, FrontendParams, LockStatus,
    Result, SignalMetrics,
};

use crate::clock::{self, ClockPlan};
use crate::config::DemodConfig;
use crate::dtmb_poll;
use crate::power;
use crate::regs::Hal;
use crate::standard::{
    dvbc, dvbt, ActiveStandard, DriverContext, StandardDriver, TuneOutcome, TuneSettings,
};
use crate::task::SupervisedTask;
use crate::timer::{TimerId, Timers};
use crate::tuning::TuningStateMachine;

/// State of one demodulator device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceContext {
    pub variant: ChipVariant,
    pub active: DemodMode,
    pub last_system: DeliverySystem,
    /// Clock plan programmed for the active mode.
    pub clock_locked: bool,
    pub plan: Option<ClockPlan>,
    pub capture_mapped: bool,
}

impl DeviceContext {
    fn new(variant: ChipVariant) -> Self {
        Self {
            variant,
            active: DemodMode::Unknown,
            last_system: DeliverySystem::Undefined,
            clock_locked: false,
            plan: None,
            capture_mapped: false,
        }
    }
}

pub struct ModeController {
    hal: Arc<Hal>,
    config: DemodConfig,
    ctx: DeviceContext,
    timers: Timers,
    driver: Option<ActiveStandard>,
    tuning: TuningStateMachine,
    params: FrontendParams,
    dtmb_poll: SupervisedTask,
    dvbc_cci: SupervisedTask,
}

impl ModeController {
    pub fn new(hal: Arc<Hal>, config: DemodConfig) -> Self {
        let timers =
            Timers::with_tuner_settle(Duration::from_millis(config.timers.tuner_settle_ms));
        Self {
            hal,
            ctx: DeviceContext::new(config.device.chip),
            config,
            timers,
            driver: None,
            tuning: TuningStateMachine::new(),
            params: FrontendParams::default(),
            dtmb_poll: SupervisedTask::new("dtmb-poll"),
            dvbc_cci: SupervisedTask::new("dvbc-cci"),
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn config(&self) -> &DemodConfig {
        &self.config
    }

    pub fn hal(&self) -> &Arc<Hal> {
        &self.hal
    }

    pub fn params(&self) -> &FrontendParams {
        &self.params
    }

    pub fn set_params(&mut self, params: FrontendParams) {
        self.params = params;
    }

    pub fn helper_running(&self) -> bool {
        self.dtmb_poll.is_running() || self.dvbc_cci.is_running()
    }

    /// True only with clocks programmed for exactly this system.
    pub fn is_active(&self, system: DeliverySystem) -> bool {
        self.ctx.clock_locked && self.ctx.last_system == system
    }

    fn driver_context<'a>(&'a mut self, abort: &'a CancellationToken) -> DriverContext<'a> {
        DriverContext {
            hal: self.hal.as_ref(),
            timers: &mut self.timers,
            config: &self.config,
            variant: self.ctx.variant,
            abort,
        }
    }

    /// Switch to a delivery system, entering its mode when the category changes.
    pub async fn delsys_set(
        &mut self,
        system: DeliverySystem,
        abort: &CancellationToken,
    ) -> Result<()> {
        if system == self.ctx.last_system {
            debug!("[ModeController] {} already set", system);
            return Ok(());
        }

        let variant = self.ctx.variant;
        let mode = system.mode();
        if !variant.supports(system) {
            warn!("[ModeController] {} not supported on {}", system, variant);
            if self.ctx.clock_locked {
                if let Err(e) = self.leave_mode().await {
                    error!("[ModeController] leave before rejecting {} failed: {}", system, e);
                }
            }
            self.release_tuner();
            self.ctx.last_system = DeliverySystem::Undefined;
            return Err(DemodError::Capability { system, variant });
        }

        if mode == self.ctx.active && self.driver.is_some() {
            info!("[ModeController] {} shares mode {}", system, mode);
            self.ctx.last_system = system;
            return Ok(());
        }

        if self.ctx.active != DemodMode::Unknown {
            self.leave_mode().await?;
        }
        self.enter_mode(mode, abort).await?;
        self.ctx.last_system = system;
        Ok(())
    }

    /// Bring up one demodulator category. Idempotent for the active mode;
    /// any other active mode is left first.
    pub async fn enter_mode(&mut self, mode: DemodMode, abort: &CancellationToken) -> Result<()> {
        if mode == self.ctx.active && self.driver.is_some() {
            return Ok(());
        }
        if mode == DemodMode::Unknown {
            return Ok(());
        }
        if !self.ctx.variant.supports_mode(mode) {
            return Err(DemodError::NotInitialized);
        }
        if self.ctx.active != DemodMode::Unknown {
            self.leave_mode().await?;
        }

        info!("[ModeController] enter mode {}", mode);
        match self.try_enter(mode, abort).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("[ModeController] enter mode {} failed: {}", mode, e);
                if let Err(rollback) = self.leave_mode().await {
                    warn!("[ModeController] rollback incomplete: {}", rollback);
                }
                self.release_tuner();
                Err(e)
            }
        }
    }

    async fn try_enter(&mut self, mode: DemodMode, abort: &CancellationToken) -> Result<()> {
        let variant = self.ctx.variant;
        {
            let regs = self.hal.regs().await;
            power::switch(&regs, variant, true)?;
            power::set_agc_pinmux(&regs, true)?;
            power::set_vdac(&regs, true)?;
            power::select_mode(&regs, mode, variant)?;
        }

        self.tuning.reset();
        self.arm_timers(mode);
        let mut driver =
            ActiveStandard::for_mode(mode, &self.config).ok_or(DemodError::NotInitialized)?;
        self.ctx.active = mode;

        let plan = {
            let mut dctx = self.driver_context(abort);
            driver.init(&mut dctx).await?
        };
        self.ctx.plan = Some(plan);
        self.ctx.clock_locked = true;

        if matches!(mode, DemodMode::Dtmb | DemodMode::Dvbt | DemodMode::Isdbt)
            && self.config.device.capture_buffer_bytes > 0
        {
            self.map_capture(mode).await?;
        }
        if mode == DemodMode::Dtmb && variant != ChipVariant::Tl1 {
            let regs = self.hal.regs().await;
            power::set_dtmb_arbiter(&regs, true)?;
        }

        self.start_helpers(&driver);
        self.driver = Some(driver);
        Ok(())
    }

    fn arm_timers(&mut self, mode: DemodMode) {
        let t = &self.config.timers;
        let ms = Duration::from_millis;
        let (detect, set) = match mode {
            DemodMode::Dvbc => (t.dvbc_detect_ms, Some(t.dvbc_set_ms)),
            DemodMode::Dvbt | DemodMode::Isdbt => (t.dvbt_detect_ms, Some(t.dvbt_set_ms)),
            DemodMode::Atsc => (t.atsc_detect_ms, None),
            DemodMode::Dtmb => (t.dtmb_detect_ms, None),
            DemodMode::Unknown => return,
        };
        self.timers.set_max(TimerId::Detect, ms(detect));
        if let Some(set) = set {
            self.timers.set_max(TimerId::Set, ms(set));
        }
    }

    async fn map_capture(&mut self, mode: DemodMode) -> Result<()> {
        let base = self.config.device.capture_base;
        if base == 0 {
            return Err(DemodError::CaptureMemory(format!(
                "no region reserved for {} bytes",
                self.config.device.capture_buffer_bytes
            )));
        }
        let regs = self.hal.regs().await;
        power::set_capture_base(&regs, base)?;
        if mode != DemodMode::Dtmb {
            regs.write(AddressSpace::Dvbt, dvbt::reg::CAPTURE_BASE, base)?;
        }
        self.ctx.capture_mapped = true;
        debug!("[ModeController] capture buffer at 0x{:08x}", base);
        Ok(())
    }

    fn start_helpers(&mut self, driver: &ActiveStandard) {
        match driver {
            ActiveStandard::Dtmb(dtmb) => {
                let hal = self.hal.clone();
                let machine = dtmb.poll_machine();
                self.dtmb_poll
                    .start(move |token| dtmb_poll::run_poll_task(hal, machine, token));
            }
            ActiveStandard::Dvbc(_) if self.config.dvbc.cci_task => {
                let hal = self.hal.clone();
                let period = Duration::from_millis(self.config.dvbc.cci_period_ms);
                self.dvbc_cci
                    .start(move |token| dvbc::run_cci_task(hal, period, token));
            }
            _ => {}
        }
    }

    /// Tear down the active mode and return the device to Unknown.
    pub async fn leave_mode(&mut self) -> Result<()> {
        let mode = self.ctx.active;
        info!("[ModeController] leave mode {}", mode);

        self.dtmb_poll.stop().await;
        self.dvbc_cci.stop().await;
        self.timers.disable_all();
        self.tuning.reset();

        if let Some(mut driver) = self.driver.take() {
            let abort = CancellationToken::new();
            let mut dctx = self.driver_context(&abort);
            if let Err(e) = driver.release(&mut dctx).await {
                warn!("[ModeController] {} release failed: {}", mode, e);
            }
        }

        let result = self.power_down(mode).await;

        self.ctx.active = DemodMode::Unknown;
        self.ctx.last_system = DeliverySystem::Undefined;
        self.ctx.clock_locked = false;
        self.ctx.plan = None;
        self.ctx.capture_mapped = false;

        tokio::time::sleep(self.config.device.leave_settle()).await;
        result
    }

    async fn power_down(&self, mode: DemodMode) -> Result<()> {
        let variant = self.ctx.variant;
        let regs = self.hal.regs().await;
        if mode == DemodMode::Dtmb && variant != ChipVariant::Tl1 {
            power::set_dtmb_arbiter(&regs, false)?;
        }
        if self.ctx.capture_mapped {
            power::set_capture_base(&regs, 0)?;
        }
        clock::power_down(&regs)?;
        power::set_vdac(&regs, false)?;
        power::set_agc_pinmux(&regs, false)?;
        power::select_mode(&regs, DemodMode::Unknown, variant)?;
        power::switch(&regs, variant, false)
    }

    fn release_tuner(&self) {
        if let Some(tuner) = self.hal.tuner() {
            tuner.release();
        }
    }

    pub async fn tune(
        &mut self,
        re_tune: bool,
        mode_flags: u32,
        abort: &CancellationToken,
    ) -> Result<TuneOutcome> {
        let params = self.params;
        let mut dctx = DriverContext {
            hal: self.hal.as_ref(),
            timers: &mut self.timers,
            config: &self.config,
            variant: self.ctx.variant,
            abort,
        };
        self.tuning
            .tune(self.driver.as_mut(), &mut dctx, &params, re_tune, mode_flags)
            .await
    }

    pub async fn read_status(&mut self, abort: &CancellationToken) -> Result<LockStatus> {
        let mut dctx = DriverContext {
            hal: self.hal.as_ref(),
            timers: &mut self.timers,
            config: &self.config,
            variant: self.ctx.variant,
            abort,
        };
        match self.driver.as_mut() {
            Some(driver) => driver.read_status(&mut dctx).await,
            None => Ok(LockStatus::UNSET),
        }
    }

    pub async fn read_metrics(&mut self, abort: &CancellationToken) -> Result<SignalMetrics> {
        let mut dctx = DriverContext {
            hal: self.hal.as_ref(),
            timers: &mut self.timers,
            config: &self.config,
            variant: self.ctx.variant,
            abort,
        };
        match self.driver.as_mut() {
            Some(driver) => driver.read_metrics(&mut dctx).await,
            None => Ok(SignalMetrics::default()),
        }
    }

    pub fn tune_settings(&self) -> Option<TuneSettings> {
        self.driver.as_ref().map(|d| d.tune_settings())
    }

    /// Leave the active mode and release the tuner.
    pub async fn release(&mut self) -> Result<()> {
        let result = if self.ctx.active != DemodMode::Unknown {
            self.leave_mode().await
        } else {
            Ok(())
        };
        self.release_tuner();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{MemoryBus, RegisterAddress, RegisterBus};
    use crate::tuner::FixedTuner;
    use dtvdemod_types::RegisterError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory bus whose writes can be made to fail.
    #[derive(Default)]
    struct FaultyBus {
        inner: MemoryBus,
        fail_writes: AtomicBool,
    }

    impl RegisterBus for FaultyBus {
        fn read32(&self, addr: RegisterAddress) -> std::result::Result<u32, RegisterError> {
            self.inner.read32(addr)
        }

        fn write32(
            &self,
            addr: RegisterAddress,
            value: u32,
        ) -> std::result::Result<(), RegisterError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(RegisterError::Bus("write rejected".into()));
            }
            self.inner.write32(addr, value)
        }
    }

    fn controller(chip: ChipVariant) -> (ModeController, Arc<MemoryBus>, Arc<FixedTuner>) {
        let bus = Arc::new(MemoryBus::new());
        let tuner = Arc::new(FixedTuner::new(-45));
        let hal = Arc::new(Hal::new(bus.clone(), Some(tuner.clone()), chip));
        let mut config = DemodConfig::default();
        config.device.chip = chip;
        (ModeController::new(hal, config), bus, tuner)
    }

    #[tokio::test(start_paused = true)]
    async fn test_delsys_set_twice_writes_once() {
        let (mut mc, bus, _) = controller(ChipVariant::Txlx);
        let abort = CancellationToken::new();
        mc.delsys_set(DeliverySystem::Dvbt, &abort).await.unwrap();
        assert!(mc.is_active(DeliverySystem::Dvbt));
        assert!(bus.write_count() > 0);

        bus.clear_journal();
        mc.delsys_set(DeliverySystem::Dvbt, &abort).await.unwrap();
        assert_eq!(bus.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_then_enter_reproduces_plan() {
        let (mut mc, _, _) = controller(ChipVariant::Txl);
        let abort = CancellationToken::new();
        mc.enter_mode(DemodMode::Dvbc, &abort).await.unwrap();
        let first = mc.context().plan.unwrap();

        mc.leave_mode().await.unwrap();
        assert_eq!(mc.context().active, DemodMode::Unknown);
        assert!(mc.context().plan.is_none());

        mc.enter_mode(DemodMode::Dvbc, &abort).await.unwrap();
        assert_eq!(mc.context().plan, Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_system_leaves_unknown() {
        let (mut mc, _, tuner) = controller(ChipVariant::Txl);
        let abort = CancellationToken::new();
        mc.delsys_set(DeliverySystem::DvbcAnnexA, &abort).await.unwrap();
        assert_eq!(mc.context().active, DemodMode::Dvbc);

        let err = mc
            .delsys_set(DeliverySystem::Atsc, &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, DemodError::Capability { .. }));
        assert_eq!(mc.context().active, DemodMode::Unknown);
        assert_eq!(mc.context().last_system, DeliverySystem::Undefined);
        assert!(!mc.context().clock_locked);
        assert!(tuner.is_released());
        assert!(!mc.helper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_system_cleans_up_after_failed_leave() {
        let bus = Arc::new(FaultyBus::default());
        let tuner = Arc::new(FixedTuner::new(-45));
        let hal = Arc::new(Hal::new(bus.clone(), Some(tuner.clone()), ChipVariant::Txl));
        let mut mc = ModeController::new(hal, DemodConfig::default());
        let abort = CancellationToken::new();
        mc.delsys_set(DeliverySystem::DvbcAnnexA, &abort).await.unwrap();

        bus.fail_writes.store(true, Ordering::SeqCst);
        let err = mc
            .delsys_set(DeliverySystem::Atsc, &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, DemodError::Capability { .. }));
        assert!(tuner.is_released());
        assert_eq!(mc.context().active, DemodMode::Unknown);
        assert_eq!(mc.context().last_system, DeliverySystem::Undefined);
        assert!(!mc.helper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_other_mode_leaves_active_one() {
        let (mut mc, bus, _) = controller(ChipVariant::Txl);
        mc.config.dvbc.cci_task = false;
        let abort = CancellationToken::new();
        mc.enter_mode(DemodMode::Dtmb, &abort).await.unwrap();
        assert!(mc.helper_running());
        assert!(mc.context().capture_mapped);

        mc.enter_mode(DemodMode::Dvbc, &abort).await.unwrap();
        assert_eq!(mc.context().active, DemodMode::Dvbc);
        assert!(!mc.helper_running());
        assert!(!mc.context().capture_mapped);
        assert_eq!(bus.peek(AddressSpace::Top, power::reg::TOP_REGC), 0);
        assert_eq!(bus.peek(AddressSpace::Top, power::reg::TOP_REG4), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_category_records_system_only() {
        let (mut mc, bus, _) = controller(ChipVariant::Txl);
        let abort = CancellationToken::new();
        mc.delsys_set(DeliverySystem::DvbcAnnexA, &abort).await.unwrap();
        bus.clear_journal();

        mc.delsys_set(DeliverySystem::DvbcAnnexC, &abort).await.unwrap();
        assert_eq!(bus.write_count(), 0);
        assert!(mc.is_active(DeliverySystem::DvbcAnnexC));
        assert!(!mc.is_active(DeliverySystem::DvbcAnnexA));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dtmb_poll_task_follows_mode() {
        let (mut mc, bus, _) = controller(ChipVariant::Txl);
        let abort = CancellationToken::new();
        mc.delsys_set(DeliverySystem::Dtmb, &abort).await.unwrap();
        assert!(mc.helper_running());
        assert_eq!(bus.peek(AddressSpace::Top, power::reg::TOP_REGC), 0x8);
        assert!(mc.context().capture_mapped);

        mc.delsys_set(DeliverySystem::DvbcAnnexA, &abort).await.unwrap();
        assert_eq!(mc.context().active, DemodMode::Dvbc);
        assert_eq!(bus.peek(AddressSpace::Top, power::reg::TOP_REGC), 0);
        assert!(!mc.context().capture_mapped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_rolls_back() {
        let (mut mc, _, tuner) = controller(ChipVariant::Txl);
        mc.config.device.capture_base = 0;
        let abort = CancellationToken::new();
        let err = mc
            .delsys_set(DeliverySystem::Dtmb, &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, DemodError::CaptureMemory(_)));
        assert_eq!(mc.context().active, DemodMode::Unknown);
        assert!(!mc.context().clock_locked);
        assert!(!mc.helper_running());
        assert!(tuner.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tune_without_mode() {
        let (mut mc, _, _) = controller(ChipVariant::Txl);
        let abort = CancellationToken::new();
        let outcome = mc.tune(true, 0, &abort).await.unwrap();
        assert_eq!(outcome.status, LockStatus::UNSET);
        assert_eq!(outcome.delay, mc.config().device.unknown_mode_delay());
        assert!(mc.tune_settings().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_waits_settle_time() {
        let (mut mc, _, _) = controller(ChipVariant::Txl);
        let abort = CancellationToken::new();
        mc.enter_mode(DemodMode::Dvbc, &abort).await.unwrap();
        let start = tokio::time::Instant::now();
        mc.leave_mode().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
