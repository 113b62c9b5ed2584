//! Control surface exposed to the frontend core.
//!
//! Every call takes the controller lock. Mode-changing calls first cancel
//! the current abort token, so a search holding the lock gives up at its
//! next poll and the mode change proceeds.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use dtvdemod_types::{DeliverySystem, DemodError, FrontendParams, LockStatus, Result};

use crate::config::DemodConfig;
use crate::mode::{DeviceContext, ModeController};
use crate::regs::Hal;
use crate::standard::{TuneOutcome, TuneSettings};

pub struct Frontend {
    controller: Mutex<ModeController>,
    abort: parking_lot::Mutex<CancellationToken>,
}

impl Frontend {
    pub fn new(hal: Arc<Hal>, config: DemodConfig) -> Self {
        Self {
            controller: Mutex::new(ModeController::new(hal, config)),
            abort: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.abort.lock().clone()
    }

    /// Cancel in-flight work and hand out a fresh token for the caller.
    fn interrupt(&self) -> CancellationToken {
        let mut token = self.abort.lock();
        token.cancel();
        *token = CancellationToken::new();
        token.clone()
    }

    /// Switch delivery system by frontend API number.
    pub async fn set_delivery_system(&self, id: u32) -> Result<()> {
        let token = self.interrupt();
        let mut mc = self.controller.lock().await;
        let Some(system) = DeliverySystem::from_id(id) else {
            warn!("[Frontend] unknown delivery system id {}", id);
            return Err(DemodError::Capability {
                system: DeliverySystem::Undefined,
                variant: mc.context().variant,
            });
        };
        mc.delsys_set(system, &token).await
    }

    /// Store channel parameters for the next re-tune.
    ///
    /// Ignored unless the parameters' delivery system is the active one.
    pub async fn set_channel_parameters(&self, params: FrontendParams) {
        let mut mc = self.controller.lock().await;
        if !mc.is_active(params.delivery_system) {
            debug!(
                "[Frontend] {} not active, parameters ignored",
                params.delivery_system
            );
            return;
        }
        mc.set_params(params);
    }

    pub async fn tune(&self, re_tune: bool) -> Result<TuneOutcome> {
        self.tune_with_flags(re_tune, 0).await
    }

    pub async fn tune_with_flags(&self, re_tune: bool, mode_flags: u32) -> Result<TuneOutcome> {
        let token = self.current_token();
        let mut mc = self.controller.lock().await;
        mc.tune(re_tune, mode_flags, &token).await
    }

    pub async fn read_status(&self) -> Result<LockStatus> {
        let token = self.current_token();
        self.controller.lock().await.read_status(&token).await
    }

    pub async fn read_ber(&self) -> Result<u32> {
        let token = self.current_token();
        Ok(self.controller.lock().await.read_metrics(&token).await?.ber)
    }

    pub async fn read_snr(&self) -> Result<u16> {
        let token = self.current_token();
        Ok(self.controller.lock().await.read_metrics(&token).await?.snr)
    }

    pub async fn read_signal_strength(&self) -> Result<u16> {
        let token = self.current_token();
        Ok(self.controller.lock().await.read_metrics(&token).await?.strength)
    }

    pub async fn read_ucblocks(&self) -> Result<u32> {
        let token = self.current_token();
        Ok(self.controller.lock().await.read_metrics(&token).await?.ucblocks)
    }

    /// Caller pacing hints; `None` while no mode is active.
    pub async fn tune_settings(&self) -> Option<TuneSettings> {
        self.controller.lock().await.tune_settings()
    }

    pub async fn context(&self) -> DeviceContext {
        self.controller.lock().await.context().clone()
    }

    /// Leave the active mode and release the tuner.
    pub async fn release(&self) -> Result<()> {
        self.interrupt();
        self.controller.lock().await.release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atsc_search;
    use crate::regs::MemoryBus;
    use crate::standard::dvbc;
    use crate::tuner::FixedTuner;
    use dtvdemod_types::{AddressSpace, ChipVariant, DemodMode, Modulation};
    use std::time::Duration;

    fn frontend(chip: ChipVariant) -> (Arc<Frontend>, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let tuner = Arc::new(FixedTuner::new(-45));
        let hal = Arc::new(Hal::new(bus.clone(), Some(tuner), chip));
        let mut config = DemodConfig::default();
        config.device.chip = chip;
        (Arc::new(Frontend::new(hal, config)), bus)
    }

    fn cable() -> FrontendParams {
        FrontendParams {
            delivery_system: DeliverySystem::DvbcAnnexA,
            frequency_hz: 474_000_000,
            symbol_rate: 6_875_000,
            modulation: Modulation::Qam64,
            bandwidth_hz: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cable_tune_locks() {
        let (fe, bus) = frontend(ChipVariant::Txl);
        fe.set_delivery_system(DeliverySystem::DvbcAnnexA.id())
            .await
            .unwrap();
        fe.set_channel_parameters(cable()).await;
        bus.preset(AddressSpace::Dvbc, dvbc::reg::CH_STATUS, 1);
        bus.preset(AddressSpace::Dvbc, dvbc::reg::SNR, 3200);

        let outcome = fe.tune(true).await.unwrap();
        assert!(outcome.status.is_locked());
        assert_eq!(outcome.delay, Duration::from_millis(250));
        assert_eq!(fe.read_snr().await.unwrap(), 32);
        assert_eq!(fe.read_signal_strength().await.unwrap(), 55);
        assert_eq!(fe.read_ucblocks().await.unwrap(), 0);
        assert_eq!(
            fe.tune_settings().await.map(|s| s.min_delay),
            Some(Duration::from_millis(300))
        );

        fe.release().await.unwrap();
        assert_eq!(fe.context().await.active, DemodMode::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_calls_are_neutral() {
        let (fe, _) = frontend(ChipVariant::Txl);
        fe.set_channel_parameters(cable()).await;
        assert_eq!(fe.read_status().await.unwrap(), LockStatus::UNSET);
        assert_eq!(fe.read_ber().await.unwrap(), 0);
        assert!(fe.tune_settings().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_system_id_rejected() {
        let (fe, _) = frontend(ChipVariant::Txl);
        let err = fe.set_delivery_system(99).await.unwrap_err();
        assert!(matches!(err, DemodError::Capability { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_change_aborts_cfo_search() {
        let (fe, bus) = frontend(ChipVariant::Txlx);
        fe.set_delivery_system(DeliverySystem::Atsc.id()).await.unwrap();
        fe.set_channel_parameters(FrontendParams {
            delivery_system: DeliverySystem::Atsc,
            frequency_hz: 527_000_000,
            symbol_rate: 0,
            modulation: Modulation::Vsb8,
            bandwidth_hz: 6_000_000,
        })
        .await;

        let tuning = {
            let fe = fe.clone();
            tokio::spawn(async move { fe.tune(true).await })
        };
        // well inside the CFO search: settle, restart and CCI scan are done
        tokio::time::sleep(Duration::from_millis(250)).await;
        let searched = bus
            .writes_to(AddressSpace::Atsc, atsc_search::reg::CR_RATE_MID)
            .len();
        assert!(searched >= 2, "search not started ({} writes)", searched);

        fe.set_delivery_system(DeliverySystem::DvbcAnnexA.id())
            .await
            .unwrap();
        let result = tuning.await.unwrap();
        assert!(matches!(result, Err(DemodError::Aborted)));
        assert_eq!(
            bus.writes_to(AddressSpace::Atsc, atsc_search::reg::CR_RATE_MID)
                .len(),
            searched
        );
        assert_eq!(fe.context().await.active, DemodMode::Dvbc);
    }
}
