//! DTMB lock maintenance.
//!
//! A [`PollMachine`] runs once per period from a background task and keeps
//! the DTMB engine locked:
//! - while locked it watches BCH error growth and resets the engine when the
//!   error rate jumps
//! - while unlocked it runs calibration passes, alternating the
//!   spectrum-inversion / 4-QAM-NR hypothesis, then does a full reset
//!
//! Each step returns the delay until the next one.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use dtvdemod_types::{AddressSpace, LockStatus, Result};

use crate::config::DtmbSection;
use crate::regs::{Hal, Regs};

pub mod reg {
    pub const CTRL: u32 = 0x00;
    pub const CH_FREQ: u32 = 0x01;
    /// Bit 0 spectrum inversion, bit 1 4-QAM-NR.
    pub const HYPOTHESIS: u32 = 0x02;
    /// Constellation forced into the decoder.
    pub const CONSTELLATION: u32 = 0x03;
    pub const CALIBRATE: u32 = 0x04;
    /// FEC status, bit 0 lock.
    pub const FEC_STATUS: u32 = 0x30;
    pub const CHE_SNR: u32 = 0x31;
    /// Accumulated BCH decode failures.
    pub const BCH_COUNT: u32 = 0x32;
    /// Constellation detected by the front end.
    pub const DETECTED_CONSTELLATION: u32 = 0x33;
    /// Nonzero once the front end sees a DTMB frame header.
    pub const SIGNAL: u32 = 0x35;
}

const CTRL_RESET: u32 = 1 << 0;
const HYPOTHESIS_BITS: u32 = 0x3;

/// Poll state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    HasSignalCheck,
    NoSignalCheck,
    /// Engine reset after BCH growth, waiting for relock.
    BchOverThreshold,
}

/// Hardware operations the poll machine needs.
pub trait DtmbProbe {
    fn fec_locked(&mut self) -> Result<bool>;
    fn bch_count(&mut self) -> Result<u32>;
    /// Full engine reset under a decoding hypothesis.
    fn reset(&mut self, hypothesis: bool) -> Result<()>;
    /// Align the forced constellation with the detected one.
    fn constellation_check(&mut self) -> Result<()>;
    /// One calibration pass under a decoding hypothesis.
    fn no_signal_check(&mut self, hypothesis: bool) -> Result<()>;
}

fn hypothesis_bits(hypothesis: bool) -> u32 {
    if hypothesis {
        HYPOTHESIS_BITS
    } else {
        0
    }
}

impl DtmbProbe for Regs<'_> {
    fn fec_locked(&mut self) -> Result<bool> {
        Ok(self.read(AddressSpace::Dtmb, reg::FEC_STATUS)? & 0x1 != 0)
    }

    fn bch_count(&mut self) -> Result<u32> {
        self.read(AddressSpace::Dtmb, reg::BCH_COUNT)
    }

    fn reset(&mut self, hypothesis: bool) -> Result<()> {
        self.write(AddressSpace::Dtmb, reg::HYPOTHESIS, hypothesis_bits(hypothesis))?;
        self.modify(AddressSpace::Dtmb, reg::CTRL, CTRL_RESET, CTRL_RESET)?;
        self.modify(AddressSpace::Dtmb, reg::CTRL, CTRL_RESET, 0)
    }

    fn constellation_check(&mut self) -> Result<()> {
        let detected = self.read(AddressSpace::Dtmb, reg::DETECTED_CONSTELLATION)? & 0x7;
        let forced = self.read(AddressSpace::Dtmb, reg::CONSTELLATION)? & 0x7;
        if detected != forced {
            debug!("[DTMB] constellation {} -> {}", forced, detected);
            self.modify(AddressSpace::Dtmb, reg::CONSTELLATION, 0x7, detected)?;
        }
        Ok(())
    }

    fn no_signal_check(&mut self, hypothesis: bool) -> Result<()> {
        self.write(AddressSpace::Dtmb, reg::HYPOTHESIS, hypothesis_bits(hypothesis))?;
        self.write(AddressSpace::Dtmb, reg::CALIBRATE, 1)
    }
}

/// DTMB lock maintenance state machine.
#[derive(Debug)]
pub struct PollMachine {
    state: PollState,
    restart: bool,
    stop: bool,
    retries: u32,
    bch: u32,
    hypothesis: bool,
    last_status: LockStatus,
    config: DtmbSection,
}

impl PollMachine {
    pub fn new(config: &DtmbSection) -> Self {
        Self {
            state: PollState::Idle,
            restart: false,
            stop: false,
            retries: 0,
            bch: 0,
            hypothesis: false,
            last_status: LockStatus::UNSET,
            config: config.clone(),
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn last_status(&self) -> LockStatus {
        self.last_status
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn hypothesis(&self) -> bool {
        self.hypothesis
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn clear(&mut self) {
        self.state = PollState::Idle;
        self.retries = 0;
        self.bch = 0;
    }

    fn save(&mut self, locked: bool) {
        self.last_status = if locked {
            LockStatus::LOCKED
        } else {
            LockStatus::TIMEOUT
        };
    }

    /// Restart in `state`, publishing the matching status.
    pub fn start_tune(&mut self, state: PollState) {
        self.clear();
        self.state = state;
        self.restart = true;
        self.stop = false;
        self.save(state != PollState::NoSignalCheck);
        debug!("[DTMB] poll restart in {:?}", state);
    }

    /// Park the machine until the next `start_tune`.
    pub fn stop(&mut self) {
        self.stop = true;
        self.restart = false;
        self.clear();
        self.last_status = LockStatus::UNSET;
    }

    /// One poll cycle.
    pub fn step<P: DtmbProbe>(&mut self, probe: &mut P) -> Result<Duration> {
        if self.stop {
            self.stop = false;
            self.clear();
            return Ok(Self::ms(self.config.delay_idle_ms));
        }
        if self.state == PollState::Idle && !self.restart {
            return Ok(Self::ms(self.config.delay_idle_ms));
        }

        let locked = probe.fec_locked()?;
        if self.restart {
            self.restart = false;
            self.retries = 0;
            self.bch = probe.bch_count()?;
        }

        if self.state == PollState::BchOverThreshold {
            if self.retries < self.config.bch_retry_bound {
                self.retries += 1;
                if locked {
                    probe.constellation_check()?;
                    self.state = PollState::HasSignalCheck;
                    self.retries = 0;
                    self.bch = probe.bch_count()?;
                    self.save(true);
                    info!("[DTMB] relocked after bch reset");
                }
                return Ok(Self::ms(self.config.delay_have_signal_ms));
            }
            info!("[DTMB] no relock after bch reset");
            self.state = PollState::NoSignalCheck;
            self.retries = 0;
            self.save(locked);
            return Ok(Self::ms(self.config.delay_no_signal_ms));
        }

        if locked {
            return self.step_locked(probe);
        }
        self.step_unlocked(probe)
    }

    fn step_locked<P: DtmbProbe>(&mut self, probe: &mut P) -> Result<Duration> {
        match self.state {
            PollState::Idle | PollState::NoSignalCheck => {
                self.bch = probe.bch_count()?;
                self.state = PollState::HasSignalCheck;
                self.retries = 0;
                self.save(true);
                Ok(Self::ms(self.config.delay_have_signal_ms))
            }
            _ => {
                let count = probe.bch_count()?;
                let growth = count.wrapping_sub(self.bch);
                if growth >= self.config.bch_growth_threshold {
                    warn!("[DTMB] bch errors grew by {}, resetting", growth);
                    probe.reset(self.hypothesis)?;
                    self.state = PollState::BchOverThreshold;
                    self.retries = 0;
                    return Ok(Self::ms(self.config.delay_have_signal_ms));
                }
                self.bch = count;
                self.save(true);
                Ok(Self::ms(self.config.delay_steady_ms))
            }
        }
    }

    fn step_unlocked<P: DtmbProbe>(&mut self, probe: &mut P) -> Result<Duration> {
        match self.state {
            PollState::Idle => {
                self.state = PollState::NoSignalCheck;
                self.retries = 0;
            }
            PollState::HasSignalCheck => {
                info!("[DTMB] lock lost");
                self.state = PollState::NoSignalCheck;
                self.retries = 0;
                self.save(false);
            }
            _ => {}
        }

        if self.retries < self.config.no_signal_passes {
            probe.no_signal_check(self.hypothesis)?;
            self.hypothesis = !self.hypothesis;
            self.retries += 1;
            return Ok(Self::ms(self.config.delay_no_signal_ms));
        }

        self.hypothesis = !self.hypothesis;
        debug!("[DTMB] calibration exhausted, full reset");
        probe.reset(self.hypothesis)?;
        self.retries = 0;
        self.save(false);
        Ok(Self::ms(self.config.delay_steady_ms))
    }
}

/// Body of the DTMB poll task.
pub async fn run_poll_task(
    hal: Arc<Hal>,
    machine: Arc<parking_lot::Mutex<PollMachine>>,
    token: CancellationToken,
) {
    loop {
        let delay = {
            let mut regs = hal.regs().await;
            let mut machine = machine.lock();
            match machine.step(&mut regs) {
                Ok(delay) => delay,
                Err(e) => {
                    warn!("[DTMB] poll step failed: {}", e);
                    Duration::from_millis(machine.config.delay_idle_ms)
                }
            }
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("[DTMB] poll task exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::MemoryBus;
    use dtvdemod_types::ChipVariant;

    #[derive(Default)]
    struct FakeProbe {
        locked: bool,
        bch: u32,
        resets: Vec<bool>,
        calibrations: Vec<bool>,
        constellation_checks: u32,
    }

    impl DtmbProbe for FakeProbe {
        fn fec_locked(&mut self) -> Result<bool> {
            Ok(self.locked)
        }

        fn bch_count(&mut self) -> Result<u32> {
            Ok(self.bch)
        }

        fn reset(&mut self, hypothesis: bool) -> Result<()> {
            self.resets.push(hypothesis);
            Ok(())
        }

        fn constellation_check(&mut self) -> Result<()> {
            self.constellation_checks += 1;
            Ok(())
        }

        fn no_signal_check(&mut self, hypothesis: bool) -> Result<()> {
            self.calibrations.push(hypothesis);
            Ok(())
        }
    }

    fn locked_machine(probe: &mut FakeProbe) -> PollMachine {
        let mut machine = PollMachine::new(&DtmbSection::default());
        machine.start_tune(PollState::HasSignalCheck);
        probe.locked = true;
        probe.bch = 1000;
        assert_eq!(machine.step(probe).unwrap(), Duration::from_millis(300));
        machine
    }

    #[test]
    fn test_idle_machine_waits() {
        let mut probe = FakeProbe::default();
        let mut machine = PollMachine::new(&DtmbSection::default());
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(3000));
        assert_eq!(machine.state(), PollState::Idle);
        assert!(machine.last_status().is_unset());
    }

    #[test]
    fn test_bch_growth_then_relock() {
        let mut probe = FakeProbe::default();
        let mut machine = locked_machine(&mut probe);

        probe.bch = 1040;
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(300));
        assert_eq!(machine.state(), PollState::HasSignalCheck);

        probe.bch = 1090;
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(100));
        assert_eq!(machine.state(), PollState::BchOverThreshold);
        assert_eq!(probe.resets, vec![false]);

        probe.bch = 2000;
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(100));
        assert_eq!(machine.state(), PollState::HasSignalCheck);
        assert_eq!(machine.retries(), 0);
        assert_eq!(probe.constellation_checks, 1);
        assert!(machine.last_status().is_locked());

        // resynced: small growth from the new baseline is steady state
        probe.bch = 2010;
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(300));
        assert_eq!(machine.state(), PollState::HasSignalCheck);
    }

    #[test]
    fn test_bch_growth_then_exhaustion() {
        let mut probe = FakeProbe::default();
        let mut machine = locked_machine(&mut probe);

        probe.bch = 1050;
        machine.step(&mut probe).unwrap();
        assert_eq!(machine.state(), PollState::BchOverThreshold);

        probe.locked = false;
        for attempt in 1..=3 {
            machine.step(&mut probe).unwrap();
            assert_eq!(machine.state(), PollState::BchOverThreshold);
            assert_eq!(machine.retries(), attempt);
        }
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(120));
        assert_eq!(machine.state(), PollState::NoSignalCheck);
        assert_eq!(machine.retries(), 0);
        assert!(machine.last_status().is_timeout());
    }

    #[test]
    fn test_no_signal_calibration_then_reset() {
        let mut probe = FakeProbe::default();
        let mut machine = PollMachine::new(&DtmbSection::default());
        machine.start_tune(PollState::NoSignalCheck);
        assert!(machine.last_status().is_timeout());

        for _ in 0..10 {
            assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(120));
        }
        assert_eq!(
            probe.calibrations,
            vec![false, true, false, true, false, true, false, true, false, true]
        );
        assert!(probe.resets.is_empty());

        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(300));
        assert_eq!(probe.resets, vec![true]);
        assert_eq!(machine.retries(), 0);
        assert_eq!(machine.state(), PollState::NoSignalCheck);
    }

    #[test]
    fn test_lock_found_during_calibration() {
        let mut probe = FakeProbe::default();
        let mut machine = PollMachine::new(&DtmbSection::default());
        machine.start_tune(PollState::NoSignalCheck);
        machine.step(&mut probe).unwrap();

        probe.locked = true;
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(100));
        assert_eq!(machine.state(), PollState::HasSignalCheck);
        assert!(machine.last_status().is_locked());
    }

    #[test]
    fn test_stop_parks_machine() {
        let mut probe = FakeProbe::default();
        let mut machine = locked_machine(&mut probe);
        machine.stop();
        assert!(machine.last_status().is_unset());
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(3000));
        assert_eq!(machine.state(), PollState::Idle);
        assert_eq!(machine.step(&mut probe).unwrap(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_task_tracks_hardware() {
        let bus = Arc::new(MemoryBus::new());
        let hal = Arc::new(Hal::new(bus.clone(), None, ChipVariant::Txl));
        let machine = Arc::new(parking_lot::Mutex::new(PollMachine::new(
            &DtmbSection::default(),
        )));
        machine.lock().start_tune(PollState::NoSignalCheck);

        let token = CancellationToken::new();
        let task = tokio::spawn(run_poll_task(hal, machine.clone(), token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(machine.lock().last_status().is_timeout());
        assert_eq!(bus.writes_to(AddressSpace::Dtmb, reg::CALIBRATE), vec![1]);

        bus.preset(AddressSpace::Dtmb, reg::FEC_STATUS, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(machine.lock().last_status().is_locked());
        assert_eq!(machine.lock().state(), PollState::HasSignalCheck);

        token.cancel();
        task.await.unwrap();
    }
}
