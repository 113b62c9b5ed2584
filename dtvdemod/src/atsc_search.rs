//! ATSC 8-VSB acquisition search.
//!
//! One acquisition step runs, in order:
//! - a co-channel interference scan that programs two notch filters
//! - a carrier-frequency-offset search over a fixed table of mixer offsets
//! - a bounded wait for full lock
//!
//! Once locked, a performance profile is chosen from the averaged SNR.
//! With `atsc.ar_enable`, equaliser auto-recovery is opened and closed
//! around an SNR band on every step.
//! Every wait goes through [`DriverContext::sleep`], so a mode change
//! cancels a running search between polls.

use std::time::Duration;

use log::{debug, info, warn};

use dtvdemod_types::{AddressSpace, Result};

use crate::config::AtscSection;
use crate::standard::snr::atsc_snr_db10;
use crate::standard::DriverContext;

pub mod reg {
    pub const CR_RATE_HI: u32 = 0x70c;
    pub const CR_RATE_MID: u32 = 0x70d;
    pub const CR_RATE_LO: u32 = 0x70e;
    pub const EQ_MODE: u32 = 0x716;
    pub const CCI_CTRL: u32 = 0x735;
    pub const CCI_NOTCH0_HI: u32 = 0x736;
    pub const CCI_NOTCH0_LO: u32 = 0x737;
    pub const CCI_NOTCH1_HI: u32 = 0x738;
    pub const CCI_NOTCH1_LO: u32 = 0x739;
    pub const SNR_HI: u32 = 0x511;
    pub const SNR_LO: u32 = 0x512;
    pub const TIMING_MODE: u32 = 0x5bc;
    pub const BER_CTRL: u32 = 0x601;
    /// Bit error count, four bytes, most significant first.
    pub const BER: u32 = 0x680;
    /// Symbol error count, same layout as [`BER`].
    pub const SER: u32 = 0x684;
    /// Carrier recovery rate, three bytes, least significant first.
    pub const CR_STATUS: u32 = 0x780;
    /// Symbol clock rate, three bytes, most significant first.
    pub const CK_STATUS: u32 = 0x786;
    pub const RESET: u32 = 0x900;
    pub const AGC_MODE: u32 = 0x912;
    pub const CCI_TRIGGER: u32 = 0x918;
    pub const FSM: u32 = 0x980;
    /// First of twelve result bytes, four (low, mid, high) triples.
    pub const CCI_RESULT: u32 = 0x981;
    pub const AR_CTRL: u32 = 0xf28;
    pub const AR_MODE: u32 = 0xf2b;
    pub const SYNC_MODE: u32 = 0xf6e;
}

/// Receiver FSM states, ordered by acquisition progress.
pub mod fsm {
    pub const IDLE: u32 = 0x20;
    pub const CR_LOCK: u32 = 0x50;
    /// Carrier present; below this the first detect gives up.
    pub const SIGNAL: u32 = 0x60;
    pub const CR_PEAK_LOCK: u32 = 0x62;
    pub const SYNC: u32 = 0x70;
    /// Lock is kept at or above this level once reached.
    pub const ATSC_LOCK: u32 = 0x76;
    pub const VSB_LOCK: u32 = 0x79;
}

/// Mixer offsets tried by the CFO search, in kHz.
pub const CFO_TABLE: [i32; 7] = [0, -50, 50, -100, 100, -150, 150];

const IF_KHZ: i64 = 5000;
const ADC_KHZ: i64 = 24_000;
const CCI_BINS: usize = 2048;
const CCI_RESULTS_PER_PASS: u32 = 4;
const RESET_HOLD: Duration = Duration::from_millis(20);
const SETTLE: Duration = Duration::from_millis(100);
const PROFILE_SETTLE: Duration = Duration::from_millis(200);

/// Coarse mixer rate for an IF offset.
pub fn cr_rate(offset_khz: i32) -> u32 {
    let rate = (1i64 << 10) * (IF_KHZ + i64::from(offset_khz)) / ADC_KHZ;
    (rate * (1 << 13)) as u32
}

/// Offsets searched for a configuration.
pub fn candidates(config: &AtscSection) -> &'static [i32] {
    if config.field_test {
        return &CFO_TABLE[..1];
    }
    match config.cfo_count {
        0..=3 => &CFO_TABLE[..3],
        4 | 5 => &CFO_TABLE[..5],
        _ => &CFO_TABLE[..],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfoOutcome {
    Locked { offset_khz: i32 },
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CciPeak {
    pub bin: u32,
    pub power: u32,
}

/// Equaliser and timing profile matched to the channel condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Multipath ensembles, and very clean signals.
    Task4Task5,
    Awgn,
    /// Strong static echoes.
    Task8R22,
}

impl Profile {
    pub fn for_snr(snr_db: u32) -> Self {
        match snr_db {
            10..=16 => Profile::Awgn,
            17..=23 => Profile::Task8R22,
            _ => Profile::Task4Task5,
        }
    }

    fn writes(self) -> &'static [(u32, u32)] {
        match self {
            Profile::Task4Task5 => &[(reg::AGC_MODE, 0), (reg::EQ_MODE, 0), (reg::TIMING_MODE, 1)],
            Profile::Awgn => &[(reg::AGC_MODE, 0), (reg::TIMING_MODE, 1), (reg::EQ_MODE, 2)],
            Profile::Task8R22 => &[
                (reg::AGC_MODE, 0x50),
                (reg::EQ_MODE, 2),
                (reg::TIMING_MODE, 7),
                (reg::SYNC_MODE, 0xaf),
            ],
        }
    }
}

/// Receiver state captured once per locked step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub snr_db10: u16,
    pub fsm: u32,
    pub cr: u32,
    pub ck: u32,
    pub ber: u32,
    pub ser: u32,
}

/// Result of one acquisition step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Locked on entry.
    AlreadyLocked,
    Locked { offset_khz: i32 },
    /// No candidate offset reached peak lock.
    CfoFail,
    /// Carrier found but full lock never came.
    NoLock,
}

pub async fn read_fsm(ctx: &DriverContext<'_>) -> Result<u32> {
    let regs = ctx.hal.regs().await;
    Ok(regs.read(AddressSpace::Atsc, reg::FSM)? & 0xff)
}

/// Error power pair feeding the SNR table.
pub async fn read_snr_raw(ctx: &DriverContext<'_>) -> Result<u32> {
    let regs = ctx.hal.regs().await;
    let hi = regs.read(AddressSpace::Atsc, reg::SNR_HI)? & 0xff;
    let lo = regs.read(AddressSpace::Atsc, reg::SNR_LO)? & 0xff;
    Ok((hi << 8) + lo)
}

/// Read the lock diagnostics, enabling the error counters first.
pub async fn status_snapshot(ctx: &DriverContext<'_>) -> Result<StatusSnapshot> {
    let snr_db10 = atsc_snr_db10(read_snr_raw(ctx).await?);
    let regs = ctx.hal.regs().await;
    let byte = |offset: u32| -> Result<u32> { Ok(regs.read(AddressSpace::Atsc, offset)? & 0xff) };
    let cr = byte(reg::CR_STATUS)?
        | (byte(reg::CR_STATUS + 1)? << 8)
        | (byte(reg::CR_STATUS + 2)? << 16);
    let ck = (byte(reg::CK_STATUS)? << 16)
        | (byte(reg::CK_STATUS + 1)? << 8)
        | byte(reg::CK_STATUS + 2)?;
    let fsm = byte(reg::FSM)?;
    regs.write(AddressSpace::Atsc, reg::BER_CTRL, 0x8)?;
    let mut counters = [0u32; 2];
    for (counter, base) in counters.iter_mut().zip([reg::BER, reg::SER]) {
        for i in 0..4 {
            *counter = (*counter << 8) | byte(base + i)?;
        }
    }
    let [ber, ser] = counters;
    debug!(
        "[ATSC] snr {}.{} dB, fsm 0x{:x}, cr 0x{:06x}, ck 0x{:06x}, ber 0x{:08x}, ser 0x{:08x}",
        snr_db10 / 10,
        snr_db10 % 10,
        fsm,
        cr,
        ck,
        ber,
        ser
    );
    Ok(StatusSnapshot {
        snr_db10,
        fsm,
        cr,
        ck,
        ber,
        ser,
    })
}

/// Pulse the receiver reset.
pub async fn reset(ctx: &DriverContext<'_>) -> Result<()> {
    ctx.hal.regs().await.write(AddressSpace::Atsc, reg::RESET, 1)?;
    ctx.sleep(RESET_HOLD).await?;
    ctx.hal.regs().await.write(AddressSpace::Atsc, reg::RESET, 0)?;
    Ok(())
}

pub async fn program_cr_rate(ctx: &DriverContext<'_>, offset_khz: i32) -> Result<()> {
    let rate = cr_rate(offset_khz);
    let regs = ctx.hal.regs().await;
    regs.write(AddressSpace::Atsc, reg::CR_RATE_LO, rate & 0xff)?;
    regs.write(AddressSpace::Atsc, reg::CR_RATE_MID, (rate >> 8) & 0xff)?;
    regs.write(AddressSpace::Atsc, reg::CR_RATE_HI, (rate >> 16) & 0xff)?;
    debug!("[ATSC] cr rate 0x{:x} for {:+} kHz", rate, offset_khz);
    Ok(())
}

/// Scan for co-channel interference and program up to two notches.
pub async fn cci_scan(ctx: &DriverContext<'_>) -> Result<Vec<CciPeak>> {
    let config = &ctx.config.atsc;
    let mut power = vec![0u32; CCI_BINS];

    for _ in 0..config.cci_passes {
        ctx.check_abort()?;
        let regs = ctx.hal.regs().await;
        regs.write(AddressSpace::Atsc, reg::CCI_TRIGGER, 0x3)?;
        for i in 0..CCI_RESULTS_PER_PASS {
            let base = reg::CCI_RESULT + i * 3;
            let lo = regs.read(AddressSpace::Atsc, base)? & 0xff;
            let mid = regs.read(AddressSpace::Atsc, base + 1)? & 0xff;
            let hi = regs.read(AddressSpace::Atsc, base + 2)? & 0xff;
            let result = (hi << 16) + (mid << 8) + lo;
            let bin = (result & 0x7ff) as usize;
            power[bin] = power[bin].saturating_add(result >> 11);
        }
    }

    let mut peaks: Vec<CciPeak> = Vec::with_capacity(2);
    for (bin, &p) in power.iter().enumerate() {
        if p <= config.cci_threshold {
            continue;
        }
        let peak = CciPeak {
            bin: bin as u32,
            power: p,
        };
        if peaks.first().map_or(true, |top| p > top.power) {
            peaks.insert(0, peak);
        } else if peaks.get(1).map_or(true, |second| p > second.power) {
            peaks.insert(1, peak);
        }
        peaks.truncate(2);
    }

    let bin_of = |i: usize| peaks.get(i).map_or(0, |p| p.bin);
    let (b0, b1) = (bin_of(0), bin_of(1));
    let regs = ctx.hal.regs().await;
    regs.write(AddressSpace::Atsc, reg::CCI_NOTCH0_HI, ((b0 >> 8) & 0x7) + 0x40)?;
    regs.write(AddressSpace::Atsc, reg::CCI_NOTCH0_LO, b0 & 0xff)?;
    regs.write(AddressSpace::Atsc, reg::CCI_NOTCH1_HI, (b1 >> 8) & 0x7)?;
    regs.write(AddressSpace::Atsc, reg::CCI_NOTCH1_LO, b1 & 0xff)?;
    regs.write(AddressSpace::Atsc, reg::CCI_CTRL, 0x80)?;

    for peak in &peaks {
        debug!("[ATSC] cci at bin 0x{:x}, power 0x{:x}", peak.bin, peak.power);
    }
    Ok(peaks)
}

/// Try each mixer offset until the carrier reaches peak lock.
pub async fn cfo_search(ctx: &DriverContext<'_>) -> Result<CfoOutcome> {
    let config = &ctx.config.atsc;
    let interval = config.poll_interval();
    let cr_polls = if config.field_test {
        config.field_test_cr_lock_polls
    } else {
        config.cr_lock_polls
    };

    for &offset in candidates(config) {
        ctx.check_abort()?;
        reset(ctx).await?;
        program_cr_rate(ctx, offset).await?;

        let mut carrier = false;
        for _ in 0..cr_polls {
            if read_fsm(ctx).await? >= fsm::CR_LOCK {
                carrier = true;
                break;
            }
            ctx.sleep(interval).await?;
        }
        if !carrier {
            continue;
        }

        for _ in 0..config.peak_lock_polls {
            let state = read_fsm(ctx).await?;
            if state >= fsm::CR_PEAK_LOCK {
                info!("[ATSC] cfo ok at {:+} kHz", offset);
                return Ok(CfoOutcome::Locked { offset_khz: offset });
            }
            if state <= fsm::IDLE {
                debug!("[ATSC] no signal at {:+} kHz", offset);
                break;
            }
            ctx.sleep(interval).await?;
        }
    }

    warn!("[ATSC] cfo search failed over {} offsets", candidates(config).len());
    Ok(CfoOutcome::Fail)
}

/// Averaged SNR in dB.
async fn average_snr(ctx: &DriverContext<'_>, samples: u32) -> Result<u32> {
    let samples = samples.max(1);
    let mut sum = 0u32;
    for i in 0..samples {
        ctx.check_abort()?;
        sum += u32::from(atsc_snr_db10(read_snr_raw(ctx).await?));
        if i % 11 == 10 {
            ctx.sleep(Duration::from_millis(20)).await?;
        }
    }
    Ok(sum / samples / 10)
}

async fn apply_profile(ctx: &DriverContext<'_>, profile: Profile) -> Result<()> {
    let regs = ctx.hal.regs().await;
    for &(offset, value) in profile.writes() {
        regs.write(AddressSpace::Atsc, offset, value)?;
    }
    Ok(())
}

/// Per-acquisition search state.
#[derive(Debug, Default)]
pub struct AtscSearch {
    profile: Option<Profile>,
    /// Equaliser auto-recovery is open.
    recovery: bool,
}

impl AtscSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profile(&self) -> Option<Profile> {
        self.profile
    }

    pub fn recovery_open(&self) -> bool {
        self.recovery
    }

    /// Allow a new profile choice on the next lock.
    pub fn clear_profile(&mut self) {
        self.profile = None;
    }

    /// Forget everything learned on the previous channel.
    pub fn new_channel(&mut self) {
        self.profile = None;
        self.recovery = false;
    }

    /// Open auto-recovery below the SNR band, close it above.
    pub async fn auto_recovery(&mut self, ctx: &DriverContext<'_>) -> Result<()> {
        let config = &ctx.config.atsc;
        ctx.sleep(SETTLE).await?;
        let snr = u32::from(atsc_snr_db10(read_snr_raw(ctx).await?)) / 10;
        let regs = ctx.hal.regs().await;
        if snr > config.ar_close_above_db && self.recovery {
            regs.write(AddressSpace::Atsc, reg::AR_MODE, 0x4)?;
            self.recovery = false;
            debug!("[ATSC] snr {} dB, auto recovery closed", snr);
        } else if snr < config.ar_open_below_db && !self.recovery {
            regs.write(AddressSpace::Atsc, reg::AR_CTRL, 0x8c)?;
            regs.write(AddressSpace::Atsc, reg::AR_CTRL, 0xc)?;
            regs.write(AddressSpace::Atsc, reg::AR_MODE, 0x14)?;
            self.recovery = true;
            debug!("[ATSC] snr {} dB, auto recovery opened", snr);
        }
        Ok(())
    }

    /// Return the receiver to its default mixer and restart it.
    pub async fn restart(&mut self, ctx: &DriverContext<'_>) -> Result<()> {
        program_cr_rate(ctx, 0).await?;
        reset(ctx).await?;
        self.profile = None;
        Ok(())
    }

    /// One acquisition step: search while unlocked, tune the profile once locked.
    pub async fn acquire(&mut self, ctx: &DriverContext<'_>) -> Result<AcquireOutcome> {
        let config: &AtscSection = &ctx.config.atsc;

        if read_fsm(ctx).await? >= fsm::ATSC_LOCK {
            status_snapshot(ctx).await?;
            if config.ar_enable {
                self.auto_recovery(ctx).await?;
            }
            ctx.sleep(SETTLE).await?;
            if !config.field_test && self.profile.is_none() {
                let snr = average_snr(ctx, config.snr_samples).await?;
                let profile = Profile::for_snr(snr);
                apply_profile(ctx, profile).await?;
                info!("[ATSC] snr {} dB, profile {:?}", snr, profile);
                self.profile = Some(profile);
                ctx.sleep(PROFILE_SETTLE).await?;
            }
            return Ok(AcquireOutcome::AlreadyLocked);
        }

        self.restart(ctx).await?;
        if config.ar_enable {
            self.auto_recovery(ctx).await?;
            reset(ctx).await?;
        }
        let state = read_fsm(ctx).await?;
        if state >= fsm::ATSC_LOCK {
            return Ok(AcquireOutcome::Locked { offset_khz: 0 });
        }

        if config.cci_enable {
            cci_scan(ctx).await?;
        }

        let offset_khz = if state < fsm::CR_LOCK {
            match cfo_search(ctx).await? {
                CfoOutcome::Locked { offset_khz } => offset_khz,
                CfoOutcome::Fail => return Ok(AcquireOutcome::CfoFail),
            }
        } else {
            ctx.sleep(SETTLE).await?;
            0
        };

        for _ in 0..config.lock_wait_polls {
            let state = read_fsm(ctx).await?;
            if state >= fsm::ATSC_LOCK {
                info!("[ATSC] locked, offset {:+} kHz", offset_khz);
                return Ok(AcquireOutcome::Locked { offset_khz });
            }
            if state <= fsm::IDLE {
                debug!("[ATSC] signal lost waiting for lock");
                program_cr_rate(ctx, 0).await?;
                reset(ctx).await?;
                break;
            }
            ctx.sleep(config.poll_interval()).await?;
        }
        Ok(AcquireOutcome::NoLock)
    }
}
