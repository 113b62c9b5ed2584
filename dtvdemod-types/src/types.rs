//! Frontend-facing type definitions.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Concrete delivery system, numbered as in the DVB frontend API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DeliverySystem {
    Undefined = 0,
    /// DVB-C Annex A (European cable).
    DvbcAnnexA = 1,
    /// ITU J.83 Annex B (North-American cable).
    DvbcAnnexB = 2,
    Dvbt = 3,
    Dss = 4,
    Dvbs = 5,
    Dvbs2 = 6,
    Dvbh = 7,
    Isdbt = 8,
    Isdbs = 9,
    Isdbc = 10,
    Atsc = 11,
    AtscMh = 12,
    Dtmb = 13,
    Cmmb = 14,
    Dab = 15,
    Dvbt2 = 16,
    Turbo = 17,
    /// DVB-C Annex C (Japanese cable).
    DvbcAnnexC = 18,
}

impl DeliverySystem {
    /// Every tag, in frontend API order.
    pub const ALL: [DeliverySystem; 19] = [
        DeliverySystem::Undefined,
        DeliverySystem::DvbcAnnexA,
        DeliverySystem::DvbcAnnexB,
        DeliverySystem::Dvbt,
        DeliverySystem::Dss,
        DeliverySystem::Dvbs,
        DeliverySystem::Dvbs2,
        DeliverySystem::Dvbh,
        DeliverySystem::Isdbt,
        DeliverySystem::Isdbs,
        DeliverySystem::Isdbc,
        DeliverySystem::Atsc,
        DeliverySystem::AtscMh,
        DeliverySystem::Dtmb,
        DeliverySystem::Cmmb,
        DeliverySystem::Dab,
        DeliverySystem::Dvbt2,
        DeliverySystem::Turbo,
        DeliverySystem::DvbcAnnexC,
    ];

    /// Look up a delivery system by its frontend API number.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| *s as u32 == id)
    }

    /// Frontend API number.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Demodulator category that carries this system.
    ///
    /// Annex A and Annex C share the cable engine. Annex B is demodulated by
    /// the ATSC engine's QAM path.
    pub fn mode(self) -> DemodMode {
        match self {
            DeliverySystem::DvbcAnnexA | DeliverySystem::DvbcAnnexC => DemodMode::Dvbc,
            DeliverySystem::Atsc | DeliverySystem::AtscMh | DeliverySystem::DvbcAnnexB => {
                DemodMode::Atsc
            }
            DeliverySystem::Dvbt | DeliverySystem::Dvbt2 => DemodMode::Dvbt,
            DeliverySystem::Isdbt => DemodMode::Isdbt,
            DeliverySystem::Dtmb => DemodMode::Dtmb,
            _ => DemodMode::Unknown,
        }
    }

    /// Short lowercase name used in logs and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            DeliverySystem::Undefined => "undefined",
            DeliverySystem::DvbcAnnexA => "dvbc",
            DeliverySystem::DvbcAnnexB => "j83b",
            DeliverySystem::Dvbt => "dvbt",
            DeliverySystem::Dss => "dss",
            DeliverySystem::Dvbs => "dvbs",
            DeliverySystem::Dvbs2 => "dvbs2",
            DeliverySystem::Dvbh => "dvbh",
            DeliverySystem::Isdbt => "isdbt",
            DeliverySystem::Isdbs => "isdbs",
            DeliverySystem::Isdbc => "isdbc",
            DeliverySystem::Atsc => "atsc",
            DeliverySystem::AtscMh => "atscmh",
            DeliverySystem::Dtmb => "dtmb",
            DeliverySystem::Cmmb => "cmmb",
            DeliverySystem::Dab => "dab",
            DeliverySystem::Dvbt2 => "dvbt2",
            DeliverySystem::Turbo => "turbo",
            DeliverySystem::DvbcAnnexC => "dvbc-annex-c",
        }
    }
}

impl fmt::Display for DeliverySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeliverySystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "dvbc-annex-a" | "dvbc-a" => return Ok(DeliverySystem::DvbcAnnexA),
            "dvbc-annex-b" | "annex-b" | "qam" => return Ok(DeliverySystem::DvbcAnnexB),
            _ => {}
        }
        Self::ALL
            .iter()
            .copied()
            .find(|sys| sys.name() == lower)
            .ok_or_else(|| format!("unknown delivery system: {}", s))
    }
}

/// Demodulator category. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DemodMode {
    /// No standard powered.
    Unknown,
    Dvbc,
    Dvbt,
    Isdbt,
    Atsc,
    Dtmb,
}

impl fmt::Display for DemodMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DemodMode::Unknown => "UNKNOWN",
            DemodMode::Dvbc => "DVBC",
            DemodMode::Dvbt => "DVBT",
            DemodMode::Isdbt => "ISDBT",
            DemodMode::Atsc => "ATSC",
            DemodMode::Dtmb => "DTMB",
        };
        f.write_str(name)
    }
}

/// Modulation requested through the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Modulation {
    Qpsk,
    Qam16,
    Qam32,
    #[default]
    Qam64,
    Qam128,
    Qam256,
    QamAuto,
    Vsb8,
    Vsb16,
}

impl Modulation {
    /// True for the QAM family (including automatic detection).
    pub fn is_qam(self) -> bool {
        matches!(
            self,
            Modulation::Qam16
                | Modulation::Qam32
                | Modulation::Qam64
                | Modulation::Qam128
                | Modulation::Qam256
                | Modulation::QamAuto
        )
    }
}

impl FromStr for Modulation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qpsk" => Ok(Modulation::Qpsk),
            "qam16" => Ok(Modulation::Qam16),
            "qam32" => Ok(Modulation::Qam32),
            "qam64" => Ok(Modulation::Qam64),
            "qam128" => Ok(Modulation::Qam128),
            "qam256" => Ok(Modulation::Qam256),
            "qam" | "qam-auto" | "auto" => Ok(Modulation::QamAuto),
            "vsb8" | "8vsb" => Ok(Modulation::Vsb8),
            "vsb16" | "16vsb" => Ok(Modulation::Vsb16),
            _ => Err(format!("unknown modulation: {}", s)),
        }
    }
}

/// Generic parameters handed down by the control surface.
///
/// Each standard driver derives its own channel shape from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendParams {
    pub delivery_system: DeliverySystem,
    /// Centre frequency in Hz.
    pub frequency_hz: u32,
    /// Symbol rate in symbols per second (cable only).
    pub symbol_rate: u32,
    pub modulation: Modulation,
    /// Channel bandwidth in Hz (terrestrial only, 0 = auto).
    pub bandwidth_hz: u32,
}

impl Default for FrontendParams {
    fn default() -> Self {
        Self {
            delivery_system: DeliverySystem::Undefined,
            frequency_hz: 474_000_000,
            symbol_rate: 6_875_000,
            modulation: Modulation::Qam64,
            bandwidth_hz: 8_000_000,
        }
    }
}

/// Frontend lock status bits, with the Timeout and Unset sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LockStatus(u8);

impl LockStatus {
    /// Nothing known yet.
    pub const UNSET: LockStatus = LockStatus(0);
    pub const HAS_SIGNAL: LockStatus = LockStatus(0x01);
    pub const HAS_CARRIER: LockStatus = LockStatus(0x02);
    pub const HAS_VITERBI: LockStatus = LockStatus(0x04);
    pub const HAS_SYNC: LockStatus = LockStatus(0x08);
    pub const HAS_LOCK: LockStatus = LockStatus(0x10);
    /// Acquisition gave up.
    pub const TIMEOUT: LockStatus = LockStatus(0x20);
    /// Every lock bit set.
    pub const LOCKED: LockStatus = LockStatus(0x1f);

    pub fn from_bits(bits: u8) -> Self {
        LockStatus(bits & 0x3f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: LockStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_locked(self) -> bool {
        self.contains(LockStatus::HAS_LOCK)
    }

    pub fn is_timeout(self) -> bool {
        self.contains(LockStatus::TIMEOUT)
    }

    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for LockStatus {
    type Output = LockStatus;

    fn bitor(self, rhs: LockStatus) -> LockStatus {
        LockStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for LockStatus {
    fn bitor_assign(&mut self, rhs: LockStatus) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            return f.write_str("unset");
        }
        if self.is_timeout() {
            return f.write_str("timeout");
        }
        if *self == LockStatus::LOCKED {
            return f.write_str("locked");
        }
        write!(f, "partial(0x{:02x})", self.0)
    }
}

/// Signal quality snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalMetrics {
    /// Raw bit-error count as reported by the engine.
    pub ber: u32,
    /// SNR in dB.
    pub snr: u16,
    /// Signal strength, 0..=100.
    pub strength: u16,
    /// Uncorrected block count.
    pub ucblocks: u32,
}

/// Register address spaces of the demodulator and its always-on helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Demodulator top-level block.
    Top,
    Dvbc,
    Dvbt,
    Atsc,
    Dtmb,
    /// Front-end (AGC/DAGC) block.
    Front,
    /// Clock controller.
    Hiu,
    /// Always-on power domain.
    Ao,
    /// Reset controller.
    Reset,
}

impl FromStr for AddressSpace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "top" => Ok(AddressSpace::Top),
            "dvbc" => Ok(AddressSpace::Dvbc),
            "dvbt" => Ok(AddressSpace::Dvbt),
            "atsc" => Ok(AddressSpace::Atsc),
            "dtmb" => Ok(AddressSpace::Dtmb),
            "front" => Ok(AddressSpace::Front),
            "hiu" => Ok(AddressSpace::Hiu),
            "ao" => Ok(AddressSpace::Ao),
            "reset" => Ok(AddressSpace::Reset),
            _ => Err(format!("unknown address space: {}", s)),
        }
    }
}
