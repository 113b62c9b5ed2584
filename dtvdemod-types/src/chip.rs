//! Chip variants and their capability table.
//!
//! Each SoC generation carries a different mix of demodulator engines. The
//! table below is the single source for which delivery systems a variant can
//! enter and which register offset scheme it uses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{DeliverySystem, DemodMode};

/// SoC generation hosting the demodulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChipVariant {
    Gxtvbb,
    #[default]
    Txl,
    Txlx,
    Gxlx,
    Txhd,
    Tl1,
}

/// Revision of one demodulator engine (`None` = engine absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EngineVersion {
    None,
    V2,
    V3,
    V4,
}

impl EngineVersion {
    pub fn is_present(self) -> bool {
        self != EngineVersion::None
    }
}

/// Register offset scheme used to resolve per-standard address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OffsetScheme {
    V2,
    V3,
    V4,
}

/// PLL family, which decides the VCO range and feedback divider rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PllFamily {
    /// VCO = ref * M / N, 750..=1550 MHz, divide-by-two above 1 GHz.
    Legacy,
    /// VCO = ref * M / N / 2, 700..=1000 MHz, divide-by-two always on.
    Txl,
}

/// Engine versions and offset scheme of one chip variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub dvbc: EngineVersion,
    pub dvbt: EngineVersion,
    pub atsc: EngineVersion,
    pub dtmb: EngineVersion,
    pub offsets: OffsetScheme,
}

impl ChipVariant {
    pub const ALL: [ChipVariant; 6] = [
        ChipVariant::Gxtvbb,
        ChipVariant::Txl,
        ChipVariant::Txlx,
        ChipVariant::Gxlx,
        ChipVariant::Txhd,
        ChipVariant::Tl1,
    ];

    /// Capability table entry for this variant.
    pub fn capabilities(self) -> Capabilities {
        use EngineVersion::*;
        match self {
            ChipVariant::Gxtvbb => Capabilities {
                dvbc: V2,
                dvbt: None,
                atsc: None,
                dtmb: V2,
                offsets: OffsetScheme::V2,
            },
            ChipVariant::Txl => Capabilities {
                dvbc: V2,
                dvbt: None,
                atsc: None,
                dtmb: V3,
                offsets: OffsetScheme::V2,
            },
            ChipVariant::Txlx => Capabilities {
                dvbc: V3,
                dvbt: V2,
                atsc: V2,
                dtmb: None,
                offsets: OffsetScheme::V3,
            },
            ChipVariant::Gxlx => Capabilities {
                dvbc: V3,
                dvbt: None,
                atsc: None,
                dtmb: None,
                offsets: OffsetScheme::V3,
            },
            ChipVariant::Txhd => Capabilities {
                dvbc: None,
                dvbt: None,
                atsc: None,
                dtmb: V3,
                offsets: OffsetScheme::V3,
            },
            ChipVariant::Tl1 => Capabilities {
                dvbc: V3,
                dvbt: None,
                atsc: V2,
                dtmb: V3,
                offsets: OffsetScheme::V4,
            },
        }
    }

    pub fn pll_family(self) -> PllFamily {
        match self {
            ChipVariant::Gxtvbb => PllFamily::Legacy,
            _ => PllFamily::Txl,
        }
    }

    /// Whether the demodulator category has an engine on this chip.
    pub fn supports_mode(self, mode: DemodMode) -> bool {
        let caps = self.capabilities();
        match mode {
            DemodMode::Unknown => false,
            DemodMode::Dvbc => caps.dvbc.is_present(),
            DemodMode::Dvbt | DemodMode::Isdbt => caps.dvbt.is_present(),
            DemodMode::Atsc => caps.atsc.is_present(),
            DemodMode::Dtmb => caps.dtmb.is_present(),
        }
    }

    /// Whether a concrete delivery system can be entered on this chip.
    pub fn supports(self, system: DeliverySystem) -> bool {
        self.supports_mode(system.mode())
    }

    /// Every delivery system this chip can enter, in frontend API order.
    pub fn supported_systems(self) -> Vec<DeliverySystem> {
        DeliverySystem::ALL
            .iter()
            .copied()
            .filter(|s| self.supports(*s))
            .collect()
    }

    pub fn name(self) -> &'static str {
        match self {
            ChipVariant::Gxtvbb => "gxtvbb",
            ChipVariant::Txl => "txl",
            ChipVariant::Txlx => "txlx",
            ChipVariant::Gxlx => "gxlx",
            ChipVariant::Txhd => "txhd",
            ChipVariant::Tl1 => "tl1",
        }
    }
}

impl fmt::Display for ChipVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChipVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.name() == lower)
            .ok_or_else(|| format!("unknown chip variant: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txl_supports_cable_and_dtmb_only() {
        let chip = ChipVariant::Txl;
        assert!(chip.supports(DeliverySystem::DvbcAnnexA));
        assert!(chip.supports(DeliverySystem::Dtmb));
        assert!(!chip.supports(DeliverySystem::Atsc));
        assert!(!chip.supports(DeliverySystem::DvbcAnnexB));
        assert!(!chip.supports(DeliverySystem::Dvbt));
    }

    #[test]
    fn test_txlx_supports_terrestrial_and_atsc() {
        let systems = ChipVariant::Txlx.supported_systems();
        assert!(systems.contains(&DeliverySystem::Dvbt));
        assert!(systems.contains(&DeliverySystem::Isdbt));
        assert!(systems.contains(&DeliverySystem::Atsc));
        assert!(systems.contains(&DeliverySystem::DvbcAnnexB));
        assert!(!systems.contains(&DeliverySystem::Dtmb));
    }

    #[test]
    fn test_pll_family() {
        assert_eq!(ChipVariant::Gxtvbb.pll_family(), PllFamily::Legacy);
        assert_eq!(ChipVariant::Tl1.pll_family(), PllFamily::Txl);
    }

    #[test]
    fn test_unsupported_satellite() {
        for chip in ChipVariant::ALL {
            assert!(!chip.supports(DeliverySystem::Dvbs2));
            assert!(!chip.supports(DeliverySystem::Undefined));
        }
    }
}
