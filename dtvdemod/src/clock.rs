//! PLL parameter search and clock-tree programming.
//!
//! The demodulator ADC PLL derives two outputs from one VCO through
//! independent post-dividers (2^od) and integer dividers (xd). A third,
//! digital divider derives the demodulator system clock from the VCO.
//!
//! [`synthesize`] is a pure search over the multiplier range; all arithmetic
//! is done in 100 Hz units so that kHz targets divide without loss.

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use dtvdemod_types::{
    AddressSpace, ChipVariant, ClockSynthesisError, DemodMode, EngineVersion, PllFamily, Result,
};

use crate::regs::Regs;

/// Crystal feeding the ADC PLL.
pub const REFERENCE_KHZ: u32 = 24_000;

/// First PLL output, fixed for every demodulator clock pair.
pub const FIXED_OUTPUT_KHZ: u32 = 25_000;

const UNITS_PER_KHZ: u64 = 10;
const UNITS_PER_MHZ: u64 = 10_000;
const HZ_PER_UNIT: u64 = 100;

const M_MAX: u32 = 511;
const N_FIXED: u32 = 1;

/// Post-divider exponents tried for each output, in search order.
const OUTPUT_SHIFTS: [u8; 2] = [1, 2];

/// Combined error above which a candidate is never accepted.
const ERROR_CEILING: u64 = 100 * UNITS_PER_MHZ;

/// HIU registers of the ADC PLL and the demodulator clock gate.
pub mod reg {
    pub const ADC_PLL_CNTL: u32 = 0xaa;
    pub const ADC_PLL_CNTL2: u32 = 0xab;
    pub const DEMOD_CLK_CNTL: u32 = 0x74;
}

/// VCO window and prescaler of one PLL family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PllLimits {
    pub family: PllFamily,
    pub vco_min_khz: u32,
    pub vco_max_khz: u32,
    /// The VCO runs at half of ref * M / N.
    pub prescale_by_two: bool,
}

impl PllLimits {
    pub fn for_family(family: PllFamily) -> Self {
        match family {
            PllFamily::Legacy => Self {
                family,
                vco_min_khz: 750_000,
                vco_max_khz: 1_550_000,
                prescale_by_two: false,
            },
            PllFamily::Txl => Self {
                family,
                vco_min_khz: 700_000,
                vco_max_khz: 1_000_000,
                prescale_by_two: true,
            },
        }
    }

    pub fn for_variant(variant: ChipVariant) -> Self {
        Self::for_family(variant.pll_family())
    }

    /// Feedback divide-by-two rule for the system clock path.
    fn div2(&self, vco: u64) -> bool {
        match self.family {
            PllFamily::Txl => true,
            PllFamily::Legacy => vco > 1000 * UNITS_PER_MHZ,
        }
    }
}

/// Requested outputs, in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockRequest {
    pub reference_khz: u32,
    pub target_a_khz: Option<u32>,
    pub target_b_khz: Option<u32>,
    pub system_khz: Option<u32>,
}

impl ClockRequest {
    /// Fixed 25 MHz output, ADC sample clock and demodulator system clock.
    pub fn demod(adc_khz: u32, system_khz: u32) -> Self {
        Self {
            reference_khz: REFERENCE_KHZ,
            target_a_khz: Some(FIXED_OUTPUT_KHZ),
            target_b_khz: Some(adc_khz),
            system_khz: Some(system_khz),
        }
    }
}

/// Result of a successful PLL search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockPlan {
    pub reference_khz: u32,
    pub target_a_khz: Option<u32>,
    pub target_b_khz: Option<u32>,
    pub system_target_khz: Option<u32>,
    pub m: u32,
    pub n: u32,
    pub od_a: u8,
    pub od_b: u8,
    pub xd_a: u32,
    pub xd_b: u32,
    pub vco_hz: u64,
    /// Feedback divide-by-two feeding the system clock divider.
    pub div2: bool,
    pub realized_a_hz: u64,
    pub realized_b_hz: u64,
    pub system_divider: Option<u32>,
    pub realized_system_hz: Option<u64>,
    /// Sum of absolute output errors.
    pub error_hz: u64,
}

impl ClockPlan {
    /// ADC PLL control word: M, N, post-dividers, feedback rule, enable.
    pub fn pll_control_word(&self) -> u32 {
        (self.m & 0x1ff)
            | ((self.n & 0x1f) << 9)
            | ((u32::from(self.od_a) & 0x3) << 14)
            | ((u32::from(self.od_b) & 0x3) << 16)
            | (u32::from(self.div2) << 18)
            | (1 << 30)
    }

    /// Output divider word: xd_a and xd_b with their enables.
    pub fn divider_word(&self) -> u32 {
        let mut word = 0;
        if self.target_a_khz.is_some() {
            word |= (self.xd_a & 0x7f) | (1 << 7);
        }
        if self.target_b_khz.is_some() {
            word |= ((self.xd_b & 0x7f) << 8) | (1 << 15);
        }
        word
    }

    /// Demodulator clock gate word: divider, enable, source select.
    pub fn demod_clock_word(&self) -> Option<u32> {
        self.system_divider
            .map(|div| (div & 0x7f) | (1 << 8) | (3 << 9))
    }
}

struct Output {
    xd: u64,
    realized: u64,
}

fn divide(vco: u64, shift: u8, target: u64) -> Option<Output> {
    let post = vco >> shift;
    let xd = post / target;
    if xd == 0 {
        return None;
    }
    Some(Output {
        xd,
        realized: post / xd,
    })
}

fn validate(target: Option<u32>, limits: &PllLimits) -> std::result::Result<(), ClockSynthesisError> {
    match target {
        Some(khz) if khz == 0 || khz > limits.vco_max_khz => {
            Err(ClockSynthesisError::InvalidTarget(khz))
        }
        _ => Ok(()),
    }
}

/// Search M in 1..=511 with N = 1 for the VCO that best realises the request.
///
/// Candidates are visited with M ascending, then od_a, then od_b; a candidate
/// replaces the best one only with a strictly smaller error, so the first
/// minimum wins.
pub fn synthesize(
    limits: &PllLimits,
    request: &ClockRequest,
) -> std::result::Result<ClockPlan, ClockSynthesisError> {
    validate(request.target_a_khz, limits)?;
    validate(request.target_b_khz, limits)?;
    validate(request.system_khz, limits)?;
    if request.target_a_khz.is_none() && request.target_b_khz.is_none() {
        return Err(ClockSynthesisError::InvalidTarget(0));
    }

    let osc = u64::from(request.reference_khz) * UNITS_PER_KHZ;
    let fa = request.target_a_khz.map(|k| u64::from(k) * UNITS_PER_KHZ);
    let fb = request.target_b_khz.map(|k| u64::from(k) * UNITS_PER_KHZ);
    let vco_min = u64::from(limits.vco_min_khz) * UNITS_PER_KHZ;
    let vco_max = u64::from(limits.vco_max_khz) * UNITS_PER_KHZ;

    // Disabled outputs collapse to a single divider choice.
    let shifts_a: &[u8] = if fa.is_some() { &OUTPUT_SHIFTS[..] } else { &OUTPUT_SHIFTS[..1] };
    let shifts_b: &[u8] = if fb.is_some() { &OUTPUT_SHIFTS[..] } else { &OUTPUT_SHIFTS[..1] };

    let mut best: Option<ClockPlan> = None;
    let mut best_err = ERROR_CEILING;

    for m in 1..=M_MAX {
        let mut vco = osc * u64::from(m) / u64::from(N_FIXED);
        if limits.prescale_by_two {
            vco /= 2;
        }
        if vco < vco_min || vco > vco_max {
            continue;
        }

        for &od_a in shifts_a {
            let out_a = match fa {
                Some(f) => match divide(vco, od_a, f) {
                    Some(out) => Some((out, f)),
                    None => continue,
                },
                None => None,
            };
            for &od_b in shifts_b {
                let out_b = match fb {
                    Some(f) => match divide(vco, od_b, f) {
                        Some(out) => Some((out, f)),
                        None => continue,
                    },
                    None => None,
                };

                let err = out_a.as_ref().map(|(o, f)| o.realized.abs_diff(*f)).unwrap_or(0)
                    + out_b.as_ref().map(|(o, f)| o.realized.abs_diff(*f)).unwrap_or(0);
                if err >= best_err {
                    continue;
                }
                best_err = err;
                best = Some(ClockPlan {
                    reference_khz: request.reference_khz,
                    target_a_khz: request.target_a_khz,
                    target_b_khz: request.target_b_khz,
                    system_target_khz: request.system_khz,
                    m,
                    n: N_FIXED,
                    od_a,
                    od_b,
                    xd_a: out_a.as_ref().map(|(o, _)| o.xd as u32).unwrap_or(0),
                    xd_b: out_b.as_ref().map(|(o, _)| o.xd as u32).unwrap_or(0),
                    vco_hz: vco * HZ_PER_UNIT,
                    div2: limits.div2(vco),
                    realized_a_hz: out_a.as_ref().map(|(o, _)| o.realized).unwrap_or(0) * HZ_PER_UNIT,
                    realized_b_hz: out_b.as_ref().map(|(o, _)| o.realized).unwrap_or(0) * HZ_PER_UNIT,
                    system_divider: None,
                    realized_system_hz: None,
                    error_hz: err * HZ_PER_UNIT,
                });
            }
        }
    }

    let mut plan = best.ok_or(ClockSynthesisError::NoSolution {
        reference_khz: request.reference_khz,
        target_a_khz: request.target_a_khz.unwrap_or(0),
        target_b_khz: request.target_b_khz.unwrap_or(0),
    })?;

    if let Some(sys_khz) = request.system_khz {
        let vco = plan.vco_hz / HZ_PER_UNIT;
        let feed = vco / (1 + u64::from(plan.div2));
        let ratio = feed / (u64::from(sys_khz) * UNITS_PER_KHZ);
        if ratio == 0 {
            return Err(ClockSynthesisError::InvalidTarget(sys_khz));
        }
        let div = ratio - 1;
        plan.system_divider = Some(div as u32);
        plan.realized_system_hz = Some(feed / (div + 1) * HZ_PER_UNIT);
    }

    Ok(plan)
}

/// DVB-C sampling clock source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DvbcClockMode {
    /// ADC-driven 25/200 MHz, needed for QAM128.
    #[default]
    Adc,
    /// Crystal-driven 24/72 MHz.
    Crystal,
}

/// (ADC, demodulator) clock pair in kHz for a standard.
pub fn demod_clock_pair(mode: DemodMode, variant: ChipVariant, dvbc: DvbcClockMode) -> (u32, u32) {
    match mode {
        DemodMode::Dvbc => match dvbc {
            DvbcClockMode::Adc => (25_000, 200_000),
            DvbcClockMode::Crystal => (24_000, 72_000),
        },
        DemodMode::Dvbt | DemodMode::Isdbt => (24_000, 60_000),
        DemodMode::Atsc => (24_000, 225_000),
        DemodMode::Dtmb => {
            if variant.capabilities().dtmb == EngineVersion::V2 {
                (25_000, 200_000)
            } else if variant == ChipVariant::Txl {
                (25_000, 225_000)
            } else {
                (24_000, 225_000)
            }
        }
        DemodMode::Unknown => (24_000, 72_000),
    }
}

/// Program a plan into the clock controller.
pub fn apply(regs: &Regs<'_>, plan: &ClockPlan) -> Result<()> {
    regs.write(AddressSpace::Hiu, reg::ADC_PLL_CNTL, plan.pll_control_word())?;
    regs.write(AddressSpace::Hiu, reg::ADC_PLL_CNTL2, plan.divider_word())?;
    if let Some(word) = plan.demod_clock_word() {
        regs.write(AddressSpace::Hiu, reg::DEMOD_CLK_CNTL, word)?;
    }
    debug!(
        "[Clock] M={} N={} od=({},{}) xd=({},{}) vco={}Hz sys_div={:?}",
        plan.m, plan.n, plan.od_a, plan.od_b, plan.xd_a, plan.xd_b, plan.vco_hz, plan.system_divider
    );
    Ok(())
}

/// Return the clock controller to its power-on state (PLL off, gate closed).
pub fn power_down(regs: &Regs<'_>) -> Result<()> {
    regs.write(AddressSpace::Hiu, reg::ADC_PLL_CNTL, 0)?;
    regs.write(AddressSpace::Hiu, reg::ADC_PLL_CNTL2, 0)?;
    regs.write(AddressSpace::Hiu, reg::DEMOD_CLK_CNTL, 0)?;
    Ok(())
}

/// Search and program the clock pair for a standard.
///
/// On failure nothing is written and the caller keeps its previous plan.
pub fn configure(
    regs: &Regs<'_>,
    variant: ChipVariant,
    adc_khz: u32,
    system_khz: u32,
) -> Result<ClockPlan> {
    let limits = PllLimits::for_variant(variant);
    let request = ClockRequest::demod(adc_khz, system_khz);
    match synthesize(&limits, &request) {
        Ok(plan) => {
            apply(regs, &plan)?;
            info!(
                "[Clock] adc {}kHz demod {}kHz -> vco {}Hz, error {}Hz",
                adc_khz, system_khz, plan.vco_hz, plan.error_hz
            );
            Ok(plan)
        }
        Err(e) => {
            error!("[Clock] adc {}kHz demod {}kHz: {}", adc_khz, system_khz, e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(limits: &PllLimits, plan: &ClockPlan) {
        let vco_khz = plan.vco_hz / 1000;
        assert!(vco_khz >= u64::from(limits.vco_min_khz), "vco below range: {:?}", plan);
        assert!(vco_khz <= u64::from(limits.vco_max_khz), "vco above range: {:?}", plan);
        if plan.target_a_khz.is_some() {
            let post = (plan.vco_hz / 100) >> plan.od_a;
            assert_eq!(plan.realized_a_hz, post / u64::from(plan.xd_a) * 100);
        }
        if plan.target_b_khz.is_some() {
            let post = (plan.vco_hz / 100) >> plan.od_b;
            assert_eq!(plan.realized_b_hz, post / u64::from(plan.xd_b) * 100);
        }
    }

    #[test]
    fn test_txl_dvbc_pair() {
        let limits = PllLimits::for_family(PllFamily::Txl);
        let plan = synthesize(&limits, &ClockRequest::demod(25_000, 200_000)).unwrap();
        assert_eq!(plan.m, 75);
        assert_eq!(plan.vco_hz, 900_000_000);
        assert_eq!(plan.od_a, 1);
        assert_eq!(plan.xd_a, 18);
        assert_eq!(plan.realized_a_hz, 25_000_000);
        assert_eq!(plan.realized_b_hz, 25_000_000);
        assert_eq!(plan.error_hz, 0);
        assert!(plan.div2);
        assert_eq!(plan.system_divider, Some(1));
        assert_eq!(plan.realized_system_hz, Some(225_000_000));
    }

    #[test]
    fn test_legacy_feedback_divider_rule() {
        let limits = PllLimits::for_family(PllFamily::Legacy);
        let plan = synthesize(&limits, &ClockRequest::demod(25_000, 200_000)).unwrap();
        assert_eq!(plan.m, 50);
        assert_eq!(plan.vco_hz, 1_200_000_000);
        assert!(plan.div2);
        assert_eq!(plan.system_divider, Some(2));
        assert_eq!(plan.realized_system_hz, Some(200_000_000));

        let low = synthesize(&limits, &ClockRequest::demod(24_000, 60_000)).unwrap();
        assert_eq!(low.div2, low.vco_hz > 1_000_000_000);
        assert_consistent(&limits, &low);
    }

    #[test]
    fn test_every_plan_in_range() {
        for family in [PllFamily::Legacy, PllFamily::Txl] {
            let limits = PllLimits::for_family(family);
            for adc in (20_000..=30_000).step_by(500) {
                for sys in [60_000, 72_000, 200_000, 225_000] {
                    match synthesize(&limits, &ClockRequest::demod(adc, sys)) {
                        Ok(plan) => assert_consistent(&limits, &plan),
                        Err(e) => assert!(matches!(e, ClockSynthesisError::NoSolution { .. })),
                    }
                }
            }
        }
    }

    #[test]
    fn test_unreachable_target_fails() {
        let limits = PllLimits::for_family(PllFamily::Txl);
        let request = ClockRequest {
            reference_khz: REFERENCE_KHZ,
            target_a_khz: Some(600_000),
            target_b_khz: None,
            system_khz: None,
        };
        assert!(matches!(
            synthesize(&limits, &request),
            Err(ClockSynthesisError::NoSolution { .. })
        ));

        let zero = ClockRequest::demod(0, 200_000);
        assert_eq!(
            synthesize(&limits, &zero),
            Err(ClockSynthesisError::InvalidTarget(0))
        );
    }

    #[test]
    fn test_search_is_deterministic() {
        let limits = PllLimits::for_variant(ChipVariant::Txlx);
        let request = ClockRequest::demod(24_000, 225_000);
        let first = synthesize(&limits, &request).unwrap();
        let second = synthesize(&limits, &request).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_clock_pairs() {
        assert_eq!(
            demod_clock_pair(DemodMode::Dtmb, ChipVariant::Gxtvbb, DvbcClockMode::Adc),
            (25_000, 200_000)
        );
        assert_eq!(
            demod_clock_pair(DemodMode::Dtmb, ChipVariant::Txl, DvbcClockMode::Adc),
            (25_000, 225_000)
        );
        assert_eq!(
            demod_clock_pair(DemodMode::Dtmb, ChipVariant::Tl1, DvbcClockMode::Adc),
            (24_000, 225_000)
        );
        assert_eq!(
            demod_clock_pair(DemodMode::Dvbc, ChipVariant::Txl, DvbcClockMode::Crystal),
            (24_000, 72_000)
        );
    }

    #[test]
    fn test_register_words() {
        let limits = PllLimits::for_family(PllFamily::Txl);
        let plan = synthesize(&limits, &ClockRequest::demod(25_000, 200_000)).unwrap();
        let word = plan.pll_control_word();
        assert_eq!(word & 0x1ff, 75);
        assert_eq!((word >> 9) & 0x1f, 1);
        assert_ne!(word & (1 << 30), 0);
        assert_eq!(plan.divider_word() & 0x7f, 18);
        assert_eq!(plan.demod_clock_word().map(|w| w & 0x7f), Some(1));
    }
}
