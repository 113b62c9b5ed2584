//! Power domain, pin-mux and top-level mode selection.

use log::debug;

use dtvdemod_types::{AddressSpace, ChipVariant, DemodMode, EngineVersion, Result};

use crate::regs::Regs;

pub mod reg {
    /// Always-on domain sleep control, bit 10 gates the demodulator.
    pub const AO_PWR_SLEEP0: u32 = 0x3a;
    /// Always-on domain isolation, bits 14-15.
    pub const AO_PWR_ISO0: u32 = 0x3b;
    /// AGC pin-mux select.
    pub const AO_PINMUX_AGC: u32 = 0x14;
    pub const HIU_DEMOD_MEM_PD: u32 = 0x43;
    pub const HIU_VDAC_CNTL0: u32 = 0xbd;
    pub const RESET0_LEVEL: u32 = 0x20;

    pub const TOP_REG0: u32 = 0x00;
    pub const TOP_REG4: u32 = 0x01;
    pub const TOP_REG8: u32 = 0x02;
    /// DTMB memory arbiter.
    pub const TOP_REGC: u32 = 0x03;
}

const SLEEP_BIT: u32 = 1 << 10;
const ISO_BITS: u32 = 0x3 << 14;
const MEM_PD_MASK: u32 = 0x2fff;
const RESET_BIT: u32 = 1 << 8;
const AGC_PINMUX_BIT: u32 = 1 << 0;
const VDAC_ENABLE_BIT: u32 = 1 << 0;

/// Power the demodulator domain up or down.
///
/// Up: wake, power memories, hold reset, drop isolation, release reset.
/// Down runs the reverse order.
pub fn switch(regs: &Regs<'_>, variant: ChipVariant, on: bool) -> Result<()> {
    if variant == ChipVariant::Gxlx {
        debug!("[Power] {}: memory only", variant);
        return set_memory(regs, on);
    }

    if on {
        debug!("[Power] demod domain on");
        regs.modify(AddressSpace::Ao, reg::AO_PWR_SLEEP0, SLEEP_BIT, 0)?;
        set_memory(regs, true)?;
        regs.modify(AddressSpace::Reset, reg::RESET0_LEVEL, RESET_BIT, 0)?;
        regs.modify(AddressSpace::Ao, reg::AO_PWR_ISO0, ISO_BITS, 0)?;
        regs.modify(AddressSpace::Reset, reg::RESET0_LEVEL, RESET_BIT, RESET_BIT)?;
    } else {
        debug!("[Power] demod domain off");
        regs.modify(AddressSpace::Ao, reg::AO_PWR_ISO0, ISO_BITS, ISO_BITS)?;
        set_memory(regs, false)?;
        regs.modify(AddressSpace::Ao, reg::AO_PWR_SLEEP0, SLEEP_BIT, SLEEP_BIT)?;
    }
    Ok(())
}

fn set_memory(regs: &Regs<'_>, on: bool) -> Result<()> {
    let bits = if on { 0 } else { MEM_PD_MASK };
    regs.modify(AddressSpace::Hiu, reg::HIU_DEMOD_MEM_PD, MEM_PD_MASK, bits)
}

pub fn set_agc_pinmux(regs: &Regs<'_>, on: bool) -> Result<()> {
    let bits = if on { AGC_PINMUX_BIT } else { 0 };
    regs.modify(AddressSpace::Ao, reg::AO_PINMUX_AGC, AGC_PINMUX_BIT, bits)
}

pub fn set_vdac(regs: &Regs<'_>, on: bool) -> Result<()> {
    let bits = if on { VDAC_ENABLE_BIT } else { 0 };
    regs.modify(AddressSpace::Hiu, reg::HIU_VDAC_CNTL0, VDAC_ENABLE_BIT, bits)
}

/// Top configuration word routing the ADC and transport stream to one engine.
pub fn mode_word(mode: DemodMode, variant: ChipVariant) -> u32 {
    // mode[3:0] ts_sel[7:4] adc_format[8] adc_regout[9] adc_regadj[12:10]
    let pack = |mode: u32, ts: u32, format: u32, regout: u32, regadj: u32| {
        (mode & 0xf) | ((ts & 0xf) << 4) | (format << 8) | (regout << 9) | ((regadj & 0x7) << 10)
    };
    let tl1 = variant == ChipVariant::Tl1;
    match mode {
        DemodMode::Dtmb if tl1 => pack(1, 1, 0, 0, 0),
        DemodMode::Dtmb => pack(1, 1, 1, 1, 0),
        DemodMode::Dvbt | DemodMode::Isdbt => pack(1 << 1, 1 << 1, 0, 0, 0),
        DemodMode::Atsc if tl1 => pack(1 << 2, 1 << 2, 0, 1, 0),
        DemodMode::Atsc => pack(1 << 2, 1 << 2, 0, 1, 2),
        DemodMode::Dvbc if variant.capabilities().dvbc == EngineVersion::V2 => pack(7, 2, 1, 0, 0),
        DemodMode::Dvbc => pack(1 << 3, 1 << 3, 0, 0, 0),
        DemodMode::Unknown => pack(0, 0, 1, 1, 0),
    }
}

/// Route the top block to a standard and enable the ADC bias.
pub fn select_mode(regs: &Regs<'_>, mode: DemodMode, variant: ChipVariant) -> Result<()> {
    regs.write(AddressSpace::Top, reg::TOP_REG0, mode_word(mode, variant))?;
    // biasgen_en | en_adc
    regs.write(AddressSpace::Top, reg::TOP_REG8, 0x201)?;
    Ok(())
}

/// Open or close the DTMB memory arbiter.
pub fn set_dtmb_arbiter(regs: &Regs<'_>, open: bool) -> Result<()> {
    regs.write(AddressSpace::Top, reg::TOP_REGC, if open { 0x8 } else { 0x0 })
}

/// Point the capture engine at a reserved buffer.
pub fn set_capture_base(regs: &Regs<'_>, base: u32) -> Result<()> {
    regs.write(AddressSpace::Top, reg::TOP_REG4, base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{Hal, MemoryBus};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_power_cycle_restores_bits() {
        let bus = Arc::new(MemoryBus::new());
        bus.preset(AddressSpace::Ao, reg::AO_PWR_SLEEP0, SLEEP_BIT);
        bus.preset(AddressSpace::Ao, reg::AO_PWR_ISO0, ISO_BITS);
        bus.preset(AddressSpace::Hiu, reg::HIU_DEMOD_MEM_PD, MEM_PD_MASK);
        let hal = Hal::new(bus.clone(), None, ChipVariant::Txlx);
        let regs = hal.regs().await;

        switch(&regs, ChipVariant::Txlx, true).unwrap();
        assert_eq!(bus.peek(AddressSpace::Ao, reg::AO_PWR_SLEEP0) & SLEEP_BIT, 0);
        assert_eq!(bus.peek(AddressSpace::Ao, reg::AO_PWR_ISO0) & ISO_BITS, 0);
        assert_eq!(bus.peek(AddressSpace::Hiu, reg::HIU_DEMOD_MEM_PD), 0);
        assert_eq!(
            bus.writes_to(AddressSpace::Reset, reg::RESET0_LEVEL),
            vec![0, RESET_BIT]
        );

        switch(&regs, ChipVariant::Txlx, false).unwrap();
        assert_eq!(bus.peek(AddressSpace::Ao, reg::AO_PWR_SLEEP0) & SLEEP_BIT, SLEEP_BIT);
        assert_eq!(bus.peek(AddressSpace::Ao, reg::AO_PWR_ISO0) & ISO_BITS, ISO_BITS);
    }

    #[tokio::test]
    async fn test_gxlx_switches_memory_only() {
        let bus = Arc::new(MemoryBus::new());
        let hal = Hal::new(bus.clone(), None, ChipVariant::Gxlx);
        let regs = hal.regs().await;
        switch(&regs, ChipVariant::Gxlx, false).unwrap();
        assert!(bus.writes_to(AddressSpace::Ao, reg::AO_PWR_SLEEP0).is_empty());
        assert_eq!(bus.peek(AddressSpace::Hiu, reg::HIU_DEMOD_MEM_PD), MEM_PD_MASK);
    }

    #[test]
    fn test_mode_words_differ_per_engine() {
        let chip = ChipVariant::Txlx;
        let words = [
            mode_word(DemodMode::Dvbc, chip),
            mode_word(DemodMode::Dvbt, chip),
            mode_word(DemodMode::Atsc, chip),
            mode_word(DemodMode::Dtmb, chip),
        ];
        for (i, a) in words.iter().enumerate() {
            for b in &words[i + 1..] {
                assert_ne!(a & 0xf, b & 0xf);
            }
        }
        assert_eq!(mode_word(DemodMode::Dvbc, ChipVariant::Txl) & 0xf, 7);
    }
}
