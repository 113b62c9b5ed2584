//! Register access layer.
//!
//! - [`RegisterBus`]: the external seam, 32-bit reads and writes per address space
//! - [`RegisterMap`]: per-variant block offsets used to form physical addresses
//! - [`Hal`]: bus + tuner + the coarse register lock shared with background tasks
//! - [`MemoryBus`]: in-memory bus with scripted reads, used by tests and the simulator

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::trace;
use tokio::sync::{Mutex, MutexGuard};

use dtvdemod_types::{AddressSpace, ChipVariant, OffsetScheme, RegisterError, Result, TunerError};

use crate::tuner::TunerDriver;

/// A register resolved through the variant's [`RegisterMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterAddress {
    pub space: AddressSpace,
    /// Word offset inside the engine block.
    pub offset: u32,
    /// Byte address inside the aperture of `space`; demodulator blocks
    /// share one aperture and are placed by the offset scheme.
    pub physical: u32,
}

/// Register bus backing the demodulator.
///
/// Implementations address the hardware by `physical`; `space` selects
/// the aperture (demodulator, clock controller, always-on, reset).
pub trait RegisterBus: Send + Sync {
    fn read32(&self, addr: RegisterAddress) -> std::result::Result<u32, RegisterError>;
    fn write32(&self, addr: RegisterAddress, value: u32) -> std::result::Result<(), RegisterError>;
}

/// Word offsets of each engine block inside the demodulator aperture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub top: u32,
    pub dvbc: u32,
    pub dvbt: u32,
    pub atsc: u32,
    pub dtmb: u32,
    pub front: u32,
}

impl RegisterMap {
    pub fn for_scheme(scheme: OffsetScheme) -> Self {
        match scheme {
            OffsetScheme::V2 => Self {
                top: 0xc00,
                dvbc: 0x400,
                dvbt: 0x000,
                atsc: 0x000,
                dtmb: 0x000,
                front: 0x000,
            },
            OffsetScheme::V3 => Self {
                top: 0xf00,
                dvbc: 0xc00,
                dvbt: 0x400,
                atsc: 0x800,
                dtmb: 0x000,
                front: 0x000,
            },
            OffsetScheme::V4 => Self {
                top: 0x3c00,
                dvbc: 0x1000,
                dvbt: 0x0400,
                atsc: 0x0c00,
                dtmb: 0x0000,
                front: 0x3800,
            },
        }
    }

    pub fn for_variant(variant: ChipVariant) -> Self {
        Self::for_scheme(variant.capabilities().offsets)
    }

    /// Resolve a register to the address handed to the bus.
    pub fn resolve(&self, space: AddressSpace, offset: u32) -> RegisterAddress {
        let physical = self.address(space, offset).unwrap_or(offset << 2);
        RegisterAddress {
            space,
            offset,
            physical,
        }
    }

    /// Byte address of a register, or `None` for spaces outside the demodulator.
    pub fn address(&self, space: AddressSpace, offset: u32) -> Option<u32> {
        let base = match space {
            AddressSpace::Top => self.top,
            AddressSpace::Dvbc => self.dvbc,
            AddressSpace::Dvbt => self.dvbt,
            AddressSpace::Atsc => self.atsc,
            AddressSpace::Dtmb => self.dtmb,
            AddressSpace::Front => self.front,
            AddressSpace::Hiu | AddressSpace::Ao | AddressSpace::Reset => return None,
        };
        Some((base + offset) << 2)
    }
}

/// Hardware handles shared by the controller and its background tasks.
pub struct Hal {
    bus: Arc<dyn RegisterBus>,
    tuner: Option<Arc<dyn TunerDriver>>,
    map: RegisterMap,
    lock: Mutex<()>,
}

impl Hal {
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        tuner: Option<Arc<dyn TunerDriver>>,
        variant: ChipVariant,
    ) -> Self {
        Self {
            bus,
            tuner,
            map: RegisterMap::for_variant(variant),
            lock: Mutex::new(()),
        }
    }

    /// Take the register lock for a multi-step sequence.
    pub async fn regs(&self) -> Regs<'_> {
        Regs {
            bus: self.bus.as_ref(),
            map: &self.map,
            _guard: self.lock.lock().await,
        }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn tuner(&self) -> Option<&Arc<dyn TunerDriver>> {
        self.tuner.as_ref()
    }

    /// Tuner input power in dBm.
    pub fn tuner_strength(&self) -> std::result::Result<i32, TunerError> {
        match &self.tuner {
            Some(tuner) => tuner.get_strength(),
            None => Err(TunerError::Absent),
        }
    }
}

/// A locked register session.
pub struct Regs<'a> {
    bus: &'a dyn RegisterBus,
    map: &'a RegisterMap,
    _guard: MutexGuard<'a, ()>,
}

impl Regs<'_> {
    pub fn read(&self, space: AddressSpace, offset: u32) -> Result<u32> {
        let addr = self.map.resolve(space, offset);
        let value = self.bus.read32(addr)?;
        trace!(
            "[Regs] rd {:?}+0x{:x} (0x{:05x}) = 0x{:08x}",
            space,
            offset,
            addr.physical,
            value
        );
        Ok(value)
    }

    pub fn write(&self, space: AddressSpace, offset: u32, value: u32) -> Result<()> {
        let addr = self.map.resolve(space, offset);
        trace!(
            "[Regs] wr {:?}+0x{:x} (0x{:05x}) = 0x{:08x}",
            space,
            offset,
            addr.physical,
            value
        );
        self.bus.write32(addr, value)?;
        Ok(())
    }

    /// Read-modify-write: bits in `mask` take their value from `bits`.
    pub fn modify(&self, space: AddressSpace, offset: u32, mask: u32, bits: u32) -> Result<()> {
        let old = self.read(space, offset)?;
        self.write(space, offset, (old & !mask) | (bits & mask))
    }
}

/// One recorded register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub space: AddressSpace,
    pub offset: u32,
    /// Address the bus was driven with.
    pub physical: u32,
    pub value: u32,
}

#[derive(Default)]
struct MemoryBusState {
    values: HashMap<(AddressSpace, u32), u32>,
    scripts: HashMap<(AddressSpace, u32), VecDeque<u32>>,
    writes: Vec<RegisterWrite>,
}

/// Register bus held in memory.
///
/// Reads return the last written or preset value. A scripted register
/// returns its queued values in order, and its final value sticks.
/// Registers are keyed by engine-relative offset so presets do not depend
/// on the variant; the journal keeps the physical address of every write.
#[derive(Default)]
pub struct MemoryBus {
    state: parking_lot::Mutex<MemoryBusState>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(&self, space: AddressSpace, offset: u32, value: u32) {
        let mut state = self.state.lock();
        state.scripts.remove(&(space, offset));
        state.values.insert((space, offset), value);
    }

    /// Queue successive read results for one register.
    pub fn script<I>(&self, space: AddressSpace, offset: u32, values: I)
    where
        I: IntoIterator<Item = u32>,
    {
        let queue: VecDeque<u32> = values.into_iter().collect();
        self.state.lock().scripts.insert((space, offset), queue);
    }

    /// Current value without consuming a scripted read.
    pub fn peek(&self, space: AddressSpace, offset: u32) -> u32 {
        let state = self.state.lock();
        if let Some(next) = state.scripts.get(&(space, offset)).and_then(|q| q.front()) {
            return *next;
        }
        state.values.get(&(space, offset)).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<RegisterWrite> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Values written to one register, oldest first.
    pub fn writes_to(&self, space: AddressSpace, offset: u32) -> Vec<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.space == space && w.offset == offset)
            .map(|w| w.value)
            .collect()
    }

    /// Physical addresses written, oldest first.
    pub fn physical_writes(&self, space: AddressSpace) -> Vec<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.space == space)
            .map(|w| w.physical)
            .collect()
    }

    pub fn clear_journal(&self) {
        self.state.lock().writes.clear();
    }
}

impl RegisterBus for MemoryBus {
    fn read32(&self, addr: RegisterAddress) -> std::result::Result<u32, RegisterError> {
        let mut state = self.state.lock();
        let key = (addr.space, addr.offset);
        if let Some(queue) = state.scripts.get_mut(&key) {
            if let Some(value) = queue.pop_front() {
                if queue.is_empty() {
                    state.scripts.remove(&key);
                    state.values.insert(key, value);
                }
                return Ok(value);
            }
        }
        Ok(state.values.get(&key).copied().unwrap_or(0))
    }

    fn write32(&self, addr: RegisterAddress, value: u32) -> std::result::Result<(), RegisterError> {
        let mut state = self.state.lock();
        state.values.insert((addr.space, addr.offset), value);
        state.writes.push(RegisterWrite {
            space: addr.space,
            offset: addr.offset,
            physical: addr.physical,
            value,
        });
        Ok(())
    }
}
