//! Control plane of a multi-standard digital-TV demodulator.
//!
//! Layering, leaves first:
//! - [`regs`] / [`tuner`]: register bus and tuner seams
//! - [`timer`]: named acquisition timers
//! - [`clock`]: PLL search and clock-tree programming
//! - [`standard`]: per-standard drivers (DVB-C, DVB-T/ISDB-T, ATSC, DTMB)
//! - [`atsc_search`], [`dtmb_poll`]: acquisition search and background lock maintenance
//! - [`tuning`]: re-tune vs poll decisions
//! - [`mode`]: mode lifecycle
//! - [`frontend`]: control surface exposed to callers

pub mod atsc_search;
pub mod clock;
pub mod config;
pub mod dtmb_poll;
pub mod frontend;
pub mod logging;
pub mod mode;
pub mod power;
pub mod regs;
pub mod standard;
pub mod task;
pub mod timer;
pub mod tuner;
pub mod tuning;

pub use config::DemodConfig;
pub use dtvdemod_types as types;
pub use frontend::Frontend;
pub use mode::ModeController;
pub use standard::TuneOutcome;
