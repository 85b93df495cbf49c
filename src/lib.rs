//! beocontrol - event router and source lifecycle manager
//!
//! This library provides:
//! - The event router: dispatches remote-control actions to sources,
//!   the volume adapter, or an external home-automation transport
//! - The source registry: lifecycle states and active-source exclusivity
//! - `SourceBase` / `PlayerBase` / `VolumeAdapter`: the capability-set
//!   interfaces every source, player, and volume output implements
//! - The CD source: drive watcher, metadata lookup, gapless chapter
//!   playback engine, TTS announcement, and rip-to-USB

// =============================================================================
// Lints - Enforce code quality and consistency
// =============================================================================
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod bus;
pub mod config;
pub mod error;
pub mod model;
pub mod player_base;
pub mod registry;
pub mod router;
pub mod source_base;
pub mod sources;
pub mod transport;
pub mod volume;
pub mod watchdog;

pub use error::{Error, Result};
