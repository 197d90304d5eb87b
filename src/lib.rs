//! u-blox UBX receiver toolkit
//!
//! Configuration of a receiver through `UBX-CFG-VALSET` with an
//! acknowledgement handshake, logging of navigation messages to JSON lines,
//! and fusion of `NAV-PVT`, `NAV-TIMEUTC` and `NAV-HPPOSLLH` into timestamped
//! high precision measurements.

pub mod config_session;
pub mod error;
pub mod nav_fusion;
pub mod ubx_config;
pub mod ubx_frame;
pub mod ubx_logbook;
pub mod ubx_messages;

pub use error::{Error, Result};
