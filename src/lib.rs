//! # EvseBridge — Alfen EV Charger Driver for Victron Venus OS
//!
//! Bridges an Alfen NG9xx EV charger's Modbus TCP register file with a
//! Victron GX system over D-Bus, and layers MANUAL/AUTO/SCHEDULED charging
//! policy, session tracking, and a local HTTP management API on top.
//!
//! ## Architecture
//!
//! - `config`: configuration loading and validation
//! - `logging`: structured logging and tracing
//! - `modbus`: Modbus TCP client for charger communication
//! - `driver`: core control-loop state machine
//! - `status`: canonical charger status derivation
//! - `dbus`: D-Bus integration for Venus OS
//! - `web`: local HTTP management API
//! - `persistence`: atomic on-disk state
//! - `session`: charging session tracking
//! - `controls`: charging mode policy
//! - `pricefeed`: dynamic price feed integration

pub mod config;
pub mod controls;
pub mod dbus;
pub mod driver;
pub mod error;
pub mod logging;
pub mod modbus;
pub mod persistence;
pub mod pricefeed;
pub mod session;
pub mod status;
pub mod web;

pub use config::Config;
pub use driver::ChargerEngine;
pub use error::{BridgeError, Result};
