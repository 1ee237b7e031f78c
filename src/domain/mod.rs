//! Domain models - C-Bus addressing, events and commands
//!
//! This module contains the canonical data types used throughout the bridge:
//! - `Address` - a C-Bus (network, application, group) triple
//! - `CbusEvent` - a parsed line from the C-Gate event channel
//! - `WriteCommand` - a parsed MQTT write-topic command
//! - level scaling between the 0-255 wire range and 0-100 percent

pub mod commands;
pub mod events;
pub mod types;
