//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `framer` - newline framing for the C-Gate byte streams
//! - `cgate` - one C-Gate TCP connection with reconnect and handshake
//! - `pool` - command connection pool with round-robin dispatch
//! - `mqtt` - MQTT client wrapper (will/birth, subscription, publish)

pub mod cgate;
pub mod framer;
pub mod mqtt;
pub mod pool;

// Re-export commonly used types
pub use cgate::{Backoff, CgateConnection, CgateLink, ChannelKind, LinkEvent, LinkStatus};
pub use framer::LineFramer;
pub use mqtt::{start_mqtt, MqttHandle, MqttIncoming, MqttMessage};
pub use pool::{CgatePool, PoolError};
