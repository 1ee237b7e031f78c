//! Services - bridge logic and state management
//!
//! This module contains the core bridge logic:
//! - `bridge` - orchestrator owning all bridge state and readiness
//! - `throttle` - paced FIFO dispatch queues
//! - `responses` - command-channel response classification
//! - `publisher` - C-Bus event to MQTT state/level publications
//! - `router` - MQTT write commands to C-Gate command lines
//! - `tracker` - last-known levels and relative-ramp resolution
//! - `discovery` - tree-XML driven Home Assistant discovery

pub mod bridge;
pub mod discovery;
pub mod publisher;
pub mod responses;
pub mod router;
pub mod throttle;
pub mod tracker;

// Re-export commonly used types
pub use bridge::{Bridge, BridgeInputs, MqttDispatcher, PoolDispatcher};
pub use discovery::Discovery;
pub use publisher::EventPublisher;
pub use responses::{ResponseAction, ResponseProcessor};
pub use router::CommandRouter;
pub use throttle::{QueueConsumer, QueueHandle, ThrottledQueue};
pub use tracker::LevelTracker;
