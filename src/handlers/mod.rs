//! Per-channel handler logic (spec.md §4.9, component #8).

pub mod control;
pub mod input;
pub mod sensors;

pub use control::{ControlHandler, ServiceDiscoveryResponse, VideoServiceConfig};
pub use input::{InputHandler, KeyEvent, ScrollEvent, TouchEvent, TouchAction};
pub use sensors::{SensorHandler, SensorType};
