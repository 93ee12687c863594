//! Backend abstraction layer
//!
//! Provides the device trait plus the in-memory dummy device and, behind the
//! `vulkan-backend` feature, the native Vulkan device.

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::{DeviceCall, DummyConfig, DummyDevice, DummyFailure, ScriptedOutcome};
pub use traits::*;
pub use types::*;
