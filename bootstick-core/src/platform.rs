//! Provides platform-specific functionality.
//!
//! This module contains the logic for talking to the kernel about block
//! devices: discovering safe targets, reading the mount table, and watching
//! for hotplug events. Only Linux is supported; the submodules read sysfs and
//! procfs directly.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "linux")]
pub mod monitor;
pub mod mounts;
