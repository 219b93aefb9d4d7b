//! The core, UI-agnostic library for the `bootstick` USB provisioning utility.
//!
//! `bootstick-core` turns a removable USB device into a bootable or data
//! stick. It can be driven by any front-end, a command-line tool like
//! `bootstick` or a graphical one. It handles device discovery and the safety
//! rules around it, partition tables, filesystem creation, ISO inspection and
//! the two ways of delivering an image.
//!
//! The library is structured into several key modules:
//! - [`platform`]: Finds USB block devices that are safe to overwrite, and
//!   watches for hotplug events.
//! - [`disk`]: Positioned, aligned I/O on a block device or image file.
//! - [`partition`]: MBR and GPT tables, written natively when running as root
//!   and through `sfdisk` otherwise.
//! - [`format`]: Runs the right `mkfs` tool with the right flags.
//! - [`iso`]: Classifies images, copies them raw with `dd`, or unpacks them
//!   onto a partition.
//! - [`provision`]: Sequences all of the above for one [`OperationDescriptor`].
//!
//! Every privileged step goes through [`privilege`], which prefixes `pkexec`
//! when the process is not root. Long-running work reports
//! [`ProgressEvent`]s and stops early when its [`cancel::CancelSignal`] fires.
//!
//! ## Example: Formatting a Stick
//!
//! ```rust,no_run
//! use bootstick_core::{Config, OperationDescriptor, Outcome, Provisioner, cancel, platform};
//! use bootstick_core::types::{FsType, PartitionStyle};
//!
//! fn main() -> bootstick_core::Result<()> {
//!     let config = Config::default();
//!     let devices = platform::enumerate(&config)?;
//!     let Some(device) = devices.first() else {
//!         println!("No removable devices found.");
//!         return Ok(());
//!     };
//!
//!     let mut op = OperationDescriptor::new(&device.path);
//!     op.style = PartitionStyle::Gpt;
//!     op.fs_type = FsType::ExFat;
//!     op.label = "DATA".to_string();
//!
//!     let (_handle, signal) = cancel::pair();
//!     let outcome = Provisioner::new(config).run(&op, &signal, |event| {
//!         println!("{}: {:.0}%", event.phase, event.fraction * 100.0);
//!     });
//!     assert_eq!(outcome, Outcome::Complete);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod device;
pub mod disk;
pub mod error;
pub mod format;
pub mod hash;
pub mod image;
pub mod iso;
pub mod partition;
pub mod platform;
pub mod privilege;
mod process;
pub mod progress;
pub mod provision;
pub mod types;

pub use config::Config;
pub use device::DeviceInfo;
pub use error::{Error, Result};
pub use progress::{Phase, ProgressEvent};
pub use provision::{Delivery, Event, OperationDescriptor, OperationHandle, Outcome, Provisioner};
