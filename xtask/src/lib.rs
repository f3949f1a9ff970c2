//! Checklist harness for booting a system image under an emulator.
//!
//! Builds the image, runs the unit-test gate, then boots the image once per
//! checklist case, kills the emulator's process group after a fixed budget
//! and checks the captured console output for the case's fragments.

mod build;
pub mod config;
pub mod error;
mod qemu;
mod verify;

pub use build::*;
pub use config::{Checklist, HarnessConfig, TestCase};
pub use error::{HarnessError, Result};
pub use qemu::*;
pub use test::*;
pub use unit_test::*;
pub use verify::*;
