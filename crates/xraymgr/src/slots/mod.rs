//! Blue/green slot management.

mod controller;
mod marker;
mod process;

pub use controller::{PublishOutcome, SlotPhase, SlotStatus, SlotSwitchController, SwitchError};
pub use marker::{Slot, read_marker, write_atomic, write_marker};
pub use process::{ConfigValidator, ProcessController, SystemdController, probe_tcp};
