//! Capability-based object access (spec §4.9): every resource a process
//! can touch — memory, channels, other processes — is named by a handle
//! drawn from that process's own capability table, never a raw pointer.

pub mod table;

pub use table::{CapError, CapRights, CapTable, Handle, ObjectKind};
