//! The in-kernel bytecode VM (spec §4.12): a stack-machine interpreter for
//! sandboxed user-supplied programs, loaded as a self-contained `Module`
//! and executed by `Vm` with bounded stack/call-depth and native-call
//! bridging for host-provided functions.

pub mod module;
pub mod opcode;
pub mod vm;

pub use module::{FunctionDef, Module, ModuleBuilder, ModuleError, NativeDef};
pub use opcode::{Opcode, TrapKind};
pub use vm::{NativeFn, Vm, VmError};
