//! Machine code output for register-allocated functions.
//!
//! This crate is the last stage of an optimizing compiler. It takes a function whose
//! instructions already have registers and turns it into bytes plus the side tables a
//! runtime needs to run that code:
//!
//! - [`shorten`] computes a pessimistic block layout and then replaces long branch
//!   encodings by short ones until a fixed point is reached.
//! - [`sched`] reorders the instructions of each block for the target's pipeline. It
//!   adds register anti-dependences through pinch points first.
//! - [`emit`] writes the bytes into a [`buffer::CodeBuffer`], inserting padding and
//!   building the exception and implicit null check tables. Safepoint descriptions
//!   stream into a [`debuginfo::DebugInfoSink`].
//!
//! [`Context`] drives the whole pipeline for one function.
#![deny(missing_docs)]

/// Per-instruction logging, compiled in for debug builds and the `trace-log` feature.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(any(feature = "trace-log", debug_assertions)) {
            ::log::trace!($($tt)*);
        }
    };
}

pub use cranelift_bitset as bitset;
pub use cranelift_entity as entity;

pub mod buffer;
pub mod code_cache;
pub mod debuginfo;
pub mod emit;
pub mod ir;
pub mod isa;
pub mod sched;
pub mod settings;
pub mod shorten;
pub mod tables;
pub mod timing;

mod context;
mod result;

pub use crate::buffer::{CodeBuffer, CodeOffset, FinalizedCodeBuffer, MachLabel};
pub use crate::context::{CompiledCode, Context, OutputStats};
pub use crate::result::{ErrorKind, OutputError, OutputResult};
pub use crate::timing::{PassTimes, take_current};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
