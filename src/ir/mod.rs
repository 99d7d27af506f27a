//! Representation of the function handed to the output pipeline.

pub mod builder;
pub mod entities;
mod function;
mod instructions;
mod oopmap;
pub mod pipeline;
mod regs;
mod scope;

pub use crate::ir::builder::FunctionBuilder;
pub use crate::ir::entities::{Block, Constant, Inst, MethodRef, Opcode, OptoReg, ScopeRef};
pub use crate::ir::function::{BlockData, ConstantData, Function};
pub use crate::ir::instructions::{CallData, InstData, InstFlags, InstKind, SafePointData};
pub use crate::ir::oopmap::OopMap;
pub use crate::ir::pipeline::{AvoidAdjacent, Pipeline, PipelineInfo, ResourceMask};
pub use crate::ir::regs::{RegAssignment, RegMask, RegPair};
pub use crate::ir::scope::{MonitorInput, ScopeData, ScopeInput};
