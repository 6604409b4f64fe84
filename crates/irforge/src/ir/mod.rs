//! Backend-agnostic block IR
//!
//! The register-based intermediate form the builder facade emits into.
//! One block per code section; terminators correspond to section sealing.

pub mod display;
pub mod instr;

pub use instr::{BinOp, Block, BlockId, CmpCc, FuncIr, Instr, IrType, Reg, Terminator};
