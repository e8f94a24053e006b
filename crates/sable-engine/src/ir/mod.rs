//! Trace intermediate representation
//!
//! A trace is a linear list of operations over boxes: identity-bearing
//! runtime values recorded while the meta-interpreter symbolically
//! executes guest jitcode. Constants compare by value and fold away;
//! boxes compare by identity and flow through the compiled code.

pub mod boxes;
pub mod descr;
pub mod display;
pub mod execute;
pub mod history;
pub mod ops;

pub use boxes::{ConstVal, Operand, TraceBox};
pub use descr::{ArrayDescr, CallDescr, CallEffect, DescrRef, FieldDescr, SizeDescr, SwitchDictDescr};
pub use history::History;
pub use ops::{OpNum, Operation};
