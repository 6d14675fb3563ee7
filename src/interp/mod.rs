//! Multi-threaded interpreter for verified programs
//!
//! Runs every simulated thread of one block against the simulator.

pub mod eval;
pub mod value;

pub use eval::{Execution, Interpreter};
pub use value::{AsyncToken, Value};
