//! Domain models for the patient sync engine.

mod operation;
mod patient;
mod status;

pub use operation::*;
pub use patient::*;
pub use status::*;
