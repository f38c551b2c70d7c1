//! Terminal output.

mod output;
mod progress;

pub use output::*;
pub use progress::PlanProgress;
