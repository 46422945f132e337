//! Runtime components for supervising processes

pub mod dependency;
pub mod events;
pub mod output;
pub mod process;
pub mod readiness;
pub mod restart;
pub mod supervisor;

pub use dependency::*;
pub use events::*;
pub use output::*;
pub use process::*;
pub use readiness::*;
pub use restart::*;
pub use supervisor::*;
