pub mod build;
pub mod buildrun;
pub mod strategy;

pub use build::*;
pub use buildrun::*;
pub use strategy::*;

/// Label carrying the name of the Build a BuildRun belongs to
pub const LABEL_BUILD: &str = "imagesmith.dev/build";
/// Label carrying the name of the BuildRun an execution job belongs to
pub const LABEL_BUILD_RUN: &str = "imagesmith.dev/buildrun";
/// Label carrying the UID of the BuildRun an execution job belongs to
pub const LABEL_BUILD_RUN_UID: &str = "imagesmith.dev/buildrun-uid";
