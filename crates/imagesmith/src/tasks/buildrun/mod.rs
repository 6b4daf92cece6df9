pub mod controller;
pub mod naming;
pub mod resources;
pub mod status;

pub use controller::reconcile_build_run;
