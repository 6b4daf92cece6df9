pub mod controller;

pub use controller::reconcile_build;
