//! BDD step definitions for the TeamCity bridge

pub mod command_steps;
pub mod lifecycle_steps;
pub mod polling_steps;
pub mod subscription_steps;
