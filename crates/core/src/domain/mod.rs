pub mod actor;
pub mod deviation;
