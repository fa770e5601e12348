pub mod admin;
pub mod queue;
