//! Small shared helpers

pub mod general;
