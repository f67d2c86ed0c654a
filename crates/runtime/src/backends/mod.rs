//! Container runtime backends.

pub mod docker;
pub mod memory;
