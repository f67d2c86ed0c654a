//! Common test utilities and fixtures.

pub mod memory;
pub mod postgres;

#[allow(unused_imports)]
pub use memory::*;
#[allow(unused_imports)]
pub use postgres::*;
