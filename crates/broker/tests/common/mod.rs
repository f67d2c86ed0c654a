//! Common test utilities and fixtures.

pub mod broker;
pub mod postgres;
pub mod wire;

#[allow(unused_imports)]
pub use broker::*;
#[allow(unused_imports)]
pub use postgres::*;
#[allow(unused_imports)]
pub use wire::*;
