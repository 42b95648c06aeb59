//! LSPT core: constants, errors, configuration and the capability traits
//! the rest of the crate is written against.

pub mod config;
pub mod constants;
mod error;
mod traits;

pub use config::{ProtocolConfig, ProtocolConfigBuilder};
pub use error::*;
pub use traits::*;
