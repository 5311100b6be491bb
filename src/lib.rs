// A GB28181 SIP transport and transaction engine

pub mod config;
pub mod error;
pub mod manscdp;
pub mod message;
pub mod observer;
pub mod router;
pub mod server;
pub mod transaction;
pub mod transport;

pub use config::ServerConfig;
pub use error::Error;
pub use server::{Server, ServerBuilder};
pub type Result<T> = std::result::Result<T, crate::error::Error>;

pub const VERSION: &str = concat!("gbsip/", env!("CARGO_PKG_VERSION"));
