pub mod error;
pub mod backoff;
pub mod channel;
pub mod calls;
pub mod edge;
pub mod client;
pub mod validate;
pub mod chain;
pub mod bns;
pub mod pool;
pub mod port;
pub mod dialer;

pub use client::{Client, Config};
pub use dialer::{DiodeConn, Protocol, ServerPool};
pub use error::{Error, Result};
