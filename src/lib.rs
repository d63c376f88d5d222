pub mod config;
pub mod controller;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod lookup;
pub mod message;
pub mod nexthop;
pub mod pipe;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod smtp;
pub mod spool;
pub mod status;
pub mod traits;

pub use tracing;
