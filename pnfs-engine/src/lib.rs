#[macro_use]
extern crate tracing;
extern crate snafu;

pub mod client;
pub mod constants;
pub mod core;
pub mod deviceid;
pub mod driver;
pub mod logger;
pub mod server;
pub mod subsys;
