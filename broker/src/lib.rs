#[macro_use]
extern crate log;

pub mod broker;
pub mod server;
