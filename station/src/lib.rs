#[macro_use]
extern crate log;

pub mod cli;
pub mod pause;
pub mod runlog;
pub mod scheduler;
