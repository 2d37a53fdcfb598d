#[macro_use]
extern crate log;

pub mod calibration;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod facade;
pub mod frame;
pub mod meter;
pub mod net;
pub mod probe;
pub mod pumpcmd;
pub mod pumps;
pub mod recipe;
pub mod record;
pub mod serial;
pub mod task;
