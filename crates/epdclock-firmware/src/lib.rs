#![no_std]

extern crate alloc;

pub mod clock;
pub mod i2c_bus;
pub mod net;
pub mod sensor;
pub mod storage;
