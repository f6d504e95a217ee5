//! Hardware-independent core library for epdclock
//!
//! This crate contains all platform-agnostic logic for the deep-sleeping
//! e-paper clock: the record that survives deep sleep, storage with a
//! fallback medium, the SNTP client, drift compensation, wake scheduling and
//! the controller that drives one wake from power-up to the next sleep.
//!
//! It is `no_std` with `extern crate alloc` so it compiles on both the
//! embedded target (ESP32) and desktop hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod clock;
pub mod config;
pub mod drift;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ntp;
pub mod persistent_state;
pub mod scheduler;
pub mod sensors;
pub mod storage;
pub mod tasks;
pub mod upload;
pub mod wake_cycle;
