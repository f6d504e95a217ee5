//! Minimal SNTP: packet codec and a client with ordered server fallback

pub mod client;
pub mod packet;

pub use client::{NtpTransport, SyncError, SyncSample, TimeSyncClient, TransportError, commit};
