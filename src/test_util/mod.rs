//! Utilities for testing code on top of this crate: a registered test message, a recording
//!  message sink and helpers for wiring channels over loopback sockets. They are regular
//!  (non-`#[cfg(test)]`) code so that applications can use them in their own tests.

pub mod channel;
pub mod message;
