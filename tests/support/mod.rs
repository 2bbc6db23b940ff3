//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod memory_backend;
pub mod socket_guard;
