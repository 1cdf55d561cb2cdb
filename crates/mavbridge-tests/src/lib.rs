#![warn(missing_docs)]

//! Integration tests for the mavbridge router.
//!
//! The router is exercised end to end against in-process peers: a mock
//! serial host for the vehicle, TCP, TLS and WebSocket listeners for the
//! cloud relay and a UDP socket for the mirror.

pub mod harness;

pub mod codec_proptest;
pub mod signing_tests;
