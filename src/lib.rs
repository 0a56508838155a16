//! domonet - TCP/TLS transport core for a home-automation platform
//!
//! This crate provides the socket engine used by the platform's RPC and
//! device-communication layers: an outbound TCP client with optional TLS,
//! and a multi-threaded listening server with SNI-based selection among
//! multiple certificate bundles.

pub mod net;
