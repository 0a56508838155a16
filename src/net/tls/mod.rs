//! TLS layer
//!
//! Builds credential sets from configured certificate bundles, drives the
//! handshake for both roles and verifies the peer. On the server side the
//! credential bundle presented to a client is resolved from the hostname
//! the client requested via SNI; the first-registered bundle is the
//! fallback when no name (or an unknown name) is sent.

pub mod config;
pub mod context;

pub use config::{CertificateBundle, PemSource};
pub(crate) use context::{TlsContext, TlsRole, TlsSetup};
