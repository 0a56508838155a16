//! TLS credential sets and handshake state machine
//!
//! One credential object (`SslContext`) is built per configured certificate
//! bundle, in registration order; rebuilding a context drops the previous
//! set first, and construction failure partway through releases everything
//! already built. Handshakes run on non-blocking sockets and are retried
//! only while the TLS layer reports a non-fatal would-block condition, with
//! a bounded readiness wait between attempts.

use super::config::{CertificateBundle, PemSource};
use crate::net::fd::{poll_fd, PollEvents};
use crate::net::{Result, SocketError};
use openssl::dh::Dh;
use openssl::pkey::Params;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, HandshakeError, NameType, Ssl, SslContext, SslContextBuilder, SslMethod, SslStream,
    SslVerifyMode, SniError,
};
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use openssl_sys::{
    X509_V_ERR_CERT_HAS_EXPIRED, X509_V_ERR_CERT_NOT_YET_VALID, X509_V_ERR_CERT_REVOKED,
    X509_V_ERR_CERT_SIGNATURE_FAILURE,
};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

/// Role the credential set is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsRole {
    Client,
    Server,
}

/// Input for building a [`TlsContext`]
pub(crate) struct TlsSetup {
    pub role: TlsRole,
    pub bundles: Vec<(String, CertificateBundle)>,
    pub dh_params: Option<PemSource>,
    pub require_client_cert: bool,
    pub verify_certificate: bool,
    pub verify_hostname: bool,
}

/// Built credential sets plus the session factory context.
///
/// Immutable once built; handshakes hold reference-counted handles, so live
/// material is never mutated under an in-progress handshake. Replacing a
/// `TlsContext` drops the previous credential set.
#[derive(Clone)]
pub(crate) struct TlsContext {
    contexts: Arc<Vec<(String, SslContext)>>,
    front: SslContext,
    verify_certificate: bool,
    verify_hostname: bool,
}

impl TlsContext {
    pub(crate) fn new(setup: TlsSetup) -> Result<Self> {
        let dh = match &setup.dh_params {
            Some(source) => {
                let pem = source.load()?;
                Some(Dh::params_from_pem(&pem).map_err(|e| {
                    SocketError::Tls(format!("could not import DH parameters: {}", e))
                })?)
            }
            None => None,
        };

        let mut contexts = Vec::new();
        if setup.bundles.is_empty() {
            match setup.role {
                TlsRole::Server => {
                    return Err(SocketError::Tls(
                        "TLS is enabled but no certificates are specified".to_string(),
                    ))
                }
                TlsRole::Client => {
                    // No bundle configured: fall back to the platform trust store.
                    let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;
                    builder.set_verify(SslVerifyMode::NONE);
                    builder.set_default_verify_paths().map_err(|e| {
                        SocketError::Tls(format!("could not load system certificates: {}", e))
                    })?;
                    contexts.push(("*".to_string(), builder.build()));
                }
            }
        } else {
            for (pattern, bundle) in &setup.bundles {
                let builder = bundle_context_builder(pattern, bundle, &setup, dh.as_ref())?;
                contexts.push((pattern.clone(), builder.build()));
            }
        }

        let contexts = Arc::new(contexts);
        let front = match setup.role {
            TlsRole::Client => contexts[0].1.clone(),
            TlsRole::Server => {
                let (pattern, bundle) = &setup.bundles[0];
                let mut builder = bundle_context_builder(pattern, bundle, &setup, dh.as_ref())?;
                let lookup = Arc::clone(&contexts);
                builder.set_servername_callback(
                    move |ssl, _alert| -> std::result::Result<(), SniError> {
                        let chosen = if lookup.len() > 1 {
                            match ssl.servername(NameType::HOST_NAME) {
                                Some(name) => lookup
                                    .iter()
                                    .find(|(pattern, _)| pattern.as_str() == name)
                                    .map(|(_, ctx)| ctx)
                                    .unwrap_or(&lookup[0].1),
                                None => &lookup[0].1,
                            }
                        } else {
                            &lookup[0].1
                        };
                        ssl.set_ssl_context(chosen).map_err(|_| SniError::ALERT_FATAL)
                    },
                );
                builder.build()
            }
        };

        Ok(TlsContext {
            contexts,
            front,
            verify_certificate: setup.verify_certificate,
            verify_hostname: setup.verify_hostname,
        })
    }

    /// Number of built credential objects
    pub(crate) fn bundle_count(&self) -> usize {
        self.contexts.len()
    }

    /// Client-side handshake: disables Nagle, sets the server-name
    /// extension, completes the handshake and verifies the peer.
    pub(crate) fn connect(
        &self,
        hostname: &str,
        verification_hostname: &str,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<SslStream<TcpStream>> {
        stream.set_nodelay(true).map_err(|e| {
            SocketError::Tls(format!("could not disable the Nagle algorithm: {}", e))
        })?;
        let mut ssl = Ssl::new(&self.front)?;
        ssl.set_hostname(hostname).map_err(|e| {
            SocketError::Tls(format!("could not set the server name extension: {}", e))
        })?;
        let stream = complete_handshake(ssl.connect(stream), timeout)?;
        self.verify_peer(&stream, verification_hostname)?;
        tracing::debug!(hostname, "client TLS handshake completed");
        Ok(stream)
    }

    /// Server-side handshake for an accepted peer. Credential selection
    /// happens inside the handshake through the SNI resolver callback.
    pub(crate) fn accept(
        &self,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<SslStream<TcpStream>> {
        let ssl = Ssl::new(&self.front)?;
        complete_handshake(ssl.accept(stream), timeout)
    }

    fn verify_peer(
        &self,
        stream: &SslStream<TcpStream>,
        verification_hostname: &str,
    ) -> Result<()> {
        let ssl = stream.ssl();
        let peer = ssl
            .peer_certificate()
            .ok_or_else(|| SocketError::Tls("could not get the server certificate".to_string()))?;

        let status = ssl.verify_result();
        if status != X509VerifyResult::OK {
            // Revoked, weak-signature, not-yet-valid and expired certificates
            // fail regardless of the verification flag.
            let hard_failure = matches!(
                status.as_raw(),
                X509_V_ERR_CERT_REVOKED
                    | X509_V_ERR_CERT_SIGNATURE_FAILURE
                    | X509_V_ERR_CERT_NOT_YET_VALID
                    | X509_V_ERR_CERT_HAS_EXPIRED
            );
            if self.verify_certificate || hard_failure {
                return Err(SocketError::Tls(format!(
                    "error verifying the server certificate (code {}): {}",
                    status.as_raw(),
                    status.error_string()
                )));
            }
            tracing::warn!(
                code = status.as_raw(),
                reason = status.error_string(),
                "server certificate verification failed"
            );
            return Ok(());
        }

        if self.verify_hostname && !certificate_matches_hostname(&peer, verification_hostname) {
            return Err(SocketError::Tls(
                "the server's hostname does not match the server certificate".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builds the credential object for one bundle.
fn bundle_context_builder(
    pattern: &str,
    bundle: &CertificateBundle,
    setup: &TlsSetup,
    dh: Option<&Dh<Params>>,
) -> Result<SslContextBuilder> {
    let method = match setup.role {
        TlsRole::Client => SslMethod::tls_client(),
        TlsRole::Server => SslMethod::tls_server(),
    };
    let mut builder = SslContextBuilder::new(method)?;

    let mut ca_certificate_count = 0usize;
    match &bundle.ca {
        Some(PemSource::File(path)) => {
            builder.set_ca_file(path).map_err(|e| {
                SocketError::Tls(format!(
                    "could not load trusted certificates from \"{}\": {}",
                    path.display(),
                    e
                ))
            })?;
            ca_certificate_count = 1;
        }
        Some(PemSource::Data(data)) => {
            let certs = X509::stack_from_pem(data).map_err(|e| {
                SocketError::Tls(format!("could not load trusted certificates: {}", e))
            })?;
            ca_certificate_count = certs.len();
            for cert in certs {
                builder.cert_store_mut().add_cert(cert)?;
            }
        }
        None => {
            if setup.require_client_cert && setup.role == TlsRole::Server {
                return Err(SocketError::Tls(format!(
                    "client certificate authentication is enabled, but bundle \"{}\" has no CA trust material",
                    pattern
                )));
            }
        }
    }

    let strict_client = setup.verify_certificate && setup.role == TlsRole::Client;
    let strict_server = setup.require_client_cert && setup.role == TlsRole::Server;
    if ca_certificate_count == 0 && (strict_client || strict_server) {
        return Err(SocketError::Tls("no CA certificates specified".to_string()));
    }

    match (&bundle.cert, &bundle.key) {
        (Some(cert), Some(key)) => {
            let cert_pem = cert.load()?;
            let key_pem = key.load()?;
            let mut chain = X509::stack_from_pem(&cert_pem)
                .map_err(|e| SocketError::Tls(format!("could not load certificate: {}", e)))?;
            if chain.is_empty() {
                return Err(SocketError::Tls(format!(
                    "bundle \"{}\" contains no certificate",
                    pattern
                )));
            }
            let leaf = chain.remove(0);
            builder.set_certificate(&leaf)?;
            for intermediate in chain {
                builder.add_extra_chain_cert(intermediate)?;
            }
            let pkey = PKey::private_key_from_pem(&key_pem)
                .map_err(|e| SocketError::Tls(format!("could not load private key: {}", e)))?;
            builder.set_private_key(&pkey)?;
            builder.check_private_key()?;
        }
        (None, None) => {
            if setup.role == TlsRole::Server {
                return Err(SocketError::Tls(format!(
                    "TLS is enabled but bundle \"{}\" specifies no certificate",
                    pattern
                )));
            }
        }
        _ => {
            return Err(SocketError::Tls(format!(
                "bundle \"{}\" must specify certificate and key together",
                pattern
            )))
        }
    }

    match setup.role {
        TlsRole::Server => {
            if let Some(dh) = dh {
                builder.set_tmp_dh(dh)?;
            }
            // Client certificates are requested only when enforcement is on;
            // verification then happens natively during the handshake and any
            // failure terminates it.
            if setup.require_client_cert {
                builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
            } else {
                builder.set_verify(SslVerifyMode::NONE);
            }
        }
        TlsRole::Client => {
            // Verification is performed after the handshake so that soft
            // failures can be downgraded to warnings.
            builder.set_verify(SslVerifyMode::NONE);
        }
    }

    Ok(builder)
}

/// Drives a non-blocking handshake to completion, retrying only while the
/// TLS layer reports a non-fatal would-block condition.
fn complete_handshake(
    initial: std::result::Result<SslStream<TcpStream>, HandshakeError<TcpStream>>,
    timeout: Duration,
) -> Result<SslStream<TcpStream>> {
    let mut result = initial;
    loop {
        match result {
            Ok(stream) => return Ok(stream),
            Err(HandshakeError::WouldBlock(mid)) => {
                let events = match mid.error().code() {
                    ErrorCode::WANT_WRITE => PollEvents::Write,
                    _ => PollEvents::Read,
                };
                let fd = mid.get_ref().as_raw_fd();
                let ready = poll_fd(fd, events, timeout)
                    .map_err(|e| SocketError::Tls(format!("TLS handshake has failed: {}", e)))?;
                if !ready {
                    return Err(SocketError::Tls("TLS handshake timed out".to_string()));
                }
                result = mid.handshake();
            }
            Err(HandshakeError::Failure(mid)) => {
                return Err(SocketError::Tls(format!(
                    "TLS handshake has failed: {}",
                    mid.error()
                )))
            }
            Err(HandshakeError::SetupFailure(stack)) => {
                return Err(SocketError::Tls(format!(
                    "could not initialize TLS session: {}",
                    stack
                )))
            }
        }
    }
}

/// Checks the peer certificate's DNS subject alternative names (falling
/// back to the common name when no DNS SAN is present) against the
/// expected hostname, with support for a leftmost wildcard label.
fn certificate_matches_hostname(cert: &X509Ref, hostname: &str) -> bool {
    if let Some(names) = cert.subject_alt_names() {
        let mut saw_dns = false;
        for name in names.iter() {
            if let Some(dns) = name.dnsname() {
                saw_dns = true;
                if wildcard_match(dns, hostname) {
                    return true;
                }
            }
        }
        if saw_dns {
            return false;
        }
    }
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| wildcard_match(&cn, hostname))
        .unwrap_or(false)
}

fn wildcard_match(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let hostname = hostname.trim_end_matches('.');
    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if let Some((_, host_suffix)) = hostname.split_once('.') {
            return !host_suffix.is_empty() && suffix.eq_ignore_ascii_case(host_suffix);
        }
    }
    false
}
