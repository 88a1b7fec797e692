// Copyright 2023 宋昊文
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate rustls;
extern crate rustls_pemfile;
extern crate webpki_roots;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::error::{ErrorKind, Result};
use super::proxy::Proxies;

/// Per-phase deadlines, `None` waits forever.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timeouts {
    /// TCP connect plus TLS handshake.
    pub connect: Option<Duration>,
    /// Applied to every individual socket read.
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    /// How long to hold back a body sent with `Expect: 100-continue`.
    pub expect_continue: Duration,
}

impl Timeouts {
    /// One duration for both connect and read.
    pub fn both(timeout: Duration) -> Timeouts {
        Timeouts {
            connect: Some(timeout),
            read: Some(timeout),
            ..Timeouts::default()
        }
    }

    pub fn none() -> Timeouts {
        Timeouts {
            connect: None,
            read: None,
            write: None,
            expect_continue: Duration::from_secs(1),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            connect: Some(Duration::from_secs(30)),
            read: Some(Duration::from_secs(30)),
            write: None,
            expect_continue: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    pub max_per_destination: usize,
    pub max_total: usize,
    pub max_idle_per_destination: usize,
    pub idle_timeout: Option<Duration>,
    /// Wait limit for a free slot, `None` waits until one frees up.
    pub acquire_timeout: Option<Duration>,
    /// Busy leases older than this are reclaimed under capacity pressure.
    pub stale_busy_threshold: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_per_destination: 10,
            max_total: 100,
            max_idle_per_destination: 10,
            idle_timeout: Some(Duration::from_secs(90)),
            acquire_timeout: None,
            stale_busy_threshold: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TlsConfig {
    pub verify: bool,
    /// Extra PEM bundle trusted on top of the built-in roots.
    pub ca_file: Option<PathBuf>,
    /// PEM certificate chain and private key.
    pub client_cert: Option<(PathBuf, PathBuf)>,
}

impl Default for TlsConfig {
    fn default() -> TlsConfig {
        TlsConfig {
            verify: true,
            ca_file: None,
            client_cert: None,
        }
    }
}

fn tls_error<E: std::fmt::Display>(what: &str, e: E) -> ErrorKind {
    ErrorKind::Tls(format!("{}: {}", what, e))
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    match File::open(path) {
        Ok(f) => Ok(BufReader::new(f)),
        Err(e) => Err(tls_error(&path.display().to_string(), e)),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut reader) {
        match cert {
            Ok(cert) => certs.push(cert),
            Err(e) => return Err(tls_error("invalid certificate encoding", e)),
        }
    }
    Ok(certs)
}

impl TlsConfig {
    pub fn build(&self) -> Result<Arc<rustls::ClientConfig>> {
        let builder = if self.verify {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            if let Some(ca_file) = &self.ca_file {
                for cert in load_certs(ca_file)? {
                    root_store
                        .add(cert)
                        .map_err(|e| tls_error("failed to add ca certificate", e))?;
                }
            }

            rustls::ClientConfig::builder().with_root_certificates(root_store)
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
        };

        let config = match &self.client_cert {
            Some((cert_file, key_file)) => {
                let certs = load_certs(cert_file)?;
                let mut reader = open_pem(key_file)?;
                let key = match rustls_pemfile::private_key(&mut reader) {
                    Ok(Some(key)) => key,
                    Ok(None) => {
                        return Err(ErrorKind::Tls(format!(
                            "no private key in {}",
                            key_file.display()
                        )))
                    }
                    Err(e) => return Err(tls_error("invalid private key encoding", e)),
                };
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| tls_error("client certificate rejected", e))?
            }

            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Everything an `HttpClient` is built from.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub timeouts: Timeouts,
    /// Redirect hops to follow, 0 hands every 3xx back to the caller.
    pub max_redirects: usize,
    pub proxies: Proxies,
    pub tls: TlsConfig,
    /// Advertise and transparently decode gzip, deflate and br.
    pub decompress: bool,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            pool: PoolConfig::default(),
            timeouts: Timeouts::default(),
            max_redirects: 10,
            proxies: Proxies::new(),
            tls: TlsConfig::default(),
            decompress: true,
        }
    }
}

impl ClientConfig {
    pub fn with_pool(mut self, pool: PoolConfig) -> ClientConfig {
        self.pool = pool;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> ClientConfig {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> ClientConfig {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_proxies(mut self, proxies: Proxies) -> ClientConfig {
        self.proxies = proxies;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> ClientConfig {
        self.tls = tls;
        self
    }

    pub fn with_decompress(mut self, decompress: bool) -> ClientConfig {
        self.decompress = decompress;
        self
    }
}
