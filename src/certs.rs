//! Per-domain certificates chosen by SNI
//!
//! Layout under `cert_root`:
//!
//! ```text
//! example.com/certificate.crt
//! example.com/private.key
//! no_cert/certificate.crt     fallback for unmatched names
//! no_cert/private.key
//! ```

use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CERTIFICATE_FILE: &str = "certificate.crt";
pub const PRIVATE_KEY_FILE: &str = "private.key";

/// Directory holding the certificate used when no domain matches
pub const FALLBACK_DIR: &str = "no_cert";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("unsupported private key in {path}: {reason}")]
    UnsupportedKey { path: PathBuf, reason: String },
}

/// Outcome of an SNI lookup
#[derive(Clone)]
pub enum CertificateMatch {
    Exact(Arc<CertifiedKey>),
    /// Matched after stripping the leftmost label
    Parent(Arc<CertifiedKey>),
    Fallback(Arc<CertifiedKey>),
    NoCertificate,
}

impl CertificateMatch {
    pub fn into_key(self) -> Option<Arc<CertifiedKey>> {
        match self {
            CertificateMatch::Exact(key)
            | CertificateMatch::Parent(key)
            | CertificateMatch::Fallback(key) => Some(key),
            CertificateMatch::NoCertificate => None,
        }
    }
}

impl std::fmt::Debug for CertificateMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CertificateMatch::Exact(_) => "Exact",
            CertificateMatch::Parent(_) => "Parent",
            CertificateMatch::Fallback(_) => "Fallback",
            CertificateMatch::NoCertificate => "NoCertificate",
        };
        f.write_str(name)
    }
}

/// One fully built generation of certificates
#[derive(Default)]
struct CertificateSet {
    by_domain: HashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
}

/// Certificate store and SNI resolver.
///
/// Lookups clone the current snapshot under a short read lock; [`reload`]
/// builds a complete new snapshot before swapping it in, so a handshake never
/// observes a partially loaded set.
///
/// [`reload`]: CertificateStore::reload
pub struct CertificateStore {
    cert_root: PathBuf,
    current: RwLock<Arc<CertificateSet>>,
    reload_lock: Mutex<()>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("cert_root", &self.cert_root)
            .field("domains", &self.domains())
            .finish()
    }
}

impl CertificateStore {
    /// Create an empty store; call [`reload`](Self::reload) to populate it
    pub fn new(cert_root: impl Into<PathBuf>) -> Self {
        Self {
            cert_root: cert_root.into(),
            current: RwLock::new(Arc::new(CertificateSet::default())),
            reload_lock: Mutex::new(()),
        }
    }

    /// Create a store and load it from disk
    pub fn load(cert_root: impl Into<PathBuf>) -> Arc<Self> {
        let store = Arc::new(Self::new(cert_root));
        store.reload();
        store
    }

    pub fn cert_root(&self) -> &Path {
        &self.cert_root
    }

    /// Rebuild the whole set from disk and swap it in.
    ///
    /// A broken domain directory is skipped with a warning. Returns the number
    /// of domain certificates loaded.
    pub fn reload(&self) -> usize {
        let _guard = self.reload_lock.lock();
        let set = build_set(&self.cert_root);
        let count = set.by_domain.len();
        let has_fallback = set.fallback.is_some();

        *self.current.write() = Arc::new(set);

        info!(
            cert_root = %self.cert_root.display(),
            domains = count,
            fallback = has_fallback,
            "Certificates loaded"
        );
        count
    }

    fn snapshot(&self) -> Arc<CertificateSet> {
        self.current.read().clone()
    }

    /// Exact name, then parent domain, then the fallback certificate
    pub fn lookup(&self, server_name: Option<&str>) -> CertificateMatch {
        let set = self.snapshot();

        if let Some(name) = server_name {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            if let Some(key) = set.by_domain.get(&name) {
                return CertificateMatch::Exact(Arc::clone(key));
            }
            if let Some(key) = parent_domain(&name).and_then(|p| set.by_domain.get(p)) {
                return CertificateMatch::Parent(Arc::clone(key));
            }
        }

        match &set.fallback {
            Some(key) => CertificateMatch::Fallback(Arc::clone(key)),
            None => CertificateMatch::NoCertificate,
        }
    }

    /// Whether HTTPS can be served for `host` without the fallback
    pub fn has_certificate(&self, host: &str) -> bool {
        matches!(
            self.lookup(Some(host)),
            CertificateMatch::Exact(_) | CertificateMatch::Parent(_)
        )
    }

    /// Loaded domain names, sorted
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.snapshot().by_domain.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn has_fallback(&self) -> bool {
        self.snapshot().fallback.is_some()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        if server_name.is_none() {
            warn!("TLS client sent no SNI, using fallback certificate");
        }

        let found = self.lookup(server_name);
        match &found {
            CertificateMatch::NoCertificate => {
                warn!(server_name, "No certificate available for TLS handshake");
            }
            other => {
                debug!(server_name, outcome = ?other, "Certificate selected");
            }
        }
        found.into_key()
    }
}

/// `sub.example.com` -> `example.com`; names with two labels or fewer have no parent
pub fn parent_domain(name: &str) -> Option<&str> {
    if name.split('.').count() <= 2 {
        return None;
    }
    name.split_once('.').map(|(_, parent)| parent)
}

fn build_set(cert_root: &Path) -> CertificateSet {
    let mut set = CertificateSet::default();

    let entries = match std::fs::read_dir(cert_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(cert_root = %cert_root.display(), error = %e, "Certificate directory unavailable");
            return set;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        match load_certified_key(&path) {
            Ok(key) if name == FALLBACK_DIR => set.fallback = Some(Arc::new(key)),
            Ok(key) => {
                set.by_domain.insert(name.to_ascii_lowercase(), Arc::new(key));
            }
            Err(e) => {
                warn!(domain = name, error = %e, "Skipping certificate directory");
            }
        }
    }

    set
}

/// Load `certificate.crt` and `private.key` from one domain directory
pub fn load_certified_key(dir: &Path) -> Result<CertifiedKey, CertificateError> {
    let cert_path = dir.join(CERTIFICATE_FILE);
    let key_path = dir.join(PRIVATE_KEY_FILE);

    let certs = load_certs(&cert_path)?;
    let key = load_key(&key_path)?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
        CertificateError::UnsupportedKey {
            path: key_path.clone(),
            reason: e.to_string(),
        }
    })?;

    Ok(CertifiedKey::new(certs, signing_key))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let read_error = |source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_error)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_error)?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificates(path.to_path_buf()));
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let read_error = |source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_error)?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(read_error)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(CertificateError::NoPrivateKey(path.to_path_buf()))
}
