//! Certificate, key pair and account storage
//!
//! [`CertificateStore`] is the single source of truth for certificate state:
//! every node of a cluster reads and writes the same records, and the state
//! machine never keeps its own copy between ticks.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── credentials.json          # ACME account credentials (opaque, serialized)
//! └── domains/
//!     ├── example.com/
//!     │   ├── certificate.json  # CertificateData record
//!     │   └── key.pem           # Domain key pair
//!     └── _wildcard_.example.com/
//!         └── ...
//! ```

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::error::{AcmeError, StorageError};
use super::state::{CertificateData, WILDCARD_PREFIX};

/// Directory-name stand-in for the `*.` wildcard marker
const WILDCARD_DIR_PREFIX: &str = "_wildcard_.";

/// Persistence for certificate records, domain keys and account credentials
pub trait CertificateStore: Send + Sync + fmt::Debug {
    /// Load the record of a domain, `None` if it was never saved
    fn load_certificate_for_domain(&self, domain: &str)
        -> Result<Option<CertificateData>, StorageError>;

    /// Save (create or replace) a record
    fn save_certificate(&self, data: &CertificateData) -> Result<(), StorageError>;

    /// Load the key pair of a domain, `None` if none was generated yet
    fn load_key_pair_for_domain(&self, domain: &str) -> Result<Option<DomainKeyPair>, StorageError>;

    fn save_key_pair_for_domain(&self, domain: &str, key_pair: &DomainKeyPair) -> Result<(), StorageError>;

    /// Serialized ACME account credentials
    fn load_account_credentials(&self) -> Result<Option<String>, StorageError>;

    fn save_account_credentials(&self, json: &str) -> Result<(), StorageError>;

    /// Domains with a stored record
    fn list_domains(&self) -> Result<Vec<String>, StorageError>;

    /// Remove a domain's record and key pair
    fn delete_certificate(&self, domain: &str) -> Result<(), StorageError>;
}

/// A domain's private key, kept in PEM form
///
/// Generated once on the first order and reused across renewals.
#[derive(Clone, PartialEq, Eq)]
pub struct DomainKeyPair {
    pem: String,
}

impl DomainKeyPair {
    /// Generate a fresh key pair
    pub fn generate() -> Result<Self, AcmeError> {
        let key = rcgen::KeyPair::generate()?;
        Ok(Self {
            pem: key.serialize_pem(),
        })
    }

    /// Wrap a PEM private key, checking that it parses
    pub fn from_pem(pem: impl Into<String>) -> Result<Self, AcmeError> {
        let pem = pem.into();
        rcgen::KeyPair::from_pem(&pem)?;
        Ok(Self { pem })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Signing key for CSRs
    pub fn signing_key(&self) -> Result<rcgen::KeyPair, AcmeError> {
        Ok(rcgen::KeyPair::from_pem(&self.pem)?)
    }
}

impl fmt::Debug for DomainKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainKeyPair").finish_non_exhaustive()
    }
}

/// Map a domain to a filesystem-safe directory name
fn domain_dir_name(domain: &str) -> String {
    match domain.strip_prefix(WILDCARD_PREFIX) {
        Some(base) => format!("{}{}", WILDCARD_DIR_PREFIX, base),
        None => domain.to_string(),
    }
}

/// Inverse of [`domain_dir_name`]
fn domain_from_dir_name(name: &str) -> String {
    match name.strip_prefix(WILDCARD_DIR_PREFIX) {
        Some(base) => format!("{}{}", WILDCARD_PREFIX, base),
        None => name.to_string(),
    }
}

/// Write a file through a temporary sibling and rename it into place
///
/// A crash mid-write leaves the previous content intact.
///
/// Private files are created owner-only, so the content is never readable by
/// others, not even briefly.
fn write_atomic(path: &Path, content: &[u8], private: bool) -> Result<(), StorageError> {
    let tmp_path = path.with_extension("tmp");
    // A leftover from an interrupted write may carry other permissions
    match fs::remove_file(&tmp_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Filesystem-backed certificate store
#[derive(Debug)]
pub struct FileCertificateStore {
    /// Base storage directory
    base_path: PathBuf,
}

impl FileCertificateStore {
    /// Create a store rooted at the given path
    ///
    /// Creates the directory structure if it doesn't exist and sets
    /// restrictive permissions (0700 on Unix).
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path)?;

        let domains_path = base_path.join("domains");
        fs::create_dir_all(&domains_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone())?;
            fs::set_permissions(&domains_path, perms)?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn domain_path(&self, domain: &str) -> PathBuf {
        self.base_path.join("domains").join(domain_dir_name(domain))
    }
}

impl CertificateStore for FileCertificateStore {
    fn load_certificate_for_domain(
        &self,
        domain: &str,
    ) -> Result<Option<CertificateData>, StorageError> {
        let record_path = self.domain_path(domain).join("certificate.json");

        if !record_path.exists() {
            trace!(domain = %domain, "No stored certificate record");
            return Ok(None);
        }

        let content = fs::read_to_string(&record_path)?;
        let data: CertificateData = serde_json::from_str(&content)?;
        if data.domain != domain {
            return Err(StorageError::InvalidStructure(format!(
                "Record at {} belongs to '{}'",
                record_path.display(),
                data.domain
            )));
        }

        trace!(domain = %domain, state = %data.state, "Loaded certificate record");
        Ok(Some(data))
    }

    fn save_certificate(&self, data: &CertificateData) -> Result<(), StorageError> {
        let domain_path = self.domain_path(&data.domain);
        fs::create_dir_all(&domain_path)?;

        let content = serde_json::to_string_pretty(data)?;
        write_atomic(&domain_path.join("certificate.json"), content.as_bytes(), false)?;

        debug!(domain = %data.domain, state = %data.state, "Saved certificate record");
        Ok(())
    }

    fn load_key_pair_for_domain(&self, domain: &str) -> Result<Option<DomainKeyPair>, StorageError> {
        let key_path = self.domain_path(domain).join("key.pem");

        if !key_path.exists() {
            trace!(domain = %domain, "No stored key pair");
            return Ok(None);
        }

        let pem = fs::read_to_string(&key_path)?;
        DomainKeyPair::from_pem(pem)
            .map(Some)
            .map_err(|e| StorageError::InvalidStructure(format!("Key pair for '{}': {}", domain, e)))
    }

    fn save_key_pair_for_domain(
        &self,
        domain: &str,
        key_pair: &DomainKeyPair,
    ) -> Result<(), StorageError> {
        let domain_path = self.domain_path(domain);
        fs::create_dir_all(&domain_path)?;
        write_atomic(&domain_path.join("key.pem"), key_pair.pem().as_bytes(), true)?;

        info!(domain = %domain, "Saved domain key pair");
        Ok(())
    }

    fn load_account_credentials(&self) -> Result<Option<String>, StorageError> {
        let creds_path = self.base_path.join("credentials.json");

        if !creds_path.exists() {
            trace!("No stored ACME credentials found");
            return Ok(None);
        }

        let content = fs::read_to_string(&creds_path)?;
        debug!("Loaded ACME credentials JSON");
        Ok(Some(content))
    }

    fn save_account_credentials(&self, json: &str) -> Result<(), StorageError> {
        write_atomic(&self.base_path.join("credentials.json"), json.as_bytes(), true)?;
        info!("Saved ACME credentials JSON");
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<String>, StorageError> {
        let domains_path = self.base_path.join("domains");

        if !domains_path.exists() {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        for entry in fs::read_dir(&domains_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    domains.push(domain_from_dir_name(name));
                }
            }
        }
        domains.sort();

        Ok(domains)
    }

    fn delete_certificate(&self, domain: &str) -> Result<(), StorageError> {
        let domain_path = self.domain_path(domain);

        if domain_path.exists() {
            fs::remove_dir_all(&domain_path)?;
            info!(domain = %domain, "Deleted stored certificate");
        } else {
            warn!(domain = %domain, "Certificate to delete not found");
        }

        Ok(())
    }
}

/// In-memory certificate store
///
/// Used by single-process deployments without durable state and by tests,
/// which rely on [`MemoryCertificateStore::save_count`].
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    certificates: DashMap<String, CertificateData>,
    key_pairs: DashMap<String, DomainKeyPair>,
    credentials: Mutex<Option<String>>,
    saves: AtomicUsize,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save_certificate` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Seed a record without counting it as a save
    pub fn insert(&self, data: CertificateData) {
        self.certificates.insert(data.domain.clone(), data);
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn load_certificate_for_domain(
        &self,
        domain: &str,
    ) -> Result<Option<CertificateData>, StorageError> {
        Ok(self.certificates.get(domain).map(|d| d.clone()))
    }

    fn save_certificate(&self, data: &CertificateData) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.certificates.insert(data.domain.clone(), data.clone());
        Ok(())
    }

    fn load_key_pair_for_domain(&self, domain: &str) -> Result<Option<DomainKeyPair>, StorageError> {
        Ok(self.key_pairs.get(domain).map(|k| k.clone()))
    }

    fn save_key_pair_for_domain(
        &self,
        domain: &str,
        key_pair: &DomainKeyPair,
    ) -> Result<(), StorageError> {
        self.key_pairs.insert(domain.to_string(), key_pair.clone());
        Ok(())
    }

    fn load_account_credentials(&self) -> Result<Option<String>, StorageError> {
        Ok(self.credentials.lock().clone())
    }

    fn save_account_credentials(&self, json: &str) -> Result<(), StorageError> {
        *self.credentials.lock() = Some(json.to_string());
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<String>, StorageError> {
        let mut domains: Vec<String> = self.certificates.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        Ok(domains)
    }

    fn delete_certificate(&self, domain: &str) -> Result<(), StorageError> {
        self.certificates.remove(domain);
        self.key_pairs.remove(domain);
        Ok(())
    }
}
