//! Filesystem layout for keys and certificate bundles
//!
//! One flat directory holds two files per entity: `<slug>.key` (private
//! key, mode 0600) and `<slug>.crt` (PEM certificate chain, mode 0644),
//! where the slug is the domain with every `.` replaced by `_`. The ACME
//! account uses the fixed slug `account` and only has a `.key`.

use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Slug reserved for the ACME account credentials.
pub const ACCOUNT_SLUG: &str = "account";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Key,
    Cert,
}

impl FileKind {
    fn extension(self) -> &'static str {
        match self {
            FileKind::Key => "key",
            FileKind::Cert => "crt",
        }
    }

    fn mode(self) -> u32 {
        match self {
            FileKind::Key => 0o600,
            FileKind::Cert => 0o644,
        }
    }
}

/// Store rooted at the configured `--acme-dir`.
///
/// The certificate manager is the sole writer; the configurator and the
/// template engine only consume paths.
#[derive(Debug)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<CertStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(CertStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Filename-safe form of a domain.
    pub fn slug(domain: &str) -> String {
        domain.replace('.', "_")
    }

    /// Recover the domain name from a stored filename.
    pub fn domain_for_file(filename: &str) -> Option<String> {
        let (stem, ext) = filename.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(stem.replace('_', "."))
    }

    pub fn path(&self, slug: &str, kind: FileKind) -> PathBuf {
        self.dir.join(format!("{}.{}", slug, kind.extension()))
    }

    pub fn write_key(&self, slug: &str, pem: &[u8]) -> Result<()> {
        self.write_atomic(slug, FileKind::Key, pem)
    }

    pub fn write_cert_bundle(&self, slug: &str, pem: &[u8]) -> Result<()> {
        self.write_atomic(slug, FileKind::Cert, pem)
    }

    /// Crash-safe replace: the bytes land in a temporary sibling created
    /// with the final mode, which is then renamed over the destination.
    fn write_atomic(&self, slug: &str, kind: FileKind, bytes: &[u8]) -> Result<()> {
        let path = self.path(slug, kind);
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        if let Err(err) = fs::remove_file(&tmp) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        let mut open = fs::OpenOptions::new();
        open.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(kind.mode());
        }
        let mut file = open.open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read_key(&self, slug: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.path(slug, FileKind::Key))
    }

    pub fn read_bundle(&self, slug: &str) -> Result<Option<String>> {
        let bytes = read_optional(&self.path(slug, FileKind::Cert))?;
        match bytes {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|_| Error::InvalidCert)?,
            )),
            None => Ok(None),
        }
    }

    /// Remove both files for a slug, tolerating ones that never existed.
    pub fn remove(&self, slug: &str) -> Result<()> {
        for kind in [FileKind::Key, FileKind::Cert] {
            if let Err(err) = fs::remove_file(self.path(slug, kind)) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Slugs of every stored certificate bundle, sorted.
    pub fn cert_slugs(&self) -> Result<Vec<String>> {
        let mut slugs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(slug) = name.strip_suffix(".crt") {
                slugs.push(slug.to_string());
            }
        }
        slugs.sort();
        Ok(slugs)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, CertStore) {
        let dir = TempDir::new().unwrap();
        let store = CertStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_slug() {
        assert_eq!(CertStore::slug("example.test"), "example_test");
        assert_eq!(CertStore::slug("a.b.c"), "a_b_c");
        assert_eq!(CertStore::slug("localhost"), "localhost");
    }

    #[test]
    fn test_domain_for_file_inverts_slug() {
        for domain in ["example.test", "a.b.c", "localhost"] {
            let file = format!("{}.crt", CertStore::slug(domain));
            assert_eq!(CertStore::domain_for_file(&file).as_deref(), Some(domain));
        }
        assert!(CertStore::domain_for_file("no-extension").is_none());
        assert!(CertStore::domain_for_file(".crt").is_none());
    }

    #[test]
    fn test_path_scheme() {
        let (dir, store) = store();
        assert_eq!(
            store.path("example_test", FileKind::Key),
            dir.path().join("example_test.key")
        );
        assert_eq!(
            store.path("example_test", FileKind::Cert),
            dir.path().join("example_test.crt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_write_modes() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, store) = store();
        store.write_key("example_test", b"key material").unwrap();
        store.write_cert_bundle("example_test", b"cert chain").unwrap();

        let key_mode = fs::metadata(dir.path().join("example_test.key"))
            .unwrap()
            .permissions()
            .mode();
        let crt_mode = fs::metadata(dir.path().join("example_test.crt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);
        assert_eq!(crt_mode & 0o777, 0o644);
    }

    #[test]
    fn test_write_replaces_and_leaves_no_temp_file() {
        let (dir, store) = store();
        store.write_key("a_test", b"first").unwrap();
        store.write_key("a_test", b"second").unwrap();
        assert_eq!(store.read_key("a_test").unwrap().unwrap(), b"second");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "stray temp files: {leftovers:?}");
    }

    #[test]
    fn test_read_missing_is_none() {
        let (_dir, store) = store();
        assert!(store.read_key("nope").unwrap().is_none());
        assert!(store.read_bundle("nope").unwrap().is_none());
    }

    #[test]
    fn test_remove_is_tolerant() {
        let (_dir, store) = store();
        store.remove("never_written").unwrap();

        store.write_key("a_test", b"key").unwrap();
        store.write_cert_bundle("a_test", b"crt").unwrap();
        store.remove("a_test").unwrap();
        assert!(store.read_key("a_test").unwrap().is_none());
        assert!(store.read_bundle("a_test").unwrap().is_none());
    }

    #[test]
    fn test_cert_slugs_filters_by_extension() {
        let (_dir, store) = store();
        store.write_key(ACCOUNT_SLUG, b"account").unwrap();
        store.write_cert_bundle("b_test", b"crt").unwrap();
        store.write_cert_bundle("a_test", b"crt").unwrap();
        store.write_key("a_test", b"key").unwrap();
        assert_eq!(store.cert_slugs().unwrap(), vec!["a_test", "b_test"]);
    }
}
