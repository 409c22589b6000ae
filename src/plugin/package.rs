//! Plugin packages: fetching, staging and releasing.
//!
//! A [`PackageHandle`] is an opaque, already-fetched package. Fetching is the
//! job of a [`PackageSource`]; placing the unpacked files somewhere a runtime
//! unit can execute them is the job of a [`PackageStore`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::Archive;
use tracing::debug;

use crate::error::PackageError;
use crate::plugin::descriptor::MANIFEST_FILE;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Default cap on the total size of a staged package.
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 512 * 1024 * 1024;

/// Whether `bytes` start like a gzip stream.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Fetched package bytes plus where they came from.
#[derive(Debug, Clone)]
pub struct PackageHandle {
    locator: String,
    bytes: Vec<u8>,
    content_hash: String,
}

impl PackageHandle {
    pub fn from_bytes(locator: impl Into<String>, bytes: Vec<u8>) -> Self {
        let content_hash = blake3::hash(&bytes).to_hex().to_string();
        Self {
            locator: locator.into(),
            bytes,
            content_hash,
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex blake3 digest of the package bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}

/// Somewhere packages can be fetched from.
#[async_trait]
pub trait PackageSource: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<PackageHandle, PackageError>;
}

/// Reads packages from the local filesystem.
///
/// A directory is packed into an archive on the fly, so a plugin under
/// development can be installed straight from its source tree.
pub struct LocalPackageSource;

#[async_trait]
impl PackageSource for LocalPackageSource {
    async fn fetch(&self, locator: &str) -> Result<PackageHandle, PackageError> {
        let path = Path::new(locator);
        if !path.exists() {
            return Err(PackageError::NotFound(locator.to_string()));
        }

        let bytes = if path.is_dir() {
            pack_directory(path).map_err(|e| PackageError::io(locator, e))?
        } else {
            tokio::fs::read(path)
                .await
                .map_err(|e| PackageError::io(locator, e))?
        };

        debug!("Read {} bytes of package from {}", bytes.len(), locator);
        Ok(PackageHandle::from_bytes(locator, bytes))
    }
}

/// Downloads packages over HTTP(S).
pub struct HttpPackageSource {
    client: reqwest::Client,
}

impl HttpPackageSource {
    pub fn new() -> Result<Self, PackageError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("aihub/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PackageError::Http {
                locator: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PackageSource for HttpPackageSource {
    async fn fetch(&self, locator: &str) -> Result<PackageHandle, PackageError> {
        let http_err = |e: reqwest::Error| PackageError::Http {
            locator: locator.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(locator)
            .header("Accept", "application/octet-stream")
            .send()
            .await
            .map_err(http_err)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PackageError::NotFound(locator.to_string()));
        }
        if !status.is_success() {
            return Err(PackageError::Http {
                locator: locator.to_string(),
                message: format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ),
            });
        }

        let bytes = response.bytes().await.map_err(http_err)?;
        debug!("Downloaded {} bytes of package from {}", bytes.len(), locator);
        Ok(PackageHandle::from_bytes(locator, bytes.to_vec()))
    }
}

/// Pick a source for `locator`: URLs are downloaded, anything else is a path.
pub fn source_for(locator: &str) -> Result<Box<dyn PackageSource>, PackageError> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        Ok(Box::new(HttpPackageSource::new()?))
    } else {
        Ok(Box::new(LocalPackageSource))
    }
}

/// Fetch a package from wherever `locator` points.
pub async fn fetch(locator: &str) -> Result<PackageHandle, PackageError> {
    source_for(locator)?.fetch(locator).await
}

/// Pack a directory tree into a gzip-compressed tar archive.
pub fn pack_directory(dir: &Path) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder.append_dir_all(&name, entry.path())?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }
    builder.into_inner()?.finish()
}

/// Pack in-memory files into a gzip-compressed tar archive.
///
/// Entries are written executable so entry points run without a chmod.
pub fn pack_files(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        // Writing into a Vec cannot fail.
        let _ = builder.append_data(&mut header, path, *content);
    }
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .unwrap_or_default()
}

/// Where staged packages live.
///
/// `stage` must be idempotent for identical content: staging the same bytes
/// twice yields the same directory and leaves the first copy untouched.
pub trait PackageStore: Send + Sync {
    /// Unpack `package` and return the directory a runtime unit executes from.
    fn stage(&self, plugin_id: &str, version: &str, package: &PackageHandle)
    -> Result<PathBuf, PackageError>;

    /// Remove a staged package. Releasing an absent path succeeds.
    fn release(&self, path: &Path) -> Result<(), PackageError>;
}

/// Content-addressed package store under a single root directory.
///
/// Layout: `<root>/<plugin_id>/<version>-<hash prefix>/`.
pub struct FsPackageStore {
    root: PathBuf,
    max_unpacked_bytes: u64,
}

impl FsPackageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
        }
    }

    pub fn with_max_unpacked_bytes(mut self, limit: u64) -> Self {
        self.max_unpacked_bytes = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_dir(&self, plugin_id: &str, version: &str, package: &PackageHandle) -> PathBuf {
        let hash = package.content_hash();
        let short = hash.get(..12).unwrap_or(hash);
        self.root
            .join(plugin_id)
            .join(format!("{}-{}", version, short))
    }

    /// The directory directly under `<root>/<plugin_id>/` that holds `path`.
    fn staged_dir_of(&self, path: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let plugin = components.next()?;
        let version = components.next()?;
        Some(self.root.join(plugin).join(version))
    }
}

impl PackageStore for FsPackageStore {
    fn stage(
        &self,
        plugin_id: &str,
        version: &str,
        package: &PackageHandle,
    ) -> Result<PathBuf, PackageError> {
        let locator = package.locator();
        let target = self.target_dir(plugin_id, version, package);
        if target.is_dir() {
            debug!("Package for {} already staged at {:?}", plugin_id, target);
            return Ok(package_root(&target));
        }

        fs::create_dir_all(&self.root).map_err(|e| PackageError::io(locator, e))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(|e| PackageError::io(locator, e))?;

        let too_large = || PackageError::TooLarge {
            locator: locator.to_string(),
            limit: self.max_unpacked_bytes,
        };

        if is_gzip(package.bytes()) {
            let mut archive = Archive::new(GzDecoder::new(package.bytes()));
            let entries = archive.entries().map_err(|e| PackageError::io(locator, e))?;
            let mut unpacked_bytes: u64 = 0;
            for entry in entries {
                let mut entry = entry.map_err(|e| PackageError::io(locator, e))?;
                let size = entry.header().size().map_err(|e| PackageError::io(locator, e))?;
                unpacked_bytes = unpacked_bytes.saturating_add(size);
                if unpacked_bytes > self.max_unpacked_bytes {
                    return Err(too_large());
                }
                let unpacked = entry
                    .unpack_in(staging.path())
                    .map_err(|e| PackageError::io(locator, e))?;
                if !unpacked {
                    let name = entry
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    return Err(PackageError::UnsafePath(name));
                }
            }
        } else {
            if package.bytes().len() as u64 > self.max_unpacked_bytes {
                return Err(too_large());
            }
            let mut file = fs::File::create(staging.path().join(MANIFEST_FILE))
                .map_err(|e| PackageError::io(locator, e))?;
            file.write_all(package.bytes())
                .map_err(|e| PackageError::io(locator, e))?;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| PackageError::io(locator, e))?;
        }
        fs::rename(staging.path(), &target).map_err(|e| PackageError::io(locator, e))?;

        debug!("Staged package for {} at {:?}", plugin_id, target);
        Ok(package_root(&target))
    }

    fn release(&self, path: &Path) -> Result<(), PackageError> {
        let locator = path.display().to_string();
        let staged = self
            .staged_dir_of(path)
            .ok_or_else(|| PackageError::UnsafePath(locator.clone()))?;

        match fs::remove_dir_all(&staged) {
            Ok(()) => debug!("Released staged package {:?}", staged),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PackageError::io(locator, e)),
        }

        // Prune the per-plugin directory once its last version is gone.
        if let Some(plugin_dir) = staged.parent()
            && plugin_dir != self.root
        {
            let _ = fs::remove_dir(plugin_dir);
        }
        Ok(())
    }
}

/// Archives may wrap everything in a single top-level directory.
fn package_root(dir: &Path) -> PathBuf {
    if dir.join(MANIFEST_FILE).exists() {
        return dir.to_path_buf();
    }
    let entries: Vec<_> = match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
        Err(_) => return dir.to_path_buf(),
    };
    if entries.len() == 1 && entries[0].path().is_dir() {
        entries[0].path()
    } else {
        dir.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &[u8] = b"schema_version = 1\n";

    #[test]
    fn test_content_hash_is_stable() {
        let a = PackageHandle::from_bytes("a", b"same".to_vec());
        let b = PackageHandle::from_bytes("b", b"same".to_vec());
        let c = PackageHandle::from_bytes("c", b"different".to_vec());
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_stage_unpacks_archive() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path().join("packages"));
        let bytes = pack_files(&[("plugin.toml", MANIFEST), ("bin/run.sh", b"echo hi\n")]);
        let package = PackageHandle::from_bytes("test", bytes);

        let dir = store.stage("acme", "1.0.0", &package).unwrap();
        assert!(dir.starts_with(store.root()));
        assert!(dir.join("plugin.toml").is_file());
        assert!(dir.join("bin/run.sh").is_file());
    }

    #[test]
    fn test_stage_nested_archive_returns_inner_dir() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path());
        let bytes = pack_files(&[("acme/plugin.toml", MANIFEST)]);
        let package = PackageHandle::from_bytes("test", bytes);

        let dir = store.stage("acme", "1.0.0", &package).unwrap();
        assert!(dir.ends_with("acme"));
        assert!(dir.join("plugin.toml").is_file());
    }

    #[test]
    fn test_stage_bare_manifest() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path());
        let package = PackageHandle::from_bytes("test", MANIFEST.to_vec());

        let dir = store.stage("acme", "1.0.0", &package).unwrap();
        assert_eq!(fs::read(dir.join("plugin.toml")).unwrap(), MANIFEST);
    }

    #[test]
    fn test_stage_same_content_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path());
        let package = PackageHandle::from_bytes("test", pack_files(&[("plugin.toml", MANIFEST)]));

        let first = store.stage("acme", "1.0.0", &package).unwrap();
        fs::write(first.join("marker"), b"x").unwrap();
        let second = store.stage("acme", "1.0.0", &package).unwrap();
        assert_eq!(first, second);
        assert!(second.join("marker").exists());
    }

    #[test]
    fn test_release_removes_and_prunes() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path());
        let package = PackageHandle::from_bytes("test", pack_files(&[("plugin.toml", MANIFEST)]));

        let dir = store.stage("acme", "1.0.0", &package).unwrap();
        store.release(&dir).unwrap();
        assert!(!dir.exists());
        assert!(!temp.path().join("acme").exists());

        // Releasing again is a no-op.
        store.release(&dir).unwrap();
    }

    #[test]
    fn test_release_outside_root_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path().join("packages"));
        let err = store.release(Path::new("/etc")).unwrap_err();
        assert!(matches!(err, PackageError::UnsafePath(_)));
    }

    #[tokio::test]
    async fn test_local_source_packs_directory() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("plugin.toml"), MANIFEST).unwrap();

        let locator = temp.path().to_string_lossy().to_string();
        let package = LocalPackageSource.fetch(&locator).await.unwrap();
        assert!(is_gzip(package.bytes()));
        assert_eq!(package.locator(), locator);
    }

    #[tokio::test]
    async fn test_local_source_missing_path() {
        let err = LocalPackageSource
            .fetch("/definitely/not/here.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, PackageError::NotFound(_)));
    }

    #[test]
    fn test_stage_refuses_package_over_unpacked_limit() {
        let temp = TempDir::new().unwrap();
        let store = FsPackageStore::new(temp.path()).with_max_unpacked_bytes(64 * 1024);
        let blob = vec![0u8; 256 * 1024];
        let bytes = pack_files(&[("plugin.toml", MANIFEST), ("weights.bin", &blob)]);
        // Zeros compress to far less than the limit.
        assert!((bytes.len() as u64) < 64 * 1024);
        let package = PackageHandle::from_bytes("bomb", bytes);

        let err = store.stage("acme", "1.0.0", &package).unwrap_err();
        assert!(matches!(err, PackageError::TooLarge { limit, .. } if limit == 64 * 1024));
        assert!(!temp.path().join("acme").exists());

        let small = PackageHandle::from_bytes("ok", pack_files(&[("plugin.toml", MANIFEST)]));
        assert!(store.stage("acme", "1.0.0", &small).is_ok());
    }
}
