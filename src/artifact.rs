use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    errors::{Result, SegmentError},
    traits::{ArtifactCache, ArtifactFetcher},
};

pub const ENCODER_URL: &str =
    "https://huggingface.co/g-ronimo/sam2-tiny/resolve/main/sam2_hiera_tiny_encoder.with_runtime_opt.ort";
pub const DECODER_URL: &str =
    "https://huggingface.co/g-ronimo/sam2-tiny/resolve/main/sam2_hiera_tiny_decoder_pr1.onnx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Remote(String),
    Local(PathBuf),
}

/// A serialized model and where to get it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub name: String,
    pub source: ArtifactSource,
}

impl ModelArtifact {
    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::Remote(url.into()),
        }
    }

    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::Local(path.into()),
        }
    }

    /// Final path segment of the location. Used as the cache key.
    pub fn cache_key(&self) -> String {
        match &self.source {
            ArtifactSource::Remote(url) => basename(url).to_string(),
            ArtifactSource::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.name.clone()),
        }
    }
}

fn basename(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    pub encoder: ModelArtifact,
    pub decoder: ModelArtifact,
}

impl Default for ModelArtifacts {
    fn default() -> Self {
        Self {
            encoder: ModelArtifact::remote("encoder", ENCODER_URL),
            decoder: ModelArtifact::remote("decoder", DECODER_URL),
        }
    }
}

/// Cache-first model acquisition.
///
/// A cache hit never touches the network. Failing to write back to the cache
/// is logged and otherwise ignored; only a failed fetch is fatal.
pub struct ArtifactStore {
    cache: Box<dyn ArtifactCache>,
    fetcher: Box<dyn ArtifactFetcher>,
}

impl ArtifactStore {
    pub fn new(
        cache: impl ArtifactCache + 'static,
        fetcher: impl ArtifactFetcher + 'static,
    ) -> Self {
        Self {
            cache: Box::new(cache),
            fetcher: Box::new(fetcher),
        }
    }

    pub fn acquire(&self, artifact: &ModelArtifact) -> Result<Vec<u8>> {
        match &artifact.source {
            ArtifactSource::Local(path) => read_local(artifact, path),
            ArtifactSource::Remote(url) => self.acquire_remote(artifact, url),
        }
    }

    fn acquire_remote(&self, artifact: &ModelArtifact, url: &str) -> Result<Vec<u8>> {
        let key = artifact.cache_key();

        match self.cache.get(&key) {
            Ok(Some(bytes)) if !bytes.is_empty() => {
                info!("{} loaded from cache ({} bytes)", artifact.name, bytes.len());
                return Ok(bytes);
            }
            Ok(_) => debug!("{key} not in cache"),
            Err(err) => warn!("Cache lookup for {key} failed: {err}"),
        }

        info!("Downloading {} from {url}", artifact.name);
        let bytes = self
            .fetcher
            .fetch(url)
            .map_err(|err| SegmentError::ModelUnavailable {
                artifact: key.clone(),
                reason: err.to_string(),
            })?;
        if bytes.is_empty() {
            return Err(SegmentError::ModelUnavailable {
                artifact: key,
                reason: "empty response body".to_string(),
            });
        }

        match self.cache.put(&key, &bytes) {
            Ok(()) => debug!("{key} stored in cache"),
            Err(err) if is_quota_error(&err) => debug!("Cache full, {key} not stored: {err}"),
            Err(err) => warn!("Failed to store {key} in cache: {err}"),
        }

        Ok(bytes)
    }
}

fn read_local(artifact: &ModelArtifact, path: &Path) -> Result<Vec<u8>> {
    let unavailable = |reason: String| SegmentError::ModelUnavailable {
        artifact: path.display().to_string(),
        reason,
    };
    let bytes = fs::read(path).map_err(|err| unavailable(err.to_string()))?;
    if bytes.is_empty() {
        return Err(unavailable("file is empty".to_string()));
    }
    info!("{} loaded from {}", artifact.name, path.display());
    Ok(bytes)
}

fn is_quota_error(err: &SegmentError) -> bool {
    matches!(
        err,
        SegmentError::FileSystem { source, .. }
            if matches!(source.kind(), ErrorKind::StorageFull | ErrorKind::QuotaExceeded)
    )
}

/// File-per-key cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<user cache dir>/sam2-seg/models`
    pub fn default_location() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("sam2-seg").join("models"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\']);
        if !valid {
            return Err(SegmentError::validation(
                "cache key",
                format!("`{key}` is not a plain file name"),
            ));
        }
        Ok(self.root.join(key))
    }
}

impl ArtifactCache for DirectoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SegmentError::FileSystem {
                path,
                operation: "read cached model".to_string(),
                source,
            }),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root).map_err(|source| SegmentError::FileSystem {
            path: self.root.clone(),
            operation: "create cache directory".to_string(),
            source,
        })?;

        // Written under a temporary name first so a partial file is never a hit.
        let partial = path.with_extension("partial");
        fs::write(&partial, bytes).map_err(|source| SegmentError::FileSystem {
            path: partial.clone(),
            operation: "write cached model".to_string(),
            source,
        })?;
        fs::rename(&partial, &path).map_err(|source| SegmentError::FileSystem {
            path: path.clone(),
            operation: "finalize cached model".to_string(),
            source,
        })
    }
}

/// Blocking HTTP(S) fetcher.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(30))
                .build(),
        }
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let unavailable = |reason: String| SegmentError::ModelUnavailable {
            artifact: basename(url).to_string(),
            reason,
        };

        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| unavailable(err.to_string()))?;
        let capacity = response
            .header("Content-Length")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(0);

        let mut bytes = Vec::with_capacity(capacity);
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|err| unavailable(format!("download interrupted: {err}")))?;
        debug!("Fetched {} bytes from {url}", bytes.len());
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MemoryCache, MockFetcher};
    use tempfile::TempDir;

    const URL: &str = "https://models.test/path/encoder.ort";

    #[test]
    fn test_cache_key_is_url_basename() {
        let artifact = ModelArtifact::remote("encoder", ENCODER_URL);
        assert_eq!(
            artifact.cache_key(),
            "sam2_hiera_tiny_encoder.with_runtime_opt.ort"
        );
        let artifact = ModelArtifact::remote("decoder", "https://host/a/b.onnx?download=true");
        assert_eq!(artifact.cache_key(), "b.onnx");
        let artifact = ModelArtifact::local("decoder", "/models/decoder.onnx");
        assert_eq!(artifact.cache_key(), "decoder.onnx");
    }

    #[test]
    fn test_miss_fetches_and_writes_back() {
        let cache = MemoryCache::default();
        let fetcher = MockFetcher::default().with_response(URL, b"weights".to_vec());
        let store = ArtifactStore::new(cache.clone(), fetcher.clone());

        let bytes = store
            .acquire(&ModelArtifact::remote("encoder", URL))
            .unwrap();
        assert_eq!(bytes, b"weights");
        assert_eq!(fetcher.calls(), vec![URL.to_string()]);
        assert_eq!(cache.stored("encoder.ort"), Some(b"weights".to_vec()));
    }

    #[test]
    fn test_hit_skips_network() {
        let cache = MemoryCache::default().with_entry("encoder.ort", b"cached".to_vec());
        let fetcher = MockFetcher::default().failing();
        let store = ArtifactStore::new(cache, fetcher.clone());

        let bytes = store
            .acquire(&ModelArtifact::remote("encoder", URL))
            .unwrap();
        assert_eq!(bytes, b"cached");
        assert!(fetcher.calls().is_empty());
    }

    #[test]
    fn test_write_back_failure_is_not_fatal() {
        for kind in [ErrorKind::QuotaExceeded, ErrorKind::PermissionDenied] {
            let cache = MemoryCache::default().failing_writes(kind);
            let fetcher = MockFetcher::default().with_response(URL, b"weights".to_vec());
            let store = ArtifactStore::new(cache.clone(), fetcher);

            let bytes = store
                .acquire(&ModelArtifact::remote("encoder", URL))
                .unwrap();
            assert_eq!(bytes, b"weights");
            assert_eq!(cache.stored("encoder.ort"), None);
        }
    }

    #[test]
    fn test_quota_classification() {
        let quota = SegmentError::FileSystem {
            path: PathBuf::from("x"),
            operation: "write".to_string(),
            source: std::io::Error::from(ErrorKind::StorageFull),
        };
        assert!(is_quota_error(&quota));
        assert!(!is_quota_error(&SegmentError::Busy));
    }

    #[test]
    fn test_fetch_failure_is_model_unavailable() {
        let store = ArtifactStore::new(MemoryCache::default(), MockFetcher::default().failing());
        let result = store.acquire(&ModelArtifact::remote("encoder", URL));
        match result {
            Err(SegmentError::ModelUnavailable { artifact, .. }) => {
                assert_eq!(artifact, "encoder.ort")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_directory_cache_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache = DirectoryCache::new(temp.path().join("nested").join("models"));

        assert_eq!(cache.get("decoder.onnx").unwrap(), None);
        cache.put("decoder.onnx", b"abc").unwrap();
        assert_eq!(cache.get("decoder.onnx").unwrap(), Some(b"abc".to_vec()));
        assert!(!cache.root().join("decoder.partial").exists());
    }

    #[test]
    fn test_directory_cache_rejects_path_keys() {
        let temp = TempDir::new().unwrap();
        let cache = DirectoryCache::new(temp.path());
        assert!(cache.put("../escape", b"x").is_err());
        assert!(cache.get("..").is_err());
    }

    #[test]
    fn test_local_artifact() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("encoder.ort");
        fs::write(&path, b"local").unwrap();

        let store = ArtifactStore::new(MemoryCache::default(), MockFetcher::default().failing());
        assert_eq!(
            store.acquire(&ModelArtifact::local("encoder", &path)).unwrap(),
            b"local"
        );

        let missing = ModelArtifact::local("encoder", temp.path().join("missing.ort"));
        assert!(matches!(
            store.acquire(&missing),
            Err(SegmentError::ModelUnavailable { .. })
        ));

        let empty = temp.path().join("empty.ort");
        fs::write(&empty, b"").unwrap();
        match store.acquire(&ModelArtifact::local("encoder", &empty)) {
            Err(SegmentError::ModelUnavailable { reason, .. }) => assert_eq!(reason, "file is empty"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
