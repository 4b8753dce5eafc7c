use crate::prereq::running_as_root;
use crate::RuntimeError;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_URL: &str = "https://registry-1.docker.io";

/// Written inside the rootfs once every layer has been unpacked.
pub const MARKER_FILE: &str = ".sprig-image.json";

/// Rootfs paths the sandbox creates or rewrites on every run: mount points,
/// the copied resolver config and engine scratch. Not part of the fingerprint.
pub const SANDBOX_PATHS: [&str; 11] = [
    "playbooks",
    "host",
    "root/.ssh",
    "root/.ansible",
    "etc/resolv.conf",
    ".pivot_old",
    "proc",
    "sys",
    "dev",
    "tmp",
    "var/tmp",
];

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// A parsed image reference such as `willhallonline/ansible:latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    /// Tag or `sha256:` digest.
    pub reference: String,
}

impl ImageRef {
    pub fn parse(s: &str) -> Result<Self, RuntimeError> {
        let s = s.trim();
        let invalid = || RuntimeError::InvalidImageRef(s.to_owned());
        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(invalid());
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (s, None),
        };
        let (registry, rest) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first, rest)
            }
            _ => (DOCKER_HUB, name),
        };
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
            _ => (rest, None),
        };
        if repository.is_empty() || tag == Some("") || digest == Some("") {
            return Err(invalid());
        }

        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_owned()
        };

        Ok(Self {
            registry: registry.to_owned(),
            repository,
            reference: digest.or(tag).unwrap_or("latest").to_owned(),
        })
    }

    pub fn registry_url(&self) -> String {
        match self.registry.as_str() {
            DOCKER_HUB => DOCKER_HUB_URL.to_owned(),
            r if r.starts_with("localhost") => format!("http://{r}"),
            r => format!("https://{r}"),
        }
    }

    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(
            f,
            "{}/{}{sep}{}",
            self.registry, self.repository, self.reference
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

impl Descriptor {
    pub fn short_digest(&self) -> &str {
        let hex = self
            .digest
            .split_once(':')
            .map_or(self.digest.as_str(), |(_, h)| h);
        &hex[..hex.len().min(12)]
    }
}

/// A single-platform manifest: the ordered layer list, bottom first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageManifest {
    pub layers: Vec<Descriptor>,
}

/// Where layers come from. The registry client is the production source;
/// tests substitute an in-memory one.
pub trait ImageSource {
    fn manifest(&self, image: &ImageRef) -> Result<ImageManifest, RuntimeError>;
    fn open_layer(
        &self,
        image: &ImageRef,
        layer: &Descriptor,
    ) -> Result<Box<dyn Read>, RuntimeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMarker {
    pub reference: String,
    pub layers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Cached,
    Extracted { layers: usize },
}

pub struct ImageCache {
    rootfs: PathBuf,
}

impl ImageCache {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
        }
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn marker_path(&self) -> PathBuf {
        self.rootfs.join(MARKER_FILE)
    }

    pub fn read_marker(&self) -> Option<ImageMarker> {
        let content = fs::read_to_string(self.marker_path()).ok()?;
        match serde_json::from_str(&content) {
            Ok(marker) => Some(marker),
            Err(e) => {
                debug!("ignoring unreadable image marker: {e}");
                None
            }
        }
    }

    pub fn is_cached(&self, image: &ImageRef) -> bool {
        self.read_marker()
            .is_some_and(|m| m.reference == image.to_string())
    }

    /// Make sure the rootfs holds `image`. A marker for the same reference is
    /// trusted as-is unless `verify` is set, in which case the stored
    /// fingerprint is re-checked and a mismatch triggers a clean re-extract.
    pub fn ensure_image(
        &self,
        image: &ImageRef,
        source: &dyn ImageSource,
        verify: bool,
        progress: &dyn Fn(&str),
    ) -> Result<EnsureOutcome, RuntimeError> {
        let reference = image.to_string();
        if let Some(marker) = self.read_marker().filter(|m| m.reference == reference) {
            if !verify {
                progress(&format!("using cached image {reference}"));
                return Ok(EnsureOutcome::Cached);
            }
            progress("verifying cached image...");
            let current = compute_image_digest(&self.rootfs)?;
            let stored = marker.fingerprint.clone();
            match stored.as_deref() {
                Some(stored) if stored == current => {
                    progress(&format!("using cached image {reference}"));
                    return Ok(EnsureOutcome::Cached);
                }
                None => {
                    self.write_marker(&ImageMarker {
                        fingerprint: Some(current),
                        ..marker
                    })?;
                    return Ok(EnsureOutcome::Cached);
                }
                Some(stored) => {
                    warn!(
                        "cached image {reference} does not match its fingerprint \
                         (stored {stored}, computed {current}), re-extracting"
                    );
                }
            }
        }
        self.extract(image, source, verify, progress)
    }

    fn extract(
        &self,
        image: &ImageRef,
        source: &dyn ImageSource,
        verify: bool,
        progress: &dyn Fn(&str),
    ) -> Result<EnsureOutcome, RuntimeError> {
        force_remove(&self.rootfs)?;
        fs::create_dir_all(&self.rootfs)?;

        progress(&format!("fetching manifest for {image}..."));
        let manifest = source.manifest(image)?;
        if manifest.layers.is_empty() {
            return Err(RuntimeError::Image(format!("{image} has no layers")));
        }

        let total = manifest.layers.len();
        for (idx, layer) in manifest.layers.iter().enumerate() {
            progress(&format!(
                "extracting layer {}/{total} ({})",
                idx + 1,
                layer.short_digest()
            ));
            let reader = source.open_layer(image, layer)?;
            let entries = unpack_layer(reader, &self.rootfs).map_err(|e| {
                RuntimeError::Image(format!("failed to unpack layer {}: {e}", layer.digest))
            })?;
            debug!(digest = %layer.digest, entries, "layer unpacked");
        }

        let fingerprint = if verify {
            progress("computing image fingerprint...");
            Some(compute_image_digest(&self.rootfs)?)
        } else {
            None
        };
        self.write_marker(&ImageMarker {
            reference: image.to_string(),
            layers: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
            fingerprint,
        })?;

        info!("image {image} extracted ({total} layers)");
        Ok(EnsureOutcome::Extracted { layers: total })
    }

    fn write_marker(&self, marker: &ImageMarker) -> Result<(), RuntimeError> {
        let content = serde_json::to_string_pretty(marker).map_err(|source| {
            RuntimeError::Decode {
                what: "image marker",
                source,
            }
        })?;
        let tmp = self.rootfs.join(format!("{MARKER_FILE}.tmp"));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, self.marker_path())?;
        Ok(())
    }
}

/// Unpack one layer onto `dest`, handling gzip transparently. Returns the
/// number of entries written.
pub fn unpack_layer<R: Read>(reader: R, dest: &Path) -> io::Result<usize> {
    let mut reader = BufReader::new(reader);
    let head = reader.fill_buf()?;
    if head.starts_with(&ZSTD_MAGIC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "zstd-compressed layers are not supported",
        ));
    }
    if head.starts_with(&GZIP_MAGIC) {
        unpack_tar(GzDecoder::new(reader), dest)
    } else {
        unpack_tar(reader, dest)
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> io::Result<usize> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    // chown needs root, which a real run always has.
    archive.set_preserve_ownerships(running_as_root());
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        if raw
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            warn!("skipping layer entry outside the rootfs: {}", raw.display());
            continue;
        }
        let path: PathBuf = raw
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();

        // /dev is a fresh tmpfs inside the sandbox.
        if path.starts_with("dev") && path != Path::new("dev") {
            continue;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.starts_with(WHITEOUT_PREFIX) {
            let parent = path.parent().unwrap_or(Path::new(""));
            if let Some(link) = symlinked_component(dest, parent) {
                warn!(
                    "skipping whiteout {} below symlink {}",
                    path.display(),
                    link.display()
                );
                continue;
            }
        }
        if name == WHITEOUT_OPAQUE {
            clear_directory(&dest.join(path.parent().unwrap_or(Path::new(""))))?;
            continue;
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&dest.join(path.with_file_name(target)))?;
            continue;
        }

        entry.unpack_in(dest)?;
        written += 1;
    }
    Ok(written)
}

/// First existing component of `rel` under `dest` that is a symlink.
fn symlinked_component(dest: &Path, rel: &Path) -> Option<PathBuf> {
    let mut current = dest.to_path_buf();
    for component in rel.components() {
        current.push(component);
        if fs::symlink_metadata(&current).is_ok_and(|m| m.file_type().is_symlink()) {
            return Some(current);
        }
    }
    None
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_directory(dir: &Path) -> io::Result<()> {
    let Ok(listing) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in listing {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

/// Compute a content digest (blake3) of a rootfs directory.
///
/// Hashes the sorted list of paths, file sizes and link targets for a
/// deterministic fingerprint without reading every byte. The image marker
/// and [`SANDBOX_PATHS`] are excluded.
pub fn compute_image_digest(rootfs: &Path) -> Result<String, RuntimeError> {
    let mut entries = Vec::new();
    collect_file_entries(rootfs, rootfs, &mut entries)?;
    entries.sort();
    let mut hasher = blake3::Hasher::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn collect_file_entries(
    base: &Path,
    dir: &Path,
    entries: &mut Vec<String>,
) -> Result<(), RuntimeError> {
    let Ok(listing) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in listing {
        let entry = entry?;
        let path = entry.path();
        let rel_path = path.strip_prefix(base).unwrap_or(&path);
        if SANDBOX_PATHS.iter().any(|p| rel_path == Path::new(p)) {
            continue;
        }
        let rel = rel_path.to_string_lossy().to_string();
        if rel == MARKER_FILE || rel.starts_with(&format!("{MARKER_FILE}.")) {
            continue;
        }
        let ft = entry.file_type()?;
        if ft.is_symlink() {
            let target = fs::read_link(&path)?;
            entries.push(format!("{rel}->{}", target.display()));
        } else if ft.is_file() {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(format!("{rel}:{len}"));
        } else if ft.is_dir() {
            entries.push(format!("{rel}/"));
            collect_file_entries(base, &path, entries)?;
        }
    }
    Ok(())
}

pub fn force_remove(path: &Path) -> Result<(), RuntimeError> {
    if fs::symlink_metadata(path).is_ok() {
        remove_path(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io::{Cursor, Write};

    fn tar_layer(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    struct FakeSource {
        layers: RefCell<Vec<(String, Vec<u8>)>>,
        manifest_calls: Cell<usize>,
        layer_calls: Cell<usize>,
        fail_layer: Cell<Option<usize>>,
    }

    impl FakeSource {
        fn new(layers: Vec<Vec<u8>>) -> Self {
            let layers = layers
                .into_iter()
                .enumerate()
                .map(|(i, data)| (format!("sha256:{i:064}"), data))
                .collect();
            Self {
                layers: RefCell::new(layers),
                manifest_calls: Cell::new(0),
                layer_calls: Cell::new(0),
                fail_layer: Cell::new(None),
            }
        }
    }

    impl ImageSource for FakeSource {
        fn manifest(&self, _image: &ImageRef) -> Result<ImageManifest, RuntimeError> {
            self.manifest_calls.set(self.manifest_calls.get() + 1);
            Ok(ImageManifest {
                layers: self
                    .layers
                    .borrow()
                    .iter()
                    .map(|(digest, data)| Descriptor {
                        media_type: "application/vnd.oci.image.layer.v1.tar".to_owned(),
                        digest: digest.clone(),
                        size: data.len() as u64,
                    })
                    .collect(),
            })
        }

        fn open_layer(
            &self,
            _image: &ImageRef,
            layer: &Descriptor,
        ) -> Result<Box<dyn Read>, RuntimeError> {
            let idx = self.layer_calls.get();
            self.layer_calls.set(idx + 1);
            if self.fail_layer.get() == Some(idx) {
                return Err(RuntimeError::Registry("connection reset".to_owned()));
            }
            let layers = self.layers.borrow();
            let (_, data) = layers
                .iter()
                .find(|(d, _)| *d == layer.digest)
                .unwrap();
            Ok(Box::new(Cursor::new(data.clone())))
        }
    }

    fn image() -> ImageRef {
        ImageRef::parse("willhallonline/ansible:latest").unwrap()
    }

    fn quiet(_: &str) {}

    #[test]
    fn parse_docker_hub_short_names() {
        let r = ImageRef::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference, "latest");

        let r = ImageRef::parse("willhallonline/ansible:latest").unwrap();
        assert_eq!(r.repository, "willhallonline/ansible");
        assert_eq!(r.registry_url(), "https://registry-1.docker.io");
        assert_eq!(r.to_string(), "docker.io/willhallonline/ansible:latest");
    }

    #[test]
    fn parse_custom_registry_with_port_and_digest() {
        let r = ImageRef::parse("localhost:5000/tools/ansible:9").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "tools/ansible");
        assert_eq!(r.reference, "9");
        assert_eq!(r.registry_url(), "http://localhost:5000");

        let r = ImageRef::parse("ghcr.io/owner/repo@sha256:abc").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.reference, "sha256:abc");
        assert!(r.is_digest());
        assert_eq!(r.to_string(), "ghcr.io/owner/repo@sha256:abc");
    }

    #[test]
    fn parse_rejects_malformed_refs() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("has space:1").is_err());
        assert!(ImageRef::parse("repo:").is_err());
        assert!(ImageRef::parse("repo@").is_err());
    }

    #[test]
    fn ensure_twice_extracts_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![tar_layer(&[("usr/bin/ansible-playbook", "#!")])]);

        let first = cache.ensure_image(&image(), &source, false, &quiet).unwrap();
        assert_eq!(first, EnsureOutcome::Extracted { layers: 1 });
        assert!(cache.is_cached(&image()));

        let second = cache.ensure_image(&image(), &source, false, &quiet).unwrap();
        assert_eq!(second, EnsureOutcome::Cached);
        assert_eq!(source.manifest_calls.get(), 1);
        assert_eq!(source.layer_calls.get(), 1);
    }

    #[test]
    fn cache_hit_with_marker_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let marker = ImageMarker {
            reference: image().to_string(),
            layers: vec![],
            fingerprint: None,
        };
        fs::write(
            rootfs.join(MARKER_FILE),
            serde_json::to_string(&marker).unwrap(),
        )
        .unwrap();

        let source = FakeSource::new(vec![]);
        let outcome = ImageCache::new(&rootfs)
            .ensure_image(&image(), &source, false, &quiet)
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Cached);
        assert_eq!(source.manifest_calls.get(), 0);
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![
            gzip(&tar_layer(&[("etc/os-release", "old"), ("etc/keep", "k")])),
            tar_layer(&[("etc/os-release", "new")]),
        ]);
        cache.ensure_image(&image(), &source, false, &quiet).unwrap();
        let rootfs = cache.rootfs();
        assert_eq!(fs::read_to_string(rootfs.join("etc/os-release")).unwrap(), "new");
        assert_eq!(fs::read_to_string(rootfs.join("etc/keep")).unwrap(), "k");
    }

    #[test]
    fn whiteouts_delete_lower_layer_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![
            tar_layer(&[("opt/a", "a"), ("opt/b", "b"), ("srv/x/1", "1")]),
            tar_layer(&[("opt/.wh.a", ""), ("srv/x/.wh..wh..opq", "")]),
        ]);
        cache.ensure_image(&image(), &source, false, &quiet).unwrap();
        let rootfs = cache.rootfs();
        assert!(!rootfs.join("opt/a").exists());
        assert!(rootfs.join("opt/b").exists());
        assert!(!rootfs.join("srv/x/1").exists());
        assert!(!rootfs.join("opt/.wh.a").exists());
    }

    #[cfg(unix)]
    #[test]
    fn whiteouts_never_follow_symlinked_parents() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("victim"), "host data").unwrap();
        fs::create_dir_all(outside.path().join("state")).unwrap();
        fs::write(outside.path().join("state/keep"), "host data").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        for (path, target) in [
            ("opt/escape", outside.path().to_path_buf()),
            ("srv/escape", outside.path().join("state")),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder.append_link(&mut header, path, &target).unwrap();
        }
        let planted = builder.into_inner().unwrap();

        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![
            planted,
            tar_layer(&[("opt/escape/.wh.victim", ""), ("srv/escape/.wh..wh..opq", "")]),
        ]);
        cache.ensure_image(&image(), &source, false, &quiet).unwrap();

        assert!(outside.path().join("victim").exists());
        assert!(outside.path().join("state/keep").exists());
    }

    #[cfg(unix)]
    #[test]
    fn layer_ownership_is_kept() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let own = fs::metadata(dir.path()).unwrap();
        let (uid, gid) = if own.uid() == 0 {
            (4242, 4242)
        } else {
            (own.uid(), own.gid())
        };

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(2);
        header.set_mode(0o640);
        header.set_uid(u64::from(uid));
        header.set_gid(u64::from(gid));
        builder
            .append_data(&mut header, "home/app/.profile", &b"ok"[..])
            .unwrap();
        let layer = builder.into_inner().unwrap();

        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        unpack_layer(Cursor::new(layer), &rootfs).unwrap();
        let meta = fs::metadata(rootfs.join("home/app/.profile")).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (uid, gid));
    }

    #[test]
    fn device_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![tar_layer(&[("dev/console", "x"), ("etc/a", "a")])]);
        cache.ensure_image(&image(), &source, false, &quiet).unwrap();
        assert!(!cache.rootfs().join("dev/console").exists());
        assert!(cache.rootfs().join("etc/a").exists());
    }

    #[test]
    fn failed_layer_leaves_no_marker_and_retries_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![
            tar_layer(&[("etc/a", "a")]),
            tar_layer(&[("etc/b", "b")]),
        ]);
        source.fail_layer.set(Some(1));

        assert!(cache.ensure_image(&image(), &source, false, &quiet).is_err());
        assert!(!cache.marker_path().exists());
        assert!(!cache.is_cached(&image()));

        source.fail_layer.set(None);
        let outcome = cache.ensure_image(&image(), &source, false, &quiet).unwrap();
        assert_eq!(outcome, EnsureOutcome::Extracted { layers: 2 });
        assert!(cache.rootfs().join("etc/b").exists());
    }

    #[test]
    fn different_reference_triggers_reextract() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![tar_layer(&[("etc/a", "a")])]);
        cache.ensure_image(&image(), &source, false, &quiet).unwrap();

        let other = ImageRef::parse("willhallonline/ansible:2.16").unwrap();
        let outcome = cache.ensure_image(&other, &source, false, &quiet).unwrap();
        assert_eq!(outcome, EnsureOutcome::Extracted { layers: 1 });
        assert_eq!(source.manifest_calls.get(), 2);
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![tar_layer(&[("etc/a", "a")])]);
        cache.ensure_image(&image(), &source, true, &quiet).unwrap();
        assert!(cache.read_marker().unwrap().fingerprint.is_some());

        assert_eq!(
            cache.ensure_image(&image(), &source, true, &quiet).unwrap(),
            EnsureOutcome::Cached
        );

        fs::write(cache.rootfs().join("etc/a"), "tampered content").unwrap();
        assert_eq!(
            cache.ensure_image(&image(), &source, true, &quiet).unwrap(),
            EnsureOutcome::Extracted { layers: 1 }
        );
        assert_eq!(fs::read_to_string(cache.rootfs().join("etc/a")).unwrap(), "a");
    }

    #[test]
    fn verify_ignores_paths_the_sandbox_touches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("rootfs"));
        let source = FakeSource::new(vec![tar_layer(&[
            ("etc/alpine-release", "3.19.1"),
            ("etc/resolv.conf", "nameserver 8.8.8.8"),
        ])]);
        assert_eq!(
            cache.ensure_image(&image(), &source, true, &quiet).unwrap(),
            EnsureOutcome::Extracted { layers: 1 }
        );

        // What a finished run leaves behind on disk.
        let rootfs = cache.rootfs();
        for dir in ["playbooks", "host", "root/.ssh", "proc", "sys", "dev"] {
            fs::create_dir_all(rootfs.join(dir)).unwrap();
        }
        fs::write(rootfs.join("etc/resolv.conf"), "nameserver 192.168.1.1\n").unwrap();
        fs::create_dir_all(rootfs.join("tmp/ansible-tmp-1")).unwrap();
        fs::write(rootfs.join("tmp/ansible-tmp-1/module.py"), "x").unwrap();
        fs::create_dir_all(rootfs.join("root/.ansible/cp")).unwrap();
        fs::write(rootfs.join("root/.ansible/cp/master"), "").unwrap();

        assert_eq!(
            cache.ensure_image(&image(), &source, true, &quiet).unwrap(),
            EnsureOutcome::Cached
        );
        assert_eq!(source.manifest_calls.get(), 1);

        fs::write(rootfs.join("etc/alpine-release"), "3.19.1-modified").unwrap();
        assert_eq!(
            cache.ensure_image(&image(), &source, true, &quiet).unwrap(),
            EnsureOutcome::Extracted { layers: 1 }
        );
    }

    #[test]
    fn zstd_layers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = [0x28, 0xb5, 0x2f, 0xfd, 0, 0, 0, 0];
        let err = unpack_layer(&data[..], dir.path()).unwrap_err();
        assert!(err.to_string().contains("zstd"));
    }

    #[test]
    fn digest_is_deterministic_and_ignores_marker() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path();
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/hostname"), "test").unwrap();

        let digest = compute_image_digest(rootfs).unwrap();
        assert_eq!(digest.len(), 64);
        fs::write(rootfs.join(MARKER_FILE), "{}").unwrap();
        assert_eq!(compute_image_digest(rootfs).unwrap(), digest);

        fs::write(rootfs.join("etc/hostname"), "changed").unwrap();
        assert_ne!(compute_image_digest(rootfs).unwrap(), digest);
    }

    #[test]
    fn short_digest_strips_algorithm() {
        let d = Descriptor {
            media_type: String::new(),
            digest: "sha256:0123456789abcdef0123".to_owned(),
            size: 0,
        };
        assert_eq!(d.short_digest(), "0123456789ab");
    }
}
