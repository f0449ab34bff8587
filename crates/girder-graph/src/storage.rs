//! Temp storage: archived blocks of tagged node outputs.
//!
//! Each node output is archived as a block (a versioned binary bundle of
//! files) plus a JSON manifest recording per-file size and content hash.
//! Tag file lists reference the blocks their files came from so downstream
//! nodes pull only what they need. A shared directory, when configured,
//! mirrors blocks so cooperating drivers on other machines can exchange
//! artifacts.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use girder_types::{GirderError, Result};

const BLOCK_MAGIC: [u8; 4] = *b"GBLK";
const BLOCK_VERSION: u32 = 1;

/// Build products that legitimately appear in more than one block: runtime
/// libraries staged next to every binary that needs them.
pub const DUPLICABLE_BUILD_PRODUCTS: &[&str] = &[
    "libc++.dylib",
    "libc++abi.dylib",
    "tbb.dll",
    "tbbmalloc.dll",
];

/// Identity of one archived block: `(node, output)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempStorageBlock {
    pub node: String,
    pub output: String,
}

impl std::fmt::Display for TempStorageBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.output)
    }
}

/// One file recorded in a block manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub relative_path: String,
    pub size: u64,
    pub hash: String,
}

/// The manifest written next to each block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempStorageManifest {
    pub files: Vec<ManifestFile>,
    pub created_at: String,
}

/// The file set published under a tag, with the blocks holding those files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempStorageFileList {
    pub files: Vec<String>,
    pub blocks: Vec<TempStorageBlock>,
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn sanitize_tag(tag: &str) -> String {
    tag.trim_start_matches('#')
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[derive(Serialize, Deserialize)]
struct BundleHeader {
    magic: [u8; 4],
    version: u32,
}

fn write_bundle(path: &Path, files: &[(String, Vec<u8>)]) -> Result<()> {
    let header = BundleHeader {
        magic: BLOCK_MAGIC,
        version: BLOCK_VERSION,
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| GirderError::Other(format!("block encode: {e}")))?;
    let payload = bincode::serde::encode_to_vec(files, bincode::config::standard())
        .map_err(|e| GirderError::Other(format!("block encode: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&payload);
    std::fs::write(path, &output)?;
    Ok(())
}

fn read_bundle(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let corrupt = |reason: &str| GirderError::CacheCorruption {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let raw = std::fs::read(path)?;
    if raw.len() < 4 {
        return Err(corrupt("truncated block"));
    }
    let header_len = u32::from_le_bytes(raw[..4].try_into().expect("4 bytes")) as usize;
    if raw.len() < 4 + header_len {
        return Err(corrupt("truncated block header"));
    }
    let header: BundleHeader =
        bincode::serde::decode_from_slice(&raw[4..4 + header_len], bincode::config::standard())
            .map_err(|_| corrupt("unreadable block header"))?
            .0;
    if header.magic != BLOCK_MAGIC || header.version != BLOCK_VERSION {
        return Err(corrupt("block magic or version mismatch"));
    }
    bincode::serde::decode_from_slice(&raw[4 + header_len..], bincode::config::standard())
        .map(|(files, _)| files)
        .map_err(|_| corrupt("unreadable block payload"))
}

/// Local (and optionally shared) storage for a job's node outputs.
pub struct TempStorage {
    workspace_root: PathBuf,
    local_root: PathBuf,
    shared_root: Option<PathBuf>,
    write_shared: bool,
    duplicable: BTreeSet<String>,
    /// Which block first archived each relative path this session; used to
    /// reject the same file appearing under two owners.
    seen_paths: Mutex<HashMap<String, TempStorageBlock>>,
}

impl TempStorage {
    pub fn new(workspace_root: impl Into<PathBuf>, local_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            local_root: local_root.into(),
            shared_root: None,
            write_shared: false,
            duplicable: DUPLICABLE_BUILD_PRODUCTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            seen_paths: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Configure the shared mirror. Reading is implied by the directory
    /// being set; writing requires `write_shared`.
    pub fn with_shared(mut self, shared_root: impl Into<PathBuf>, write_shared: bool) -> Self {
        self.shared_root = Some(shared_root.into());
        self.write_shared = write_shared;
        self
    }

    /// Extend the duplicable-build-product allowlist.
    pub fn allow_duplicate(&mut self, basename: impl Into<String>) {
        self.duplicable.insert(basename.into());
    }

    fn node_dir(root: &Path, node: &str) -> PathBuf {
        root.join(sanitize_tag(node))
    }

    fn block_path(root: &Path, block: &TempStorageBlock) -> PathBuf {
        Self::node_dir(root, &block.node).join(format!("{}.block.bin", sanitize_tag(&block.output)))
    }

    fn manifest_path(root: &Path, block: &TempStorageBlock) -> PathBuf {
        Self::node_dir(root, &block.node)
            .join(format!("{}.manifest.json", sanitize_tag(&block.output)))
    }

    fn file_list_path(root: &Path, node: &str, tag: &str) -> PathBuf {
        Self::node_dir(root, node).join(format!("tag-{}.files.json", sanitize_tag(tag)))
    }

    fn complete_marker(&self, node: &str) -> PathBuf {
        Self::node_dir(&self.local_root, node).join("complete.marker")
    }

    fn relative(&self, file: &Path) -> Result<String> {
        file.strip_prefix(&self.workspace_root)
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|_| {
                GirderError::InvalidArgument(format!(
                    "{} is outside the workspace root",
                    file.display()
                ))
            })
    }

    /// Archive `files` as the block `(node, output)` and write its manifest.
    pub fn archive(
        &self,
        node: &str,
        output: &str,
        files: &[PathBuf],
    ) -> Result<TempStorageManifest> {
        let block = TempStorageBlock {
            node: node.to_string(),
            output: output.to_string(),
        };

        let mut bundle: Vec<(String, Vec<u8>)> = Vec::with_capacity(files.len());
        let mut manifest_files = Vec::with_capacity(files.len());
        {
            let mut seen = self.seen_paths.lock().expect("seen paths lock");
            for file in files {
                let relative = self.relative(file)?;
                let basename = Path::new(&relative)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if let Some(owner) = seen.get(&relative) {
                    if owner != &block && !self.duplicable.contains(&basename) {
                        return Err(GirderError::Other(format!(
                            "file {relative} is already archived in block {owner}; \
                             only duplicable build products may appear twice"
                        )));
                    }
                }
                let bytes = std::fs::read(file)?;
                manifest_files.push(ManifestFile {
                    relative_path: relative.clone(),
                    size: bytes.len() as u64,
                    hash: hash_bytes(&bytes),
                });
                seen.insert(relative.clone(), block.clone());
                bundle.push((relative, bytes));
            }
        }

        let manifest = TempStorageManifest {
            files: manifest_files,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let block_path = Self::block_path(&self.local_root, &block);
        write_bundle(&block_path, &bundle)?;
        let manifest_path = Self::manifest_path(&self.local_root, &block);
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        if let (Some(shared), true) = (&self.shared_root, self.write_shared) {
            let shared_block = Self::block_path(shared, &block);
            if let Some(parent) = shared_block.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&block_path, &shared_block)?;
            std::fs::copy(&manifest_path, Self::manifest_path(shared, &block))?;
            tracing::debug!(block = %block, "mirrored block to shared storage");
        }

        Ok(manifest)
    }

    fn fetch_from_shared(&self, block: &TempStorageBlock) -> Result<bool> {
        let Some(shared) = &self.shared_root else {
            return Ok(false);
        };
        let shared_block = Self::block_path(shared, block);
        let shared_manifest = Self::manifest_path(shared, block);
        if !shared_block.exists() || !shared_manifest.exists() {
            return Ok(false);
        }
        let local_block = Self::block_path(&self.local_root, block);
        if let Some(parent) = local_block.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&shared_block, &local_block)?;
        std::fs::copy(&shared_manifest, Self::manifest_path(&self.local_root, block))?;
        tracing::info!(block = %block, "fetched block from shared storage");
        Ok(true)
    }

    /// Fetch a block's manifest, staging its files into the workspace when
    /// they are missing or drifted. Falls back to shared storage when the
    /// block is not present locally.
    pub fn retrieve(&self, node: &str, output: &str) -> Result<TempStorageManifest> {
        let block = TempStorageBlock {
            node: node.to_string(),
            output: output.to_string(),
        };
        let manifest_path = Self::manifest_path(&self.local_root, &block);
        if !manifest_path.exists() && !self.fetch_from_shared(&block)? {
            return Err(GirderError::Other(format!(
                "no archived block for {block} in local or shared storage"
            )));
        }

        let manifest: TempStorageManifest =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;
        let bundle = read_bundle(&Self::block_path(&self.local_root, &block))?;
        let by_path: HashMap<&str, &ManifestFile> = manifest
            .files
            .iter()
            .map(|f| (f.relative_path.as_str(), f))
            .collect();

        for (relative, bytes) in &bundle {
            let target = self.workspace_root.join(relative);
            let expected = by_path.get(relative.as_str()).map(|f| f.hash.as_str());
            let current = std::fs::read(&target).ok().map(|b| hash_bytes(&b));
            if current.as_deref() != expected {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, bytes)?;
            }
        }

        let mut seen = self.seen_paths.lock().expect("seen paths lock");
        for file in &manifest.files {
            seen.entry(file.relative_path.clone()).or_insert_with(|| block.clone());
        }

        Ok(manifest)
    }

    /// Publish the file set for one output tag of a node.
    pub fn write_file_list(
        &self,
        node: &str,
        tag: &str,
        files: &[PathBuf],
        blocks: &[TempStorageBlock],
    ) -> Result<()> {
        let list = TempStorageFileList {
            files: files
                .iter()
                .map(|f| self.relative(f))
                .collect::<Result<Vec<_>>>()?,
            blocks: blocks.to_vec(),
        };
        let path = Self::file_list_path(&self.local_root, node, tag);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&list)?)?;

        if let (Some(shared), true) = (&self.shared_root, self.write_shared) {
            let shared_path = Self::file_list_path(shared, node, tag);
            if let Some(parent) = shared_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&path, &shared_path)?;
        }
        Ok(())
    }

    pub fn read_file_list(&self, node: &str, tag: &str) -> Result<TempStorageFileList> {
        let path = Self::file_list_path(&self.local_root, node, tag);
        let text = if path.exists() {
            std::fs::read_to_string(&path)?
        } else if let Some(shared) = &self.shared_root {
            let shared_path = Self::file_list_path(shared, node, tag);
            if !shared_path.exists() {
                return Err(GirderError::UnresolvedTag {
                    tag: tag.to_string(),
                    reason: format!("no file list published by node '{node}'"),
                    location: None,
                });
            }
            std::fs::read_to_string(&shared_path)?
        } else {
            return Err(GirderError::UnresolvedTag {
                tag: tag.to_string(),
                reason: format!("no file list published by node '{node}'"),
                location: None,
            });
        };
        Ok(serde_json::from_str(&text)?)
    }

    pub fn is_complete(&self, node: &str) -> bool {
        self.complete_marker(node).exists()
    }

    pub fn mark_complete(&self, node: &str) -> Result<()> {
        let marker = self.complete_marker(node);
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
        Ok(())
    }

    /// Remove all locally archived state.
    pub fn clean_local(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.local_root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove one node's locally archived state, including its completion
    /// marker.
    pub fn clean_local_node(&self, node: &str) -> Result<()> {
        match std::fs::remove_dir_all(Self::node_dir(&self.local_root, node)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-hash the exact files recorded for a completed node's tags. Any
    /// drift invalidates the node (its completion marker is removed) and
    /// returns `false`.
    pub fn check_local_integrity(&self, node: &str, tags: &[String]) -> Result<bool> {
        for tag in tags {
            let list = self.read_file_list(node, tag)?;

            let mut recorded: HashMap<String, String> = HashMap::new();
            for block in &list.blocks {
                let manifest_path = Self::manifest_path(&self.local_root, block);
                let manifest: TempStorageManifest =
                    serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;
                for file in manifest.files {
                    recorded.insert(file.relative_path, file.hash);
                }
            }

            for relative in &list.files {
                let expected = recorded.get(relative);
                let actual = std::fs::read(self.workspace_root.join(relative))
                    .ok()
                    .map(|b| hash_bytes(&b));
                if expected.is_none() || actual.as_deref() != expected.map(String::as_str) {
                    tracing::info!(node, file = %relative, "archived output drifted; invalidating node");
                    let _ = std::fs::remove_file(self.complete_marker(node));
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
