//! Compiler dependency cache.
//!
//! Compilers emit per-translation-unit dependency files (`.d` make rules,
//! flat `.txt` lists, structured `.json` documents) describing discovered
//! headers and modules. This cache parses them on demand, memoizes the
//! result keyed by the file's mtime, and persists each partition as a
//! versioned binary archive across builds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use girder_types::{GirderError, Result};

use crate::archive;

const CACHE_MAGIC: [u8; 4] = *b"GDEP";
const CACHE_VERSION: u32 = 3;

/// A module imported by a translation unit, optionally with the path to its
/// binary module interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyImport {
    pub name: String,
    pub bmi_path: Option<PathBuf>,
}

/// Parsed contents of one compiler-emitted dependency file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    /// Last write time of the dependency file when it was parsed. Entries
    /// older than the file on disk are reparsed.
    pub last_write_time: SystemTime,
    pub produced_module: Option<String>,
    pub imported_modules: Vec<DependencyImport>,
    pub files: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum DToken {
    Newline,
    Colon,
    Filename(String),
}

/// Tokenize a make-style `.d` rule.
///
/// Whitespace separates tokens; `\n` is a token; backslash-newline is a line
/// continuation and vanishes; `:` is a token; any other run of non-whitespace
/// characters is a filename, with `\ ` escaping a space.
fn tokenize_d(content: &str) -> Vec<DToken> {
    let chars: Vec<char> = content.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' | '\r' => i += 1,
            '\n' => {
                tokens.push(DToken::Newline);
                i += 1;
            }
            '\\' if matches!(chars.get(i + 1), Some('\n'))
                || matches!((chars.get(i + 1), chars.get(i + 2)), (Some('\r'), Some('\n'))) =>
            {
                // Line continuation.
                i += if chars[i + 1] == '\r' { 3 } else { 2 };
            }
            ':' => {
                tokens.push(DToken::Colon);
                i += 1;
            }
            _ => {
                let mut name = String::new();
                while i < chars.len() {
                    let c = chars[i];
                    if c == '\\' && matches!(chars.get(i + 1), Some(' ')) {
                        name.push(' ');
                        i += 2;
                        continue;
                    }
                    if c == '\\' && matches!(chars.get(i + 1), Some('\n' | '\r')) {
                        break;
                    }
                    if c == ' ' || c == '\t' || c == '\r' || c == '\n' || c == ':' {
                        break;
                    }
                    name.push(c);
                    i += 1;
                }
                tokens.push(DToken::Filename(name));
            }
        }
    }
    tokens
}

fn parse_d(path: &Path, content: &str) -> Result<Vec<PathBuf>> {
    let malformed = |reason: &str| GirderError::MalformedDependencyFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let tokens = tokenize_d(content);
    let mut iter = tokens.into_iter().peekable();

    while matches!(iter.peek(), Some(DToken::Newline)) {
        iter.next();
    }
    match iter.next() {
        Some(DToken::Filename(_)) => {}
        _ => return Err(malformed("expected rule target")),
    }
    match iter.next() {
        Some(DToken::Colon) => {}
        _ => return Err(malformed("expected ':' after rule target")),
    }

    let mut files = Vec::new();
    for token in iter.by_ref() {
        match token {
            DToken::Filename(name) => files.push(PathBuf::from(name)),
            DToken::Newline => break,
            DToken::Colon => return Err(malformed("unexpected ':' in dependency list")),
        }
    }
    for token in iter {
        if token != DToken::Newline {
            return Err(malformed("unexpected content after dependency list"));
        }
    }
    Ok(files)
}

/// One path per line; empty lines and COM artifacts (`.tlh`/`.tli`) are
/// skipped; doubled backslashes collapse to one.
fn parse_txt(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .filter(|line| !line.ends_with(".tlh") && !line.ends_with(".tli"))
        .map(|line| PathBuf::from(line.replace("\\\\", "\\")))
        .collect()
}

struct JsonDependencies {
    produced_module: Option<String>,
    imported_modules: Vec<DependencyImport>,
    files: Vec<PathBuf>,
}

/// Compiler source-dependencies document, versions `1.0` and `1.1`.
fn parse_json(path: &Path, content: &str, metadata_only: bool) -> Result<JsonDependencies> {
    let malformed = |reason: String| GirderError::MalformedDependencyFile {
        path: path.to_path_buf(),
        reason,
    };

    let doc: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let version = doc
        .get("Version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("missing Version field".into()))?;
    if version != "1.0" && version != "1.1" {
        return Err(malformed(format!("unsupported Version '{version}'")));
    }

    let data = doc
        .get("Data")
        .and_then(|v| v.as_object())
        .ok_or_else(|| malformed("missing Data object".into()))?;

    let produced_module = data
        .get("ProvidedModule")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let with_bmi = version == "1.1" && !metadata_only;
    let mut imported_modules = Vec::new();
    if let Some(imports) = data.get("ImportedModules").and_then(|v| v.as_array()) {
        for entry in imports {
            if let Some(name) = entry.as_str() {
                imported_modules.push(DependencyImport {
                    name: name.to_string(),
                    bmi_path: None,
                });
            } else if let Some(obj) = entry.as_object() {
                let name = obj
                    .get("Name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| malformed("imported module missing Name".into()))?;
                let bmi_path = if with_bmi {
                    obj.get("BMI").and_then(|v| v.as_str()).map(PathBuf::from)
                } else {
                    None
                };
                imported_modules.push(DependencyImport {
                    name: name.to_string(),
                    bmi_path,
                });
            } else {
                return Err(malformed("imported module entry has unexpected shape".into()));
            }
        }
    }

    let files = data
        .get("Includes")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(JsonDependencies {
        produced_module,
        imported_modules,
        files,
    })
}

fn parse_dependency_file(path: &Path, last_write_time: SystemTime) -> Result<DependencyInfo> {
    let content = std::fs::read_to_string(path)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

    match extension {
        "d" => Ok(DependencyInfo {
            last_write_time,
            produced_module: None,
            imported_modules: Vec::new(),
            files: parse_d(path, &content)?,
        }),
        "txt" => Ok(DependencyInfo {
            last_write_time,
            produced_module: None,
            imported_modules: Vec::new(),
            files: parse_txt(&content),
        }),
        "json" => {
            let metadata_only = file_name.ends_with(".md.json");
            let parsed = parse_json(path, &content, metadata_only)?;
            Ok(DependencyInfo {
                last_write_time,
                produced_module: parsed.produced_module,
                imported_modules: parsed.imported_modules,
                files: parsed.files,
            })
        }
        other => Err(GirderError::MalformedDependencyFile {
            path: path.to_path_buf(),
            reason: format!("unsupported dependency file extension '{other}'"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Partitioned cache
// ---------------------------------------------------------------------------

struct Partition {
    base_dir: PathBuf,
    archive_path: PathBuf,
    entries: RwLock<HashMap<PathBuf, Arc<DependencyInfo>>>,
    modified: AtomicBool,
}

impl Partition {
    fn load(base_dir: PathBuf, archive_path: PathBuf) -> Self {
        let entries: HashMap<PathBuf, DependencyInfo> =
            archive::read_archive(&archive_path, CACHE_MAGIC, CACHE_VERSION).unwrap_or_default();
        tracing::debug!(
            base = %base_dir.display(),
            entries = entries.len(),
            "mounted dependency cache partition"
        );
        Self {
            base_dir,
            archive_path,
            entries: RwLock::new(entries.into_iter().map(|(k, v)| (k, Arc::new(v))).collect()),
            modified: AtomicBool::new(false),
        }
    }

    fn save(&self) -> Result<()> {
        if !self.modified.load(Ordering::Acquire) {
            return Ok(());
        }
        let entries = self.entries.read().expect("dependency cache lock");
        let plain: HashMap<&PathBuf, &DependencyInfo> =
            entries.iter().map(|(k, v)| (k, v.as_ref())).collect();
        archive::write_archive(&self.archive_path, CACHE_MAGIC, CACHE_VERSION, &plain)?;
        self.modified.store(false, Ordering::Release);
        Ok(())
    }
}

/// Memoizing cache over compiler dependency files, split into partitions
/// anchored at base directories (engine root, per-project roots).
#[derive(Default)]
pub struct DependencyCache {
    partitions: Mutex<Vec<Arc<Partition>>>,
}

impl DependencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a partition anchored at `base_dir`, loading any persisted archive.
    pub fn mount(&self, base_dir: impl Into<PathBuf>, archive_path: impl Into<PathBuf>) {
        let partition = Arc::new(Partition::load(base_dir.into(), archive_path.into()));
        self.partitions
            .lock()
            .expect("partition registry lock")
            .push(partition);
    }

    fn route(&self, file: &Path) -> Option<Arc<Partition>> {
        self.partitions
            .lock()
            .expect("partition registry lock")
            .iter()
            .find(|p| file.starts_with(&p.base_dir))
            .cloned()
    }

    /// Fetch (parsing if needed) the dependency info for `file`.
    ///
    /// Returns `Ok(None)` when the file does not exist; parse failures are
    /// hard errors.
    pub fn try_get_dependency_info(&self, file: &Path) -> Result<Option<Arc<DependencyInfo>>> {
        let mtime = match std::fs::metadata(file) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(partition) = self.route(file) else {
            // No partition claims this directory; parse without memoizing.
            return parse_dependency_file(file, mtime).map(|info| Some(Arc::new(info)));
        };

        {
            let entries = partition.entries.read().expect("dependency cache lock");
            if let Some(entry) = entries.get(file) {
                if entry.last_write_time >= mtime {
                    return Ok(Some(Arc::clone(entry)));
                }
            }
        }

        let info = Arc::new(parse_dependency_file(file, mtime)?);
        partition
            .entries
            .write()
            .expect("dependency cache lock")
            .insert(file.to_path_buf(), Arc::clone(&info));
        partition.modified.store(true, Ordering::Release);
        Ok(Some(info))
    }

    pub fn try_get_produced_module(&self, file: &Path) -> Result<Option<String>> {
        Ok(self
            .try_get_dependency_info(file)?
            .and_then(|info| info.produced_module.clone()))
    }

    pub fn try_get_imported_modules(&self, file: &Path) -> Result<Option<Vec<DependencyImport>>> {
        Ok(self
            .try_get_dependency_info(file)?
            .map(|info| info.imported_modules.clone()))
    }

    pub fn try_get_dependencies(&self, file: &Path) -> Result<Option<Vec<PathBuf>>> {
        Ok(self
            .try_get_dependency_info(file)?
            .map(|info| info.files.clone()))
    }

    /// Write every modified partition back to disk. Called once at the end of
    /// a build.
    pub fn flush(&self) -> Result<()> {
        let partitions = self.partitions.lock().expect("partition registry lock").clone();
        for partition in partitions {
            partition.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    // --- .d parsing ---

    #[test]
    fn d_file_simple_rule() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.d", "a.o: /src/a.c /inc/a.h\n");
        let files = parse_d(&path, &std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(files, vec![PathBuf::from("/src/a.c"), PathBuf::from("/inc/a.h")]);
    }

    #[test]
    fn d_file_line_continuations() {
        let content = "a.o: /src/a.c \\\n  /inc/one.h \\\n  /inc/two.h\n";
        let files = parse_d(Path::new("a.d"), content).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("/src/a.c"),
                PathBuf::from("/inc/one.h"),
                PathBuf::from("/inc/two.h")
            ]
        );
    }

    #[test]
    fn d_file_escaped_spaces() {
        let content = "a.o: /inc/My\\ Header.h\n";
        let files = parse_d(Path::new("a.d"), content).unwrap();
        assert_eq!(files, vec![PathBuf::from("/inc/My Header.h")]);
    }

    #[test]
    fn d_file_leading_and_trailing_newlines() {
        let content = "\n\na.o: /src/a.c\n\n\n";
        let files = parse_d(Path::new("a.d"), content).unwrap();
        assert_eq!(files, vec![PathBuf::from("/src/a.c")]);
    }

    #[test]
    fn d_file_empty_dependency_list() {
        let files = parse_d(Path::new("a.d"), "a.o:\n").unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn d_file_missing_colon_is_fatal() {
        let err = parse_d(Path::new("a.d"), "just a token\n").unwrap_err();
        assert!(matches!(err, GirderError::MalformedDependencyFile { .. }));
    }

    #[test]
    fn d_file_second_rule_is_fatal() {
        let err = parse_d(Path::new("a.d"), "a.o: x.h\nb.o: y.h\n").unwrap_err();
        assert!(matches!(err, GirderError::MalformedDependencyFile { .. }));
    }

    #[test]
    fn d_file_stray_colon_is_fatal() {
        let err = parse_d(Path::new("a.d"), "a.o: x.h : y.h\n").unwrap_err();
        assert!(matches!(err, GirderError::MalformedDependencyFile { .. }));
    }

    // --- .txt parsing ---

    #[test]
    fn txt_file_skips_blank_lines_and_com_artifacts() {
        let content = "C:\\\\inc\\\\a.h\n\nC:\\gen\\thing.tlh\nC:\\gen\\thing.tli\nC:\\inc\\b.h\n";
        let files = parse_txt(content);
        assert_eq!(
            files,
            vec![PathBuf::from("C:\\inc\\a.h"), PathBuf::from("C:\\inc\\b.h")]
        );
    }

    // --- .json parsing ---

    #[test]
    fn json_v1_1_with_modules() {
        let content = r#"{
            "Version": "1.1",
            "Data": {
                "ProvidedModule": "Core.Maths",
                "ImportedModules": [{"Name": "Core.Base", "BMI": "/bmi/Core.Base.ifc"}],
                "Includes": ["/inc/a.h", "/inc/b.h"]
            }
        }"#;
        let parsed = parse_json(Path::new("a.json"), content, false).unwrap();
        assert_eq!(parsed.produced_module.as_deref(), Some("Core.Maths"));
        assert_eq!(parsed.imported_modules.len(), 1);
        assert_eq!(parsed.imported_modules[0].name, "Core.Base");
        assert_eq!(
            parsed.imported_modules[0].bmi_path,
            Some(PathBuf::from("/bmi/Core.Base.ifc"))
        );
        assert_eq!(parsed.files.len(), 2);
    }

    #[test]
    fn json_v1_0_names_only() {
        let content = r#"{
            "Version": "1.0",
            "Data": { "ImportedModules": ["Core.Base"], "Includes": [] }
        }"#;
        let parsed = parse_json(Path::new("a.json"), content, false).unwrap();
        assert_eq!(parsed.imported_modules[0].name, "Core.Base");
        assert!(parsed.imported_modules[0].bmi_path.is_none());
    }

    #[test]
    fn json_metadata_only_strips_bmi_paths() {
        let content = r#"{
            "Version": "1.1",
            "Data": {
                "ImportedModules": [{"Name": "Core.Base", "BMI": "/bmi/x.ifc"}]
            }
        }"#;
        let parsed = parse_json(Path::new("a.md.json"), content, true).unwrap();
        assert!(parsed.imported_modules[0].bmi_path.is_none());
    }

    #[test]
    fn json_unsupported_version_is_fatal() {
        let content = r#"{"Version": "2.0", "Data": {}}"#;
        assert!(parse_json(Path::new("a.json"), content, false).is_err());
    }

    #[test]
    fn json_missing_data_is_fatal() {
        let content = r#"{"Version": "1.1"}"#;
        assert!(parse_json(Path::new("a.json"), content, false).is_err());
    }

    // --- cache behaviour ---

    #[test]
    fn cache_returns_none_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DependencyCache::new();
        cache.mount(dir.path(), dir.path().join("deps.bin"));
        let info = cache
            .try_get_dependency_info(&dir.path().join("missing.d"))
            .unwrap();
        assert!(info.is_none());
    }

    #[test]
    fn cache_memoizes_and_reparses_on_newer_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DependencyCache::new();
        cache.mount(dir.path(), dir.path().join("deps.bin"));

        let path = write(dir.path(), "a.d", "a.o: /inc/one.h\n");
        let first = cache.try_get_dependency_info(&path).unwrap().unwrap();
        assert_eq!(first.files, vec![PathBuf::from("/inc/one.h")]);

        // Rewrite with a strictly newer mtime; the entry must be replaced.
        std::fs::write(&path, "a.o: /inc/two.h\n").unwrap();
        let newer = first.last_write_time + std::time::Duration::from_secs(5);
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(newer).unwrap();
        drop(file);

        let second = cache.try_get_dependency_info(&path).unwrap().unwrap();
        assert_eq!(second.files, vec![PathBuf::from("/inc/two.h")]);
    }

    #[test]
    fn cache_round_trips_through_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("deps.bin");
        let path = write(dir.path(), "a.d", "a.o: /inc/one.h /inc/two.h\n");

        let cache = DependencyCache::new();
        cache.mount(dir.path(), &archive_path);
        let original = cache.try_get_dependency_info(&path).unwrap().unwrap();
        cache.flush().unwrap();

        let reloaded = DependencyCache::new();
        reloaded.mount(dir.path(), &archive_path);
        let entry = reloaded.try_get_dependency_info(&path).unwrap().unwrap();
        assert_eq!(entry.as_ref(), original.as_ref());
    }

    #[test]
    fn queries_route_to_first_matching_partition() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let cache = DependencyCache::new();
        cache.mount(dir_a.path(), dir_a.path().join("deps.bin"));
        cache.mount(dir_b.path(), dir_b.path().join("deps.bin"));

        let path = write(dir_b.path(), "b.d", "b.o: /inc/b.h\n");
        let info = cache.try_get_dependency_info(&path).unwrap().unwrap();
        assert_eq!(info.files, vec![PathBuf::from("/inc/b.h")]);
    }

    #[test]
    fn accessor_helpers_project_fields() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DependencyCache::new();
        cache.mount(dir.path(), dir.path().join("deps.bin"));

        let content = r#"{
            "Version": "1.1",
            "Data": {
                "ProvidedModule": "App.Main",
                "ImportedModules": [{"Name": "Core", "BMI": "/bmi/Core.ifc"}],
                "Includes": ["/inc/a.h"]
            }
        }"#;
        let path = write(dir.path(), "a.json", content);

        assert_eq!(
            cache.try_get_produced_module(&path).unwrap().as_deref(),
            Some("App.Main")
        );
        let imports = cache.try_get_imported_modules(&path).unwrap().unwrap();
        assert_eq!(imports[0].name, "Core");
        let deps = cache.try_get_dependencies(&path).unwrap().unwrap();
        assert_eq!(deps, vec![PathBuf::from("/inc/a.h")]);
    }
}
