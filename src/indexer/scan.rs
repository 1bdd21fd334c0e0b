use anyhow::{Context, Result, bail};
use blake3::Hasher;
use ignore::WalkBuilder;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub hash: String,
    pub size: i64,
    /// Stem of the nearest `*.csproj`, else the first path segment.
    pub module: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub no_ignore: bool,
}

impl ScanOptions {
    pub fn new(no_ignore: bool) -> Self {
        Self { no_ignore }
    }
}

const SOURCE_EXTENSIONS: &[&str] = &["cs", "csx"];
const PROJECT_EXTENSION: &str = "csproj";

pub fn scan_repo(repo_root: &Path) -> Result<Vec<ScannedFile>> {
    scan_repo_with_options(repo_root, ScanOptions::default())
}

/// Enumerate C# sources under `repo_root`. Only a root that cannot be walked
/// at all is an error; unreadable entries are logged and skipped.
pub fn scan_repo_with_options(repo_root: &Path, options: ScanOptions) -> Result<Vec<ScannedFile>> {
    if !repo_root.is_dir() {
        bail!("repository root {} is not a directory", repo_root.display());
    }
    let mut builder = WalkBuilder::new(repo_root);
    if options.no_ignore {
        builder
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false);
    } else {
        builder
            .ignore(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .parents(true)
            .require_git(false);
    }
    let walker = builder
        .hidden(false)
        .filter_entry(|entry| !is_ignored_entry(entry))
        .build();

    let mut sources = Vec::new();
    let mut projects: BTreeMap<String, String> = BTreeMap::new();
    for entry in walker {
        let entry = match entry {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("walk error: {err}");
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(PROJECT_EXTENSION) {
            let dir = path
                .parent()
                .and_then(|parent| crate::util::normalize_rel_path(repo_root, parent).ok())
                .unwrap_or_else(|| ".".to_string());
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                projects.entry(dir).or_insert_with(|| stem.to_string());
            }
            continue;
        }
        if !is_source_path(path) {
            continue;
        }
        sources.push(path.to_path_buf());
    }

    let mut files = Vec::with_capacity(sources.len());
    for path in sources {
        match scanned_file(repo_root, &path, &projects) {
            Ok(file) => files.push(file),
            Err(err) => tracing::warn!("skip {}: {err:#}", path.display()),
        }
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

fn is_ignored_entry(entry: &ignore::DirEntry) -> bool {
    match entry.file_name() {
        name if name == OsStr::new(".colldex") => true,
        name if name == OsStr::new(".git") => true,
        name if name == OsStr::new("bin") || name == OsStr::new("obj") => {
            entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false)
        }
        _ => false,
    }
}

pub fn is_source_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn scanned_file(
    repo_root: &Path,
    path: &Path,
    projects: &BTreeMap<String, String>,
) -> Result<ScannedFile> {
    let rel_path = crate::util::normalize_rel_path(repo_root, path)?;
    let metadata = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let hash = hash_file(path).with_context(|| format!("hash {}", path.display()))?;
    Ok(ScannedFile {
        module: module_for_path(&rel_path, projects),
        rel_path,
        abs_path: path.to_path_buf(),
        hash,
        size: metadata.len() as i64,
    })
}

/// Nearest enclosing project wins; `projects` maps project dirs to project names.
pub fn module_for_path(rel_path: &str, projects: &BTreeMap<String, String>) -> String {
    let mut dir = Path::new(rel_path).parent();
    while let Some(current) = dir {
        let key = crate::util::normalize_path(current);
        if let Some(name) = projects.get(&key) {
            return name.clone();
        }
        dir = current.parent();
    }
    let mut parts = rel_path.split('/');
    match (parts.next(), parts.next()) {
        (Some(first), Some(_)) => first.to_string(),
        _ => String::new(),
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    let mut hasher = Hasher::new();
    hasher.update(&data);
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_prefers_nearest_project() {
        let mut projects = BTreeMap::new();
        projects.insert("src/Shop.Api".to_string(), "Shop.Api".to_string());
        projects.insert(".".to_string(), "Root".to_string());
        assert_eq!(
            module_for_path("src/Shop.Api/Models/Order.cs", &projects),
            "Shop.Api"
        );
        assert_eq!(module_for_path("tools/Seed.cs", &projects), "Root");
    }

    #[test]
    fn module_falls_back_to_first_segment() {
        let projects = BTreeMap::new();
        assert_eq!(module_for_path("Billing/Invoice.cs", &projects), "Billing");
        assert_eq!(module_for_path("Invoice.cs", &projects), "");
    }

    #[test]
    fn scan_finds_sources_and_projects() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Shop/Models")).unwrap();
        fs::write(root.join("Shop/Shop.csproj"), "<Project />").unwrap();
        fs::write(root.join("Shop/Models/User.cs"), "class User {}").unwrap();
        fs::write(root.join("README.md"), "# shop").unwrap();
        fs::create_dir_all(root.join("Shop/obj")).unwrap();
        fs::write(root.join("Shop/obj/Generated.cs"), "class Gen {}").unwrap();

        let files = scan_repo(root).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel_path, "Shop/Models/User.cs");
        assert_eq!(files[0].module, "Shop");
        assert_eq!(files[0].hash.len(), 64);
    }

    #[test]
    fn scan_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_repo(&dir.path().join("missing")).is_err());
    }
}
