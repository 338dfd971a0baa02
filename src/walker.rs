use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use globset::{Glob, GlobMatcher};
use tracing::warn;

use crate::{
    error::{Error, Result},
    progress::FailedSource,
};

/// A discovered document file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the directory it was found in (the file name for
    /// files given directly).
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

impl DiscoveredFile {
    /// The source identifier recorded on every chunk of this file.
    pub fn source(&self) -> String {
        self.absolute_path.to_string_lossy().into_owned()
    }
}

/// Supported file extensions for document discovery.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

/// Recursively walk a directory and discover eligible document files.
///
/// Skips hidden files/directories (names starting with `.`) and only
/// returns files with supported extensions. When `pattern` is given, only
/// files whose path relative to `root` matches it are returned.
///
/// Entries that cannot be read are returned as failures and the walk
/// carries on with their siblings. Only an unusable `root` is an error.
pub fn discover_files(
    root: &Path,
    pattern: Option<&GlobMatcher>,
) -> Result<(Vec<DiscoveredFile>, Vec<FailedSource>)> {
    let canonical_root = root.canonicalize()?;
    let mut walk = Walk::default();
    walk.dir(&canonical_root, &canonical_root);

    let Walk {
        mut files,
        failures,
    } = walk;
    if let Some(glob) = pattern {
        files.retain(|f| glob.is_match(&f.relative_path));
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok((files, failures))
}

/// Compile a `--pattern` glob.
pub fn compile_pattern(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| Error::Config(format!("invalid pattern {pattern:?}: {e}")))
}

/// Expand input paths into the files to index.
///
/// Directories are walked with [`discover_files`]; files are taken as-is
/// when their format is supported. Inputs that cannot be used are
/// returned as failures instead of aborting the whole expansion.
pub fn resolve_inputs(
    paths: &[PathBuf],
    pattern: Option<&GlobMatcher>,
) -> (Vec<DiscoveredFile>, Vec<FailedSource>) {
    let mut files = Vec::new();
    let mut failures = Vec::new();

    for path in paths {
        let outcome = if path.is_dir() {
            discover_files(path, pattern)
        } else {
            single_file(path).map(|f| (vec![f], Vec::new()))
        };

        match outcome {
            Ok((found, unreadable)) => {
                files.extend(found);
                failures.extend(unreadable);
            }
            Err(err) => failures.push(FailedSource {
                source: path.to_string_lossy().into_owned(),
                reason: err.to_string(),
            }),
        }
    }

    // The same file reached through two inputs is indexed once.
    let mut seen = HashSet::new();
    files.retain(|f| seen.insert(f.absolute_path.clone()));

    (files, failures)
}

fn single_file(path: &Path) -> Result<DiscoveredFile> {
    let absolute_path = path.canonicalize()?;
    if !is_supported(&absolute_path) {
        return Err(Error::UnsupportedFormat(path.to_path_buf()));
    }
    let relative_path = absolute_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| absolute_path.clone());
    Ok(DiscoveredFile {
        relative_path,
        absolute_path,
    })
}

#[derive(Default)]
struct Walk {
    files: Vec<DiscoveredFile>,
    failures: Vec<FailedSource>,
}

impl Walk {
    fn fail(&mut self, path: &Path, err: std::io::Error) {
        warn!(path = %path.display(), error = %err, "cannot read entry");
        self.failures.push(FailedSource {
            source: path.to_string_lossy().into_owned(),
            reason: Error::Io(err).to_string(),
        });
    }

    fn dir(&mut self, root: &Path, current: &Path) {
        let entries = match std::fs::read_dir(current) {
            Ok(entries) => entries,
            Err(err) => return self.fail(current, err),
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    self.fail(current, err);
                    continue;
                }
            };
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();

            // Skip hidden files and directories.
            if name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    self.fail(&path, err);
                    continue;
                }
            };

            if file_type.is_dir() {
                self.dir(root, &path);
            } else if file_type.is_symlink() {
                let resolved = match path.canonicalize() {
                    Ok(p) => p,
                    Err(_) => continue, // Skip broken symlinks
                };
                // Directory links are not followed (cycle prevention).
                if resolved.is_file() && is_supported(&resolved) {
                    self.files.push(make_discovered(root, &path, resolved));
                }
            } else if file_type.is_file() && is_supported(&path) {
                match path.canonicalize() {
                    Ok(abs) => self.files.push(make_discovered(root, &path, abs)),
                    Err(err) => self.fail(&path, err),
                }
            }
        }
    }
}

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

fn make_discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: PathBuf,
) -> DiscoveredFile {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();

    DiscoveredFile {
        relative_path,
        absolute_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(files: &[DiscoveredFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn discovers_supported_formats() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("note.md"), "# Hello").unwrap();
        std::fs::write(tmp.path().join("readme.txt"), "Hello").unwrap();
        std::fs::write(tmp.path().join("long.markdown"), "Hello").unwrap();
        std::fs::write(tmp.path().join("image.png"), "binary").unwrap();

        let files = discover_files(tmp.path(), None).unwrap().0;
        assert_eq!(names(&files), vec!["long.markdown", "note.md", "readme.txt"]);
    }

    #[test]
    fn skips_hidden_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join(".git");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("config.md"), "git config").unwrap();
        std::fs::write(tmp.path().join(".hidden.md"), "secret").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "notes").unwrap();

        let files = discover_files(tmp.path(), None).unwrap().0;
        assert_eq!(names(&files), vec!["notes.md"]);
    }

    #[test]
    fn recurses_subdirectories_in_sorted_order() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("subdir");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("deep.md"), "deep").unwrap();
        std::fs::write(tmp.path().join("top.md"), "top").unwrap();
        std::fs::write(tmp.path().join("a.md"), "a").unwrap();

        let files = discover_files(tmp.path(), None).unwrap().0;
        assert_eq!(names(&files), vec!["a.md", "subdir/deep.md", "top.md"]);
    }

    #[test]
    fn pattern_filters_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("guides");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("intro.md"), "intro").unwrap();
        std::fs::write(tmp.path().join("todo.txt"), "todo").unwrap();

        let glob = Glob::new("**/*.md").unwrap().compile_matcher();
        let files = discover_files(tmp.path(), Some(&glob)).unwrap().0;
        assert_eq!(names(&files), vec!["guides/intro.md"]);
    }

    #[test]
    fn resolve_inputs_mixes_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("a.md"), "a").unwrap();
        let single = tmp.path().join("single.txt");
        std::fs::write(&single, "single").unwrap();

        let (files, failures) =
            resolve_inputs(&[dir.clone(), single.clone()], None);
        assert!(failures.is_empty());
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].relative_path, PathBuf::from("single.txt"));
        assert_eq!(files[1].source(), single.canonicalize().unwrap().to_string_lossy());
    }

    #[test]
    fn resolve_inputs_reports_unusable_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("photo.png");
        std::fs::write(&image, "png").unwrap();
        let missing = tmp.path().join("missing");

        let (files, failures) = resolve_inputs(&[image, missing], None);
        assert!(files.is_empty());
        assert_eq!(failures.len(), 2);
        assert!(failures[0].reason.contains("unsupported"));
    }

    #[test]
    fn resolve_inputs_deduplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.md");
        std::fs::write(&file, "a").unwrap();

        let (files, _) =
            resolve_inputs(&[tmp.path().to_path_buf(), file], None);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let files = discover_files(tmp.path(), None).unwrap().0;
        assert!(files.is_empty());
    }

    #[test]
    fn vanished_directory_is_recorded_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::write(root.join("kept.md"), "kept").unwrap();

        let mut walk = Walk::default();
        walk.dir(&root, &root.join("gone"));
        walk.dir(&root, &root);

        assert_eq!(walk.failures.len(), 1);
        assert!(walk.failures[0].source.ends_with("gone"));
        assert_eq!(names(&walk.files), vec!["kept.md"]);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdirectory_keeps_siblings() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let locked = tmp.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("hidden.md"), "unreachable").unwrap();
        std::fs::write(tmp.path().join("open.md"), "reachable").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000))
            .unwrap();

        // Privileged users read through permission bits.
        let readable = std::fs::read_dir(&locked).is_ok();
        let (files, failures) = resolve_inputs(&[tmp.path().to_path_buf()], None);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755))
            .unwrap();
        if readable {
            return;
        }

        assert_eq!(names(&files), vec!["open.md"]);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].source.ends_with("locked"));
    }

    #[test]
    fn compile_pattern_rejects_bad_globs() {
        assert!(compile_pattern("**/*.md").is_ok());
        assert!(matches!(compile_pattern("["), Err(Error::Config(_))));
    }
}
