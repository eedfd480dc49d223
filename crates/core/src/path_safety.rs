//! Allow-list validation for filesystem paths handed to subprocesses.
//!
//! Every path that reaches an engine or converter argument vector traces
//! back to user-controlled identifiers (target names, dictionary names), so
//! it is resolved to canonical form and checked against configured base
//! directories immediately before use.

use std::path::{Component, Path, PathBuf};

/// Why a candidate path was rejected.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("no allowed base directory is configured or reachable")]
    NoAllowedBase,

    #[error("path is empty or malformed: {0}")]
    Malformed(String),

    #[error("extension not allowed: {0}")]
    DisallowedExtension(String),

    #[error("path escapes the allowed directories: {0}")]
    OutsideAllowedBase(String),

    #[error("symbolic link not allowed: {0}")]
    SymlinkNotAllowed(String),

    #[error("path does not exist: {0}")]
    NotFound(String),

    #[error("I/O error resolving path: {0}")]
    Io(#[from] std::io::Error),
}

/// Rules a candidate path must satisfy.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    /// Directories the resolved path must live under. Relative candidates
    /// are resolved against the first entry.
    pub allowed_base_dirs: Vec<PathBuf>,
    /// Allowed file extensions, without the leading dot, case-insensitive.
    /// Empty means any extension is accepted.
    pub allowed_extensions: Vec<String>,
    /// Reject paths that do not exist yet.
    pub must_exist: bool,
    /// Accept symbolic links inside the allowed directories. Even when
    /// allowed, a link whose target leaves the base directories is rejected.
    pub allow_symlinks: bool,
}

impl PathPolicy {
    /// Policy for an existing input file under `base` with one of `extensions`.
    pub fn input(base: impl Into<PathBuf>, extensions: &[&str]) -> Self {
        Self {
            allowed_base_dirs: vec![base.into()],
            allowed_extensions: extensions.iter().map(|e| e.to_string()).collect(),
            must_exist: true,
            allow_symlinks: false,
        }
    }

    /// Policy for a file the subprocess will create under `base`.
    pub fn output(base: impl Into<PathBuf>) -> Self {
        Self {
            allowed_base_dirs: vec![base.into()],
            allowed_extensions: Vec::new(),
            must_exist: false,
            allow_symlinks: false,
        }
    }
}

/// Resolve `candidate` to a canonical absolute path or reject it.
pub fn validate(candidate: &Path, policy: &PathPolicy) -> Result<PathBuf, PathError> {
    let display = candidate.display().to_string();
    if candidate.as_os_str().is_empty() || display.contains('\0') {
        return Err(PathError::Malformed(display));
    }

    let bases: Vec<PathBuf> = policy
        .allowed_base_dirs
        .iter()
        .filter_map(|b| b.canonicalize().ok())
        .collect();
    let first_base = bases.first().ok_or(PathError::NoAllowedBase)?;

    check_extension(candidate, policy)?;

    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        first_base.join(candidate)
    };

    // Cheap lexical rejection of `..` escapes before touching the filesystem.
    let lexical = normalize_lexically(&absolute);
    let lexical_base = policy
        .allowed_base_dirs
        .iter()
        .chain(bases.iter())
        .find(|b| lexical.starts_with(b))
        .ok_or_else(|| PathError::OutsideAllowedBase(display.clone()))?;

    if !policy.allow_symlinks {
        reject_symlinks(&lexical, lexical_base)?;
    }

    let resolved = resolve(&absolute, policy.must_exist, &display)?;

    if !bases.iter().any(|b| resolved.starts_with(b)) {
        return Err(PathError::OutsideAllowedBase(display));
    }

    // A permitted link may point at a file with a different extension.
    check_extension(&resolved, policy)?;

    Ok(resolved)
}

fn check_extension(path: &Path, policy: &PathPolicy) -> Result<(), PathError> {
    if policy.allowed_extensions.is_empty() {
        return Ok(());
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let allowed = policy
        .allowed_extensions
        .iter()
        .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(&ext));
    if allowed && !ext.is_empty() {
        Ok(())
    } else {
        Err(PathError::DisallowedExtension(path.display().to_string()))
    }
}

/// Canonicalize `absolute`, or its parent when the file may not exist yet.
fn resolve(absolute: &Path, must_exist: bool, display: &str) -> Result<PathBuf, PathError> {
    match absolute.canonicalize() {
        Ok(p) => Ok(p),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if must_exist {
                return Err(PathError::NotFound(display.to_string()));
            }
            let name = match absolute.file_name() {
                Some(n) => n,
                None => return Err(PathError::Malformed(display.to_string())),
            };
            let parent = absolute
                .parent()
                .ok_or_else(|| PathError::Malformed(display.to_string()))?;
            let parent = parent.canonicalize().map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PathError::NotFound(display.to_string()),
                _ => PathError::Io(e),
            })?;
            Ok(parent.join(name))
        }
        Err(e) => Err(PathError::Io(e)),
    }
}

/// Walk every existing segment below `base` and reject symbolic links.
fn reject_symlinks(lexical: &Path, base: &Path) -> Result<(), PathError> {
    let rest = lexical.strip_prefix(base).unwrap_or(lexical);
    let mut current = base.to_path_buf();

    for component in rest.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(PathError::SymlinkNotAllowed(current.display().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(PathError::Io(e)),
        }
    }
    Ok(())
}

/// Collapse `.` and `..` without consulting the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Fixture {
        _root: tempfile::TempDir,
        inputs: PathBuf,
        outside: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().expect("tempdir");
        let inputs = root.path().join("data").join("inputs");
        let outside = root.path().join("etc");
        std::fs::create_dir_all(&inputs).expect("mkdir inputs");
        std::fs::create_dir_all(&outside).expect("mkdir outside");
        std::fs::write(inputs.join("capture.hc22000"), "WPA*02*...").expect("write");
        std::fs::write(inputs.join("words.txt"), "hunter2\n").expect("write");
        std::fs::write(outside.join("passwd"), "root:x:0:0").expect("write");
        Fixture {
            _root: root,
            inputs,
            outside,
        }
    }

    fn any_file(base: &Path) -> PathPolicy {
        PathPolicy {
            allowed_base_dirs: vec![base.to_path_buf()],
            allowed_extensions: Vec::new(),
            must_exist: true,
            allow_symlinks: false,
        }
    }

    #[test]
    fn accepts_file_inside_base() {
        let fx = fixture();
        let policy = PathPolicy::input(&fx.inputs, &["hc22000"]);
        let resolved = validate(Path::new("capture.hc22000"), &policy).expect("valid");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("capture.hc22000"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let fx = fixture();
        let result = validate(Path::new("../../etc/passwd"), &any_file(&fx.inputs));
        assert_matches!(result, Err(PathError::OutsideAllowedBase(_)));
    }

    #[test]
    fn rejects_absolute_path_outside_base() {
        let fx = fixture();
        let result = validate(&fx.outside.join("passwd"), &any_file(&fx.inputs));
        assert_matches!(result, Err(PathError::OutsideAllowedBase(_)));
    }

    #[test]
    fn rejects_sibling_directory_with_shared_prefix() {
        let fx = fixture();
        let sibling = fx.inputs.with_file_name("inputs2");
        std::fs::create_dir_all(&sibling).expect("mkdir");
        std::fs::write(sibling.join("x.txt"), "x").expect("write");
        let result = validate(&sibling.join("x.txt"), &any_file(&fx.inputs));
        assert_matches!(result, Err(PathError::OutsideAllowedBase(_)));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape_even_when_links_allowed() {
        let fx = fixture();
        std::os::unix::fs::symlink(fx.outside.join("passwd"), fx.inputs.join("leak"))
            .expect("symlink");
        let mut policy = any_file(&fx.inputs);
        policy.allow_symlinks = true;
        let result = validate(Path::new("leak"), &policy);
        assert_matches!(result, Err(PathError::OutsideAllowedBase(_)));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_segment_when_links_disallowed() {
        let fx = fixture();
        std::os::unix::fs::symlink(fx.inputs.join("words.txt"), fx.inputs.join("alias.txt"))
            .expect("symlink");
        let result = validate(Path::new("alias.txt"), &any_file(&fx.inputs));
        assert_matches!(result, Err(PathError::SymlinkNotAllowed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn accepts_internal_symlink_when_allowed() {
        let fx = fixture();
        std::os::unix::fs::symlink(fx.inputs.join("words.txt"), fx.inputs.join("alias.txt"))
            .expect("symlink");
        let mut policy = any_file(&fx.inputs);
        policy.allow_symlinks = true;
        let resolved = validate(Path::new("alias.txt"), &policy).expect("valid");
        assert!(resolved.ends_with("words.txt"));
    }

    #[test]
    fn rejects_disallowed_extension() {
        let fx = fixture();
        let policy = PathPolicy::input(&fx.inputs, &["txt"]);
        let result = validate(Path::new("capture.hc22000"), &policy);
        assert_matches!(result, Err(PathError::DisallowedExtension(_)));
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let fx = fixture();
        let policy = PathPolicy::input(&fx.inputs, &[".TXT"]);
        assert!(validate(Path::new("words.txt"), &policy).is_ok());
    }

    #[test]
    fn missing_file_rejected_when_required() {
        let fx = fixture();
        let result = validate(Path::new("nope.txt"), &any_file(&fx.inputs));
        assert_matches!(result, Err(PathError::NotFound(_)));
    }

    #[test]
    fn missing_file_accepted_for_outputs() {
        let fx = fixture();
        let resolved = validate(Path::new("job-1.out"), &PathPolicy::output(&fx.inputs))
            .expect("valid output path");
        assert!(resolved.ends_with("job-1.out"));
        assert!(!resolved.exists());
    }

    #[test]
    fn no_base_dirs_is_rejected() {
        let result = validate(Path::new("x.txt"), &PathPolicy::default());
        assert_matches!(result, Err(PathError::NoAllowedBase));
    }

    #[test]
    fn empty_path_is_malformed() {
        let fx = fixture();
        let result = validate(Path::new(""), &any_file(&fx.inputs));
        assert_matches!(result, Err(PathError::Malformed(_)));
    }
}
