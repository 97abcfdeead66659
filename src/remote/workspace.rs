//! Inspection of the local workspace before it is shipped to pods.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

use super::RemoteError;

/// Base ignore file shared with git.
pub const GIT_IGNORE_FILE: &str = ".gitignore";
/// Additional patterns excluded only from pod syncs.
pub const EXTRA_IGNORE_FILE: &str = ".podfleetignore";
/// Patterns removed again from the computed exclude list.
pub const INCLUDE_FILE: &str = ".podfleetinclude";

const ALWAYS_EXCLUDED: &str = ".git";

/// How the remote workspace installs its dependencies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupDescriptor {
    /// `setup.py` or `pyproject.toml`: editable install of the project.
    EditablePackage,
    /// `requirements.txt`: plain requirements list.
    Requirements,
}

impl SetupDescriptor {
    /// Shell command installing the workspace's dependencies through the
    /// pip module of `interpreter`.
    #[must_use]
    pub fn install_command(self, interpreter: &str) -> String {
        let target = match self {
            Self::EditablePackage => "-e .",
            Self::Requirements => "-r requirements.txt",
        };
        format!("{interpreter} -m pip install {target}")
    }
}

fn open(source: &Utf8Path) -> Result<Dir, RemoteError> {
    Dir::open_ambient_dir(source, ambient_authority()).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            RemoteError::MissingSource {
                path: source.to_path_buf(),
            }
        } else {
            RemoteError::WorkspaceRead {
                path: source.to_path_buf(),
                message: err.to_string(),
            }
        }
    })
}

fn exists(dir: &Dir, source: &Utf8Path, name: &str) -> Result<bool, RemoteError> {
    dir.try_exists(name).map_err(|err| RemoteError::WorkspaceRead {
        path: source.join(name),
        message: err.to_string(),
    })
}

/// Reads the non-blank lines of an optional pattern file, skipping lines
/// that start with `#`.
fn read_patterns(dir: &Dir, source: &Utf8Path, name: &str) -> Result<Vec<String>, RemoteError> {
    if !exists(dir, source, name)? {
        return Ok(Vec::new());
    }
    let text = dir
        .read_to_string(name)
        .map_err(|err| RemoteError::WorkspaceRead {
            path: source.join(name),
            message: err.to_string(),
        })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

/// Computes rsync exclude patterns for `source`.
///
/// `.git` is excluded, followed by the patterns of `.gitignore` and
/// `.podfleetignore`. Entries of `.podfleetinclude` are then removed; each
/// must match an excluded pattern exactly. An include of `.git` is accepted
/// but has no effect.
///
/// # Errors
///
/// Returns [`RemoteError::UnknownInclude`] for an include entry that is not
/// excluded, and [`RemoteError::WorkspaceRead`] when a file cannot be read.
pub fn exclude_list(source: &Utf8Path) -> Result<Vec<String>, RemoteError> {
    let dir = open(source)?;
    let mut excludes = vec![ALWAYS_EXCLUDED.to_owned()];
    for name in [GIT_IGNORE_FILE, EXTRA_IGNORE_FILE] {
        for pattern in read_patterns(&dir, source, name)? {
            if !excludes.contains(&pattern) {
                excludes.push(pattern);
            }
        }
    }
    for entry in read_patterns(&dir, source, INCLUDE_FILE)? {
        let Some(position) = excludes.iter().position(|pattern| *pattern == entry) else {
            return Err(RemoteError::UnknownInclude {
                file: INCLUDE_FILE.to_owned(),
                entry,
            });
        };
        excludes.remove(position);
    }
    if !excludes.iter().any(|pattern| pattern == ALWAYS_EXCLUDED) {
        excludes.insert(0, ALWAYS_EXCLUDED.to_owned());
    }
    Ok(excludes)
}

/// Determines how dependencies of `source` are installed.
///
/// # Errors
///
/// Returns [`RemoteError::MissingSetupDescriptor`] when no descriptor is
/// present.
pub fn detect_setup(source: &Utf8Path) -> Result<SetupDescriptor, RemoteError> {
    let dir = open(source)?;
    if exists(&dir, source, "setup.py")? || exists(&dir, source, "pyproject.toml")? {
        return Ok(SetupDescriptor::EditablePackage);
    }
    if exists(&dir, source, "requirements.txt")? {
        return Ok(SetupDescriptor::Requirements);
    }
    Err(RemoteError::MissingSetupDescriptor {
        path: source.to_path_buf(),
    })
}
