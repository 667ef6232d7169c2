use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use git2::{Repository, RepositoryInitOptions, Signature, Time};

use crate::error::Result;

/// Marker file distinguishing repositories created by this server from
/// stale pre-migration ones.
pub const VERSION_MARKER_PATH: &str = "omegaup/version";
pub const GITSERVER_VERSION: &str = "1";

const LOCKFILE_NAME: &str = "omegaup.lockfile";

pub const MASTER_REF: &str = "refs/heads/master";
pub const PUBLISHED_REF: &str = "refs/heads/published";
pub const PUBLIC_REF: &str = "refs/heads/public";
pub const PROTECTED_REF: &str = "refs/heads/protected";
pub const PRIVATE_REF: &str = "refs/heads/private";
pub const REVIEW_REF: &str = "refs/meta/review";
pub const CONFIG_REF: &str = "refs/meta/config";

/// Path of the bare repository backing a problem alias.
#[must_use]
pub fn repository_path(root: &Path, alias: &str) -> PathBuf {
    root.join(format!("{alias}.git"))
}

/// Validates a problem alias for use as a path component.
#[must_use]
pub fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= 100
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Deterministic signature used for server-synthesized commits.
pub fn server_signature() -> Result<Signature<'static>> {
    Ok(Signature::new(
        "omegaUp",
        "sistemas@omegaup.com",
        &Time::new(0, 0),
    )?)
}

/// Creates a bare problem repository: the version marker, an initial empty
/// commit on `refs/heads/master` and `refs/heads/published`, and an initial
/// empty ledger on `refs/meta/review`.
pub fn init_repository(path: &Path) -> Result<Repository> {
    let mut options = RepositoryInitOptions::new();
    options.bare(true).initial_head("master");
    let repo = Repository::init_opts(path, &options)?;

    let marker = repo.path().join(VERSION_MARKER_PATH);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&marker, format!("{GITSERVER_VERSION}\n"))?;

    let signature = server_signature()?;

    let empty_tree = {
        let mut builder = repo.treebuilder(None)?;
        builder.write()?
    };
    {
        let tree = repo.find_tree(empty_tree)?;
        let initial = repo.commit(None, &signature, &signature, "Initial commit", &tree, &[])?;
        repo.reference(MASTER_REF, initial, true, "initial commit")?;
        repo.reference(PUBLISHED_REF, initial, true, "initial commit")?;
    }

    let ledger_tree = {
        let empty_blob = repo.blob(&[])?;
        let mut builder = repo.treebuilder(None)?;
        builder.insert("ledger", empty_blob, 0o100644)?;
        builder.write()?
    };
    {
        let tree = repo.find_tree(ledger_tree)?;
        let review = repo.commit(None, &signature, &signature, "Initial commit", &tree, &[])?;
        repo.reference(REVIEW_REF, review, true, "initial commit")?;
    }

    Ok(repo)
}

pub fn open_repository(path: &Path) -> Result<Repository> {
    Ok(Repository::open(path)?)
}

/// Whether the repository carries the version marker expected by the
/// current tooling.
#[must_use]
pub fn has_version_marker(path: &Path) -> bool {
    path.join(VERSION_MARKER_PATH).exists()
}

/// Advisory file lock governing reader/writer exclusion for one repository.
/// Readers take the lock shared, writers exclusive; dropping the lockfile
/// releases any held lock.
pub struct Lockfile {
    path: PathBuf,
    file: Option<File>,
}

impl Lockfile {
    #[must_use]
    pub fn new(repo_path: &Path) -> Self {
        Self {
            path: repo_path.join(LOCKFILE_NAME),
            file: None,
        }
    }

    fn open(&mut self) -> std::io::Result<&File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_ref().unwrap())
    }

    pub fn lock_shared(&mut self) -> Result<()> {
        self.open()?.lock_shared()?;
        Ok(())
    }

    pub fn lock_exclusive(&mut self) -> Result<()> {
        self.open()?.lock_exclusive()?;
        Ok(())
    }

    /// Attempts the exclusive lock without blocking; returns whether it was
    /// acquired.
    pub fn try_lock_exclusive(&mut self) -> Result<bool> {
        match self.open()?.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn unlock(&mut self) -> Result<()> {
        if let Some(file) = &self.file {
            file.unlock()?;
        }
        Ok(())
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.unlock();
        }
    }
}
