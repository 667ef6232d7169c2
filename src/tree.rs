use std::collections::BTreeMap;

use git2::{ObjectType, Odb, Oid, Repository, Tree};
use serde::de::DeserializeOwned;

use crate::error::{Error, ErrorCategory, Result};

pub const BLOB_MODE: i32 = 0o100644;
pub const TREE_MODE: i32 = 0o040000;

/// Validates a POSIX path for inclusion in a tree: relative, no empty
/// segments, no `.`/`..` traversal.
pub fn validate_tree_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return Err(Error::with_detail(
            ErrorCategory::ProblemBadLayout,
            format!("invalid path '{path}'"),
        ));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::with_detail(
                ErrorCategory::ProblemBadLayout,
                format!("invalid path '{path}'"),
            ));
        }
    }
    Ok(())
}

/// Builds nested tree objects from a flat map of POSIX paths to contents.
/// Blobs get mode `0100644`, trees `040000`.
pub fn build_tree(repo: &Repository, contents: &BTreeMap<String, Vec<u8>>) -> Result<Oid> {
    for path in contents.keys() {
        validate_tree_path(path)?;
    }
    let entries: Vec<(&str, &[u8])> = contents
        .iter()
        .map(|(path, data)| (path.as_str(), data.as_slice()))
        .collect();
    build_subtree(repo, &entries)
}

fn build_subtree(repo: &Repository, entries: &[(&str, &[u8])]) -> Result<Oid> {
    let mut builder = repo.treebuilder(None)?;
    let mut subdirectories: BTreeMap<&str, Vec<(&str, &[u8])>> = BTreeMap::new();

    for (path, data) in entries {
        match path.split_once('/') {
            None => {
                let oid = repo.blob(data)?;
                builder.insert(path, oid, BLOB_MODE)?;
            }
            Some((directory, rest)) => {
                subdirectories
                    .entry(directory)
                    .or_default()
                    .push((rest, data));
            }
        }
    }

    for (directory, children) in subdirectories {
        if builder.get(directory)?.is_some() {
            return Err(Error::with_detail(
                ErrorCategory::ProblemBadLayout,
                format!("path '{directory}' is both a file and a directory"),
            ));
        }
        let oid = build_subtree(repo, &children)?;
        builder.insert(directory, oid, TREE_MODE)?;
    }

    Ok(builder.write()?)
}

/// Recursive union of two trees; entries from `over` shadow `under`.
pub fn merge_trees(repo: &Repository, over: &Tree<'_>, under: &Tree<'_>) -> Result<Oid> {
    let mut builder = repo.treebuilder(None)?;

    let mut names: Vec<String> = Vec::new();
    for entry in over.iter().chain(under.iter()) {
        let name = entry
            .name()
            .ok_or_else(|| Error::Unpack("non-utf8 tree entry name".to_string()))?
            .to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }

    for name in names {
        let over_entry = over.get_name(&name);
        let under_entry = under.get_name(&name);
        match (over_entry, under_entry) {
            (Some(a), Some(b))
                if a.kind() == Some(ObjectType::Tree) && b.kind() == Some(ObjectType::Tree) =>
            {
                let over_subtree = repo.find_tree(a.id())?;
                let under_subtree = repo.find_tree(b.id())?;
                let merged = merge_trees(repo, &over_subtree, &under_subtree)?;
                builder.insert(&name, merged, TREE_MODE)?;
            }
            (Some(entry), _) | (None, Some(entry)) => {
                builder.insert(&name, entry.id(), entry.filemode())?;
            }
            (None, None) => unreachable!(),
        }
    }

    Ok(builder.write()?)
}

/// Looks up a blob within a tree. Returns `None` when the path does not
/// resolve to a blob.
pub fn read_blob(repo: &Repository, tree: &Tree<'_>, path: &str) -> Result<Option<Vec<u8>>> {
    let entry = match tree.get_path(std::path::Path::new(path)) {
        Ok(entry) => entry,
        Err(err) if err.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if entry.kind() != Some(ObjectType::Blob) {
        return Ok(None);
    }
    let blob = repo.find_blob(entry.id())?;
    Ok(Some(blob.content().to_vec()))
}

/// Looks up a blob and parses it as JSON into `T`.
pub fn extract_json<T: DeserializeOwned>(
    repo: &Repository,
    tree: &Tree<'_>,
    path: &str,
) -> Result<T> {
    let contents = read_blob(repo, tree, path)?.ok_or_else(|| {
        Error::with_detail(
            ErrorCategory::InternalGit,
            format!("the path '{path}' does not exist in the given tree"),
        )
    })?;
    serde_json::from_slice(&contents)
        .map_err(|err| Error::with_detail(ErrorCategory::JsonParseError, format!("{path}: {err}")))
}

/// Flattens a tree into a path → contents map, failing with `too-big` once
/// the accumulated blob bytes exceed `max_bytes`.
pub fn tree_contents(
    repo: &Repository,
    tree: &Tree<'_>,
    max_bytes: u64,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut contents = BTreeMap::new();
    let mut total: u64 = 0;
    flatten_tree(repo, tree, "", &mut contents, &mut total, max_bytes)?;
    Ok(contents)
}

fn flatten_tree(
    repo: &Repository,
    tree: &Tree<'_>,
    prefix: &str,
    contents: &mut BTreeMap<String, Vec<u8>>,
    total: &mut u64,
    max_bytes: u64,
) -> Result<()> {
    for entry in tree.iter() {
        let name = entry
            .name()
            .ok_or_else(|| Error::Unpack("non-utf8 tree entry name".to_string()))?;
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        match entry.kind() {
            Some(ObjectType::Tree) => {
                let subtree = repo.find_tree(entry.id())?;
                flatten_tree(repo, &subtree, &path, contents, total, max_bytes)?;
            }
            Some(ObjectType::Blob) => {
                let blob = repo.find_blob(entry.id())?;
                *total += blob.size() as u64;
                if *total > max_bytes {
                    return Err(Error::with_detail(
                        ErrorCategory::TooBig,
                        format!("problem exceeds the maximum size of {max_bytes} bytes"),
                    ));
                }
                contents.insert(path, blob.content().to_vec());
            }
            _ => {
                return Err(Error::Unpack(format!("unsupported tree entry at '{path}'")));
            }
        }
    }
    Ok(())
}

/// Verifies that every object reachable from `tree` is present in the
/// object database, counting visited entries *without* deduplication. A
/// gitbomb whose logical expansion exceeds `limit` is rejected long before
/// its exponential blowup is materialized.
pub fn ensure_connectivity(
    repo: &Repository,
    odb: &Odb<'_>,
    tree: &Tree<'_>,
    limit: usize,
) -> Result<()> {
    let mut visited: usize = 0;
    walk_connectivity(repo, odb, tree, limit, &mut visited)
}

fn walk_connectivity(
    repo: &Repository,
    odb: &Odb<'_>,
    tree: &Tree<'_>,
    limit: usize,
    visited: &mut usize,
) -> Result<()> {
    for entry in tree.iter() {
        *visited += 1;
        if *visited > limit {
            return Err(Error::categorized(ErrorCategory::TooManyObjectsInPackfile));
        }
        match entry.kind() {
            Some(ObjectType::Tree) => {
                let subtree = repo.find_tree(entry.id())?;
                walk_connectivity(repo, odb, &subtree, limit, visited)?;
            }
            _ => {
                odb.read_header(entry.id())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        (dir, repo)
    }

    fn contents(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(path, data)| (path.to_string(), data.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_build_tree_nested() {
        let (_dir, repo) = test_repo();
        let oid = build_tree(
            &repo,
            &contents(&[
                ("settings.json", "{}"),
                ("cases/0.in", "1 2"),
                ("cases/0.out", "3\n"),
            ]),
        )
        .unwrap();
        let tree = repo.find_tree(oid).unwrap();
        assert!(tree.get_name("settings.json").is_some());
        let cases = tree.get_name("cases").unwrap();
        assert_eq!(cases.kind(), Some(ObjectType::Tree));

        let flattened = tree_contents(&repo, &tree, u64::MAX).unwrap();
        assert_eq!(flattened.len(), 3);
        assert_eq!(flattened["cases/0.out"], b"3\n");
    }

    #[test]
    fn test_build_tree_rejects_traversal() {
        let (_dir, repo) = test_repo();
        assert!(build_tree(&repo, &contents(&[("../escape", "x")])).is_err());
        assert!(build_tree(&repo, &contents(&[("/absolute", "x")])).is_err());
        assert!(build_tree(&repo, &contents(&[("a//b", "x")])).is_err());
    }

    #[test]
    fn test_merge_trees_precedence() {
        let (_dir, repo) = test_repo();
        let over = build_tree(
            &repo,
            &contents(&[("statements/es.markdown", "new"), ("cases/1.in", "1")]),
        )
        .unwrap();
        let under = build_tree(
            &repo,
            &contents(&[("statements/es.markdown", "old"), ("cases/0.in", "0")]),
        )
        .unwrap();

        let over_tree = repo.find_tree(over).unwrap();
        let under_tree = repo.find_tree(under).unwrap();
        let merged = merge_trees(&repo, &over_tree, &under_tree).unwrap();
        let merged_tree = repo.find_tree(merged).unwrap();

        let flattened = tree_contents(&repo, &merged_tree, u64::MAX).unwrap();
        assert_eq!(flattened["statements/es.markdown"], b"new");
        assert_eq!(flattened["cases/0.in"], b"0");
        assert_eq!(flattened["cases/1.in"], b"1");
    }

    #[test]
    fn test_connectivity_limit() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb().unwrap();

        // Chained trees with two entries each: a miniature gitbomb.
        let blob = repo.blob(&[]).unwrap();
        let mut oid = blob;
        let mut mode = BLOB_MODE;
        for _ in 0..8 {
            let mut builder = repo.treebuilder(None).unwrap();
            builder.insert("0", oid, mode).unwrap();
            builder.insert("1", oid, mode).unwrap();
            oid = builder.write().unwrap();
            mode = TREE_MODE;
        }
        let tree = repo.find_tree(oid).unwrap();

        assert!(ensure_connectivity(&repo, &odb, &tree, 1 << 20).is_ok());
        let err = ensure_connectivity(&repo, &odb, &tree, 100).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TooManyObjectsInPackfile);
    }
}
