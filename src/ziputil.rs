use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use git2::{Oid, Repository, Signature};

use crate::error::{Error, ErrorCategory, Result};
use crate::problem::{canonical_json, ProblemSettings};
use crate::repository::MASTER_REF;
use crate::tree::{build_tree, tree_contents, validate_tree_path};

const MAX_ZIP_BYTES: u64 = 500 * 1024 * 1024;

/// Which subtrees a zip upload replaces. Everything else is preserved from
/// the current master tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipUpdateMask {
    pub cases: bool,
    pub statements: bool,
}

impl ZipUpdateMask {
    pub const ALL: Self = Self {
        cases: true,
        statements: true,
    };
    pub const CASES: Self = Self {
        cases: true,
        statements: false,
    };
    pub const STATEMENTS: Self = Self {
        cases: false,
        statements: true,
    };

    /// Whether `path` belongs to a subtree this mask replaces.
    #[must_use]
    fn selects(&self, path: &str) -> bool {
        let top = path.split('/').next().unwrap_or(path);
        if self.statements && top == "statements" {
            return true;
        }
        if self.cases {
            return matches!(
                top,
                "cases" | "examples" | "interactive" | "solutions" | "validators"
            ) || path == "testplan"
                || path == "settings.json"
                || path == "settings.distrib.json";
        }
        false
    }
}

fn bad_zip(detail: impl Into<String>) -> Error {
    Error::with_detail(ErrorCategory::ProblemBadLayout, detail)
}

/// Decodes a zip archive into a path → contents map. Paths are normalized,
/// traversal is rejected, and a single wrapping directory (the way desktop
/// archivers package a folder) is stripped.
pub fn read_zip(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| bad_zip(format!("malformed zip: {err}")))?;

    let mut contents = BTreeMap::new();
    let mut total: u64 = 0;
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|err| bad_zip(format!("malformed zip: {err}")))?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().trim_start_matches("./").to_string();
        if name.is_empty() {
            continue;
        }
        validate_tree_path(&name)
            .map_err(|_| bad_zip(format!("invalid path '{}' in zip", file.name())))?;

        total += file.size();
        if total > MAX_ZIP_BYTES {
            return Err(Error::with_detail(
                ErrorCategory::TooBig,
                format!("zip exceeds {MAX_ZIP_BYTES} bytes"),
            ));
        }
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        contents.insert(name, data);
    }

    strip_wrapping_directory(contents)
}

fn strip_wrapping_directory(
    contents: BTreeMap<String, Vec<u8>>,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut prefix: Option<String> = None;
    for path in contents.keys() {
        match path.split_once('/') {
            Some((top, _)) => match &prefix {
                None => prefix = Some(top.to_string()),
                Some(existing) if existing == top => {}
                Some(_) => return Ok(contents),
            },
            // A root-level file means there is no wrapping directory.
            None => return Ok(contents),
        }
    }
    let Some(prefix) = prefix else {
        return Ok(contents);
    };
    if matches!(
        prefix.as_str(),
        "cases" | "examples" | "interactive" | "solutions" | "statements" | "validators"
    ) {
        return Ok(contents);
    }
    Ok(contents
        .into_iter()
        .map(|(path, data)| (path[prefix.len() + 1..].to_string(), data))
        .collect())
}

/// Converts a decoded zip into a commit and an equivalent packfile
/// targeting `refs/heads/master`: the selected subtrees replace the current
/// master's wholesale, the rest is preserved verbatim. The result re-enters
/// the reference policy engine, which canonicalizes it.
pub fn convert_zip_to_packfile(
    repo: &Repository,
    zip_contents: BTreeMap<String, Vec<u8>>,
    settings_override: Option<&ProblemSettings>,
    mask: ZipUpdateMask,
    author: &Signature<'_>,
    committer: &Signature<'_>,
    commit_message: &str,
) -> Result<(Oid, Vec<u8>)> {
    // A scratch handle keeps the mempack backend private to this call.
    let repo = &Repository::open(repo.path())?;
    let odb = repo.odb()?;
    let mempack = odb.add_new_mempack_backend(999)?;

    let parent = match repo.find_reference(MASTER_REF) {
        Ok(reference) => reference
            .target()
            .map(|oid| repo.find_commit(oid))
            .transpose()?,
        Err(err) if err.code() == git2::ErrorCode::NotFound => None,
        Err(err) => return Err(err.into()),
    };

    let mut merged: BTreeMap<String, Vec<u8>> = match &parent {
        Some(commit) => {
            let tree = commit.tree()?;
            tree_contents(repo, &tree, MAX_ZIP_BYTES)?
                .into_iter()
                .filter(|(path, _)| !mask.selects(path))
                .collect()
        }
        None => BTreeMap::new(),
    };
    for (path, data) in zip_contents {
        if mask.selects(&path) {
            merged.insert(path, data);
        }
    }
    if let Some(settings) = settings_override {
        merged.insert("settings.json".to_string(), canonical_json(settings)?);
    }

    let tree_oid = build_tree(repo, &merged)?;
    let tree = repo.find_tree(tree_oid)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let commit = repo.commit(None, author, committer, commit_message, &tree, &parents)?;

    let mut pack = git2::Buf::new();
    mempack.dump(repo, &mut pack)?;
    Ok((commit, pack.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    pub fn create_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_read_zip_normalizes() {
        let bytes = create_zip(&[
            ("./cases/0.in", "1 2"),
            ("cases/0.out", "3"),
        ]);
        let contents = read_zip(&bytes).unwrap();
        assert_eq!(contents.len(), 2);
        assert!(contents.contains_key("cases/0.in"));
    }

    #[test]
    fn test_read_zip_rejects_traversal() {
        let bytes = create_zip(&[("../escape", "x")]);
        assert!(read_zip(&bytes).is_err());
    }

    #[test]
    fn test_strips_wrapping_directory() {
        let bytes = create_zip(&[
            ("sumas/cases/0.in", "1 2"),
            ("sumas/cases/0.out", "3"),
            ("sumas/statements/es.markdown", "Sumas"),
        ]);
        let contents = read_zip(&bytes).unwrap();
        assert!(contents.contains_key("cases/0.in"));
        assert!(contents.contains_key("statements/es.markdown"));
    }

    #[test]
    fn test_mask_selection() {
        assert!(ZipUpdateMask::CASES.selects("cases/0.in"));
        assert!(ZipUpdateMask::CASES.selects("testplan"));
        assert!(ZipUpdateMask::CASES.selects("settings.json"));
        assert!(!ZipUpdateMask::CASES.selects("statements/es.markdown"));
        assert!(ZipUpdateMask::STATEMENTS.selects("statements/es.markdown"));
        assert!(!ZipUpdateMask::STATEMENTS.selects("cases/0.in"));
        assert!(ZipUpdateMask::ALL.selects("validators/validator.py"));
    }
}
