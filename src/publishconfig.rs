use git2::{ObjectType, Repository, Tree};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorCategory, Result};
use crate::tree::read_blob;

/// `refs/meta/config` payload: where and how an accepted problem is
/// published externally.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishingConfig {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub publishing: PublishingConfig,
}

/// Validates the single-file `refs/meta/config` tree. An empty tree is
/// accepted and clears the publishing configuration.
pub fn validate_config_tree(repo: &Repository, tree: &Tree<'_>) -> Result<()> {
    if tree.len() == 0 {
        return Ok(());
    }
    let only_config = tree.len() == 1
        && tree
            .get(0)
            .is_some_and(|entry| {
                entry.name() == Some("config.json") && entry.kind() == Some(ObjectType::Blob)
            });
    if !only_config {
        return Err(Error::with_detail(
            ErrorCategory::ConfigBadLayout,
            "refs/meta/config can only contain a single config.json file",
        ));
    }

    let raw = read_blob(repo, tree, "config.json")?.ok_or_else(|| {
        Error::with_detail(
            ErrorCategory::ConfigBadLayout,
            "refs/meta/config can only contain a single config.json file",
        )
    })?;
    let config: RepositoryConfig = serde_json::from_slice(&raw).map_err(|err| {
        Error::with_detail(ErrorCategory::JsonParseError, format!("config.json: {err}"))
    })?;

    match config.publishing.mode.as_str() {
        "mirror" | "subdirectory" => {}
        _ => {
            return Err(Error::categorized(
                ErrorCategory::ConfigInvalidPublishingMode,
            ));
        }
    }
    if Url::parse(&config.publishing.repository).is_err() {
        return Err(Error::categorized(
            ErrorCategory::ConfigRepositoryNotAbsoluteUrl,
        ));
    }
    if config.publishing.mode == "subdirectory"
        && config
            .publishing
            .target
            .as_deref()
            .unwrap_or("")
            .is_empty()
    {
        return Err(Error::categorized(
            ErrorCategory::ConfigSubdirectoryMissingTarget,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::build_tree;
    use std::collections::BTreeMap;

    fn config_tree(repo: &Repository, entries: &[(&str, &str)]) -> git2::Oid {
        let contents: BTreeMap<String, Vec<u8>> = entries
            .iter()
            .map(|(path, data)| (path.to_string(), data.as_bytes().to_vec()))
            .collect();
        build_tree(repo, &contents).unwrap()
    }

    fn validate(entries: &[(&str, &str)]) -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        let oid = config_tree(&repo, entries);
        let tree = repo.find_tree(oid).unwrap();
        validate_config_tree(&repo, &tree)
    }

    #[test]
    fn test_accepts_mirror_and_subdirectory() {
        validate(&[(
            "config.json",
            r#"{"publishing":{"mode":"mirror","repository":"https://github.com/omegaup/test.git"}}"#,
        )])
        .unwrap();
        validate(&[(
            "config.json",
            r#"{"publishing":{"mode":"subdirectory","repository":"https://github.com/omegaup/test.git","target":"sub"}}"#,
        )])
        .unwrap();
        validate(&[]).unwrap();
    }

    #[test]
    fn test_rejects_extra_files() {
        let err = validate(&[
            ("config.json", "{}"),
            ("garbage.txt", ""),
        ])
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConfigBadLayout);
    }

    #[test]
    fn test_rejects_bad_schema() {
        let err = validate(&[("config.json", "invalid json")]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::JsonParseError);

        let err = validate(&[("config.json", r#"{"publishing":{"mode":"invalid"}}"#)])
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConfigInvalidPublishingMode);

        let err = validate(&[(
            "config.json",
            r#"{"publishing":{"mode":"mirror","repository":"invalid"}}"#,
        )])
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConfigRepositoryNotAbsoluteUrl);

        let err = validate(&[(
            "config.json",
            r#"{"publishing":{"mode":"subdirectory","repository":"https://github.com/omegaup/test.git"}}"#,
        )])
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConfigSubdirectoryMissingTarget);
    }
}
