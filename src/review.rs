use std::collections::{BTreeMap, BTreeSet};

use git2::{Commit, ObjectType, Oid, Repository};
use serde::Deserialize;

use crate::error::{Error, ErrorCategory, Result};
use crate::tree::read_blob;

/// One review round, appended to the newline-delimited `ledger` file.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEntry {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub date: Option<f64>,
    #[serde(rename = "Summary", default)]
    pub summary: Option<String>,
}

/// One comment in a per-commit review file.
#[derive(Debug, Clone, Deserialize)]
pub struct CommentEntry {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub date: Option<f64>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(rename = "iterationUuid", default)]
    pub iteration_uuid: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(rename = "parentUuid", default)]
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub range: Option<serde_json::Value>,
}

fn bad_layout(detail: impl Into<String>) -> Error {
    Error::with_detail(ErrorCategory::ReviewBadLayout, detail)
}

fn is_valid_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

/// Extracts the `Iteration: <uuid>` tag from a commit message.
fn iteration_uuid_from_message(message: &str) -> Option<String> {
    for line in message.lines() {
        if let Some(value) = line.trim().strip_prefix("Iteration:") {
            let value = value.trim();
            if is_valid_uuid(value) {
                return Some(value.to_string());
            }
            return None;
        }
    }
    None
}

fn blob_contents(
    repo: &Repository,
    commit: Option<&Commit<'_>>,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let Some(commit) = commit else {
        return Ok(None);
    };
    let tree = commit.tree()?;
    read_blob(repo, &tree, name)
}

/// Validates one new commit on `refs/meta/review` against the current tip:
/// the append-only ledger state machine plus per-commit comment files.
pub fn validate_review_commit(
    repo: &Repository,
    old_commit: Option<&Commit<'_>>,
    new_commit: &Commit<'_>,
) -> Result<()> {
    let message_uuid = iteration_uuid_from_message(new_commit.message().unwrap_or(""))
        .ok_or_else(|| bad_layout("iteration uuid in commit message missing or malformed"))?;

    let tree = new_commit.tree()?;
    for entry in tree.iter() {
        if entry.kind() != Some(ObjectType::Blob) {
            return Err(bad_layout("refs/meta/review must have a flat tree"));
        }
    }

    let ledger_raw = read_blob(repo, &tree, "ledger")?
        .ok_or_else(|| bad_layout("missing ledger file"))?;
    if !ledger_raw.is_empty() && ledger_raw.last() != Some(&b'\n') {
        return Err(bad_layout("ledger does not end in newline"));
    }

    let old_ledger = blob_contents(repo, old_commit, "ledger")?.unwrap_or_default();
    if !ledger_raw.starts_with(&old_ledger) {
        return Err(bad_layout("unexpected non-append to ledger"));
    }

    // Parse the whole ledger; entries before the append point were already
    // validated when they landed.
    let mut ledger_authors: BTreeMap<String, String> = BTreeMap::new();
    let mut last_uuid: Option<String> = None;
    let ledger_text = String::from_utf8_lossy(&ledger_raw).into_owned();
    for line in ledger_text.lines() {
        let entry: LedgerEntry = serde_json::from_str(line).map_err(|err| {
            Error::with_detail(
                ErrorCategory::JsonParseError,
                format!("appended ledger contents: {err}"),
            )
        })?;
        let uuid = entry
            .uuid
            .filter(|u| is_valid_uuid(u))
            .ok_or_else(|| bad_layout("invalid iteration uuid in ledger entry"))?;
        ledger_authors.insert(uuid.clone(), entry.author.unwrap_or_default());
        last_uuid = Some(uuid);
    }

    // The iteration named in the commit message must be the ledger's newest
    // entry, whether or not this commit appended one.
    let latest_uuid = last_uuid.ok_or_else(|| bad_layout("invalid iteration uuid in ledger entry"))?;
    if latest_uuid != message_uuid {
        return Err(bad_layout("invalid iteration uuid in ledger entry"));
    }
    let appended_ledger = ledger_raw.len() > old_ledger.len();

    // Every previously tracked comment file must still be present and must
    // participate in the new iteration.
    let old_files = review_files(old_commit)?;
    for name in &old_files {
        if tree.get_name(name).is_none() {
            return Err(bad_layout(format!(
                "failed to find {name} in review iteration"
            )));
        }
    }

    for entry in tree.iter() {
        let name = entry
            .name()
            .ok_or_else(|| bad_layout("refs/meta/review must have a flat tree"))?;
        if name == "ledger" {
            continue;
        }
        validate_comment_file(
            repo,
            old_commit,
            &tree,
            name,
            &ledger_authors,
            &latest_uuid,
            appended_ledger,
        )?;
    }

    Ok(())
}

fn review_files(commit: Option<&Commit<'_>>) -> Result<Vec<String>> {
    let Some(commit) = commit else {
        return Ok(Vec::new());
    };
    let tree = commit.tree()?;
    let mut files = Vec::new();
    for entry in tree.iter() {
        if let Some(name) = entry.name() {
            if name != "ledger" && entry.kind() == Some(ObjectType::Blob) {
                files.push(name.to_string());
            }
        }
    }
    Ok(files)
}

fn validate_comment_file(
    repo: &Repository,
    old_commit: Option<&Commit<'_>>,
    tree: &git2::Tree<'_>,
    name: &str,
    ledger_authors: &BTreeMap<String, String>,
    latest_uuid: &str,
    appended_ledger: bool,
) -> Result<()> {
    // Non-ledger filenames are the hex oid of the review-target commit.
    let target_oid = Oid::from_str(name)
        .map_err(|_| bad_layout(format!("{name} is not a valid commit id")))?;
    let target_commit = repo
        .find_commit(target_oid)
        .map_err(|_| bad_layout(format!("{name} is not a valid commit id")))?;
    let target_tree = target_commit.tree()?;

    let raw = read_blob(repo, tree, name)?
        .ok_or_else(|| bad_layout("refs/meta/review must have a flat tree"))?;
    let old_raw = blob_contents(repo, old_commit, name)?.unwrap_or_default();
    if !raw.starts_with(&old_raw) {
        return Err(bad_layout(format!("unexpected non-append to {name}")));
    }

    let mut seen_uuids: BTreeSet<String> = BTreeSet::new();
    let old_text = String::from_utf8_lossy(&old_raw).into_owned();
    for line in old_text.lines() {
        if let Ok(entry) = serde_json::from_str::<CommentEntry>(line) {
            if let Some(uuid) = entry.uuid {
                seen_uuids.insert(uuid);
            }
        }
    }

    let appended = &raw[old_raw.len()..];
    let appended_text = String::from_utf8_lossy(appended).into_owned();
    let mut new_comments = 0usize;
    for line in appended_text.lines() {
        let entry: CommentEntry = serde_json::from_str(line).map_err(|err| {
            bad_layout(format!("malformed appended comment in {name}: {err}"))
        })?;
        new_comments += 1;

        // Author must match the author of the iteration it belongs to.
        if let Some(iteration_author) = entry
            .iteration_uuid
            .as_ref()
            .and_then(|uuid| ledger_authors.get(uuid))
        {
            if entry.author.as_deref() != Some(iteration_author.as_str()) {
                return Err(bad_layout(format!("invalid author in {name}")));
            }
        }

        let iteration_uuid = entry
            .iteration_uuid
            .as_ref()
            .filter(|uuid| ledger_authors.contains_key(*uuid))
            .ok_or_else(|| bad_layout(format!("invalid iteration uuid in {name}")))?;
        if iteration_uuid != latest_uuid {
            return Err(bad_layout(format!(
                "failed to find {name} in review iteration"
            )));
        }

        let uuid = entry
            .uuid
            .as_ref()
            .filter(|uuid| is_valid_uuid(uuid))
            .ok_or_else(|| bad_layout(format!("missing or malformed comment uuid in {name}")))?;
        if !seen_uuids.insert(uuid.clone()) {
            return Err(bad_layout(format!("duplicate comment uuid in {name}")));
        }

        let filename = entry.filename.clone().unwrap_or_default();
        if let Err(err) = target_tree.get_path(std::path::Path::new(&filename)) {
            return Err(bad_layout(format!(
                "file '{filename}' not found in {name}: {}",
                err.message()
            )));
        }

        if entry.parent_uuid.is_some() && entry.range.is_some() {
            return Err(bad_layout(format!(
                "cannot specify both parentUuid and range in {name}"
            )));
        }
        if let Some(parent_uuid) = &entry.parent_uuid {
            if !seen_uuids.contains(parent_uuid) || parent_uuid == uuid {
                return Err(bad_layout(format!("parent uuid missing in {name}")));
            }
        }

        if entry.message.as_deref().unwrap_or("").is_empty() {
            return Err(bad_layout(format!("empty comment message in {name}")));
        }
    }

    // A new iteration must annotate every tracked file.
    if appended_ledger && new_comments == 0 && !old_raw.is_empty() {
        return Err(bad_layout(format!(
            "failed to find {name} in review iteration"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_uuid_from_message() {
        assert_eq!(
            iteration_uuid_from_message(
                "Foo\n\nIteration: 00000000-0000-0000-0000-000000000000"
            ),
            Some("00000000-0000-0000-0000-000000000000".to_string())
        );
        assert_eq!(iteration_uuid_from_message("Initial commit"), None);
        assert_eq!(iteration_uuid_from_message("Iteration: not-a-uuid"), None);
    }
}
