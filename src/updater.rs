use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use git2::{Repository, Signature};
use serde::Serialize;

use crate::error::{Error, ErrorCategory, Result};
use crate::interactive::InteractiveSettingsCompiler;
use crate::policy::GitCommand;
use crate::problem::{canonical_json, ProblemSettings, OVERALL_WALL_TIME_HARD_LIMIT};
use crate::protocol::{GitProtocol, PushResult, UpdatedRef};
use crate::repository::MASTER_REF;
use crate::request::{
    AuthorizationLevel, AuthorizationResponse, Deadline, RequestContext,
};
use crate::tree::{build_tree, extract_json, merge_trees};
use crate::ziputil::{convert_zip_to_packfile, read_zip, ZipUpdateMask};

/// Result of one `omegaup-update-problem` invocation, printed as JSON.
#[derive(Debug, Serialize)]
pub struct UpdateResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated_refs: Vec<UpdatedRef>,
}

impl UpdateResult {
    #[must_use]
    pub fn ok(updated_refs: Vec<UpdatedRef>) -> Self {
        Self {
            status: "ok".to_string(),
            error: None,
            updated_refs,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(message.into()),
            updated_refs: Vec::new(),
        }
    }
}

fn admin_context(author: &str) -> RequestContext {
    RequestContext {
        username: Some(author.to_string()),
        is_admin: true,
        can_view: true,
        can_edit: true,
        has_solved: false,
    }
}

fn update_protocol(
    compiler: Arc<dyn InteractiveSettingsCompiler>,
    accepts_submissions: bool,
) -> GitProtocol {
    let mut protocol = GitProtocol::new(
        Arc::new(|_: &mut RequestContext, _: &axum::http::HeaderMap, _: &str, _| {
            AuthorizationResponse::granted(AuthorizationLevel::Allowed)
        }),
        None,
        true,
        OVERALL_WALL_TIME_HARD_LIMIT,
        compiler,
    );
    protocol.accepts_submissions = accepts_submissions;
    protocol
}

fn author_signature(author: &str) -> Result<Signature<'static>> {
    Ok(Signature::now(author, &format!("{author}@omegaup"))?)
}

fn into_update_result(result: PushResult) -> Result<UpdateResult> {
    if let Some(err) = result.unpack_error {
        return Err(err);
    }
    for status in result.statuses {
        status.status?;
    }
    Ok(UpdateResult::ok(result.updated_refs))
}

fn push_to_master(
    repo: &Repository,
    protocol: &GitProtocol,
    author: &str,
    new_oid: git2::Oid,
    pack: &[u8],
) -> Result<UpdateResult> {
    // A fresh handle so the push stages its own objects independently of
    // the mempack the commit was built in.
    let push_repo = Repository::open(repo.path())?;
    let old = match push_repo.find_reference(MASTER_REF) {
        Ok(reference) => reference.target().unwrap_or_else(git2::Oid::zero),
        Err(_) => git2::Oid::zero(),
    };
    let deadline = Deadline::new(OVERALL_WALL_TIME_HARD_LIMIT);
    let result = protocol.push_packfile(
        &admin_context(author),
        &push_repo,
        vec![GitCommand {
            old,
            new: new_oid,
            reference_name: MASTER_REF.to_string(),
        }],
        pack,
        &deadline,
    );
    into_update_result(result)
}

/// Commits the contents of a `.zip` archive onto `refs/heads/master`.
#[allow(clippy::too_many_arguments)]
pub fn commit_zip_file(
    repo: &Repository,
    zip_path: &Path,
    author: &str,
    commit_message: &str,
    settings: Option<&ProblemSettings>,
    mask: ZipUpdateMask,
    accepts_submissions: bool,
    compiler: Arc<dyn InteractiveSettingsCompiler>,
) -> Result<UpdateResult> {
    let bytes = std::fs::read(zip_path)?;
    let contents = read_zip(&bytes)?;

    let signature = author_signature(author)?;
    let (new_oid, pack) = convert_zip_to_packfile(
        repo,
        contents,
        settings,
        mask,
        &signature,
        &signature,
        commit_message,
    )?;

    let protocol = update_protocol(compiler, accepts_submissions);
    push_to_master(repo, &protocol, author, new_oid, &pack)
}

/// Commits a set of blob updates on top of the current master tree.
pub fn commit_blobs(
    repo: &Repository,
    author: &str,
    commit_message: &str,
    contents: &BTreeMap<String, Vec<u8>>,
    compiler: Arc<dyn InteractiveSettingsCompiler>,
) -> Result<UpdateResult> {
    // A scratch handle keeps the mempack backend private to this call.
    let repo = &Repository::open(repo.path())?;
    let odb = repo.odb()?;
    let mempack = odb.add_new_mempack_backend(999)?;

    let head = repo
        .find_reference(MASTER_REF)?
        .target()
        .ok_or_else(|| Error::Unpack("refs/heads/master is unborn".to_string()))?;
    let head_commit = repo.find_commit(head)?;
    let head_tree = head_commit.tree()?;

    let over_oid = build_tree(repo, contents)?;
    let over = repo.find_tree(over_oid)?;
    let merged = merge_trees(repo, &over, &head_tree)?;
    let merged_tree = repo.find_tree(merged)?;

    let signature = author_signature(author)?;
    let new_oid = repo.commit(
        None,
        &signature,
        &signature,
        commit_message,
        &merged_tree,
        &[&head_commit],
    )?;

    let mut pack = git2::Buf::new();
    mempack.dump(repo, &mut pack)?;

    let protocol = update_protocol(compiler, true);
    push_to_master(repo, &protocol, author, new_oid, &pack)
}

/// Rewrites the limits and validator sections of `settings.json` in place,
/// keeping the validator declaration consistent with the sources present in
/// the repository.
pub fn commit_settings(
    repo: &Repository,
    author: &str,
    commit_message: &str,
    settings: &ProblemSettings,
    compiler: Arc<dyn InteractiveSettingsCompiler>,
) -> Result<UpdateResult> {
    let head = repo
        .find_reference(MASTER_REF)?
        .target()
        .ok_or_else(|| Error::Unpack("refs/heads/master is unborn".to_string()))?;
    let head_tree = repo.find_commit(head)?.tree()?;

    let mut updated: ProblemSettings = extract_json(repo, &head_tree, "settings.json")?;
    if updated.validator.name != settings.validator.name {
        if updated.validator.name == "custom" {
            return Err(Error::with_detail(
                ErrorCategory::ProblemBadLayout,
                "problem with unused validator",
            ));
        }
        if settings.validator.name == "custom" {
            return Err(Error::with_detail(
                ErrorCategory::ProblemBadLayout,
                "problem with custom validator missing a validator",
            ));
        }
    }
    updated.limits = settings.limits.clone();
    updated.validator.name = settings.validator.name.clone();
    updated.validator.tolerance = settings.validator.tolerance;
    updated.validator.limits = settings.validator.limits.clone();

    let mut contents = BTreeMap::new();
    contents.insert("settings.json".to_string(), canonical_json(&updated)?);
    commit_blobs(repo, author, commit_message, &contents, compiler)
}
