use std::path::PathBuf;
use std::sync::Arc;

use async_compression::tokio::bufread::GzipDecoder;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use git2::Signature;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::error::Error;
use crate::policy::GitCommand;
use crate::protocol::{parse_receive_pack_request, render_report, GitProtocol};
use crate::repository::{is_valid_alias, open_repository, repository_path, Lockfile, MASTER_REF};
use crate::request::{AuthorizationLevel, Deadline, GitOperation, RequestContext};
use crate::updater::UpdateResult;
use crate::ziputil::{convert_zip_to_packfile, read_zip, ZipUpdateMask};

use super::auth::denied_response;
use super::router::AppState;

#[derive(Deserialize)]
pub struct InfoRefsQuery {
    service: Option<String>,
}

#[derive(Deserialize)]
pub struct UploadZipQuery {
    message: Option<String>,
    update: Option<String>,
    #[serde(rename = "acceptsSubmissions")]
    accepts_submissions: Option<bool>,
}

struct GitRequest {
    ctx: RequestContext,
    repo_path: PathBuf,
}

/// Runs the authorization callback and resolves the repository path.
fn resolve_git_request(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    alias: &str,
    operation: GitOperation,
) -> Result<GitRequest, Response> {
    if !is_valid_alias(alias) {
        return Err((StatusCode::BAD_REQUEST, "Invalid repository name").into_response());
    }

    let mut ctx = RequestContext::default();
    let auth = (state.protocol.authorize)(&mut ctx, headers, alias, operation);
    let denied = match auth.level {
        AuthorizationLevel::Denied => true,
        AuthorizationLevel::ReadOnly => operation == GitOperation::Push,
        AuthorizationLevel::Restricted | AuthorizationLevel::Allowed => false,
    };
    if denied {
        return Err(denied_response(&auth));
    }

    let repo_path = repository_path(&state.root, alias);
    if !repo_path.exists() {
        return Err((StatusCode::NOT_FOUND, "Repository not found").into_response());
    }

    Ok(GitRequest { ctx, repo_path })
}

fn build_git_response(body: Vec<u8>, content_type: &'static str) -> Response {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert("Content-Type", content_type.parse().unwrap());
    response
        .headers_mut()
        .insert("Cache-Control", "no-cache".parse().unwrap());
    response
}

fn internal_error(context: &str, err: &Error) -> Response {
    warn!("{context}: {err}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
}

pub async fn info_refs(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Response {
    let service = match query.service.as_deref() {
        Some(service @ ("git-upload-pack" | "git-receive-pack")) => service.to_string(),
        _ => return (StatusCode::BAD_REQUEST, "Invalid service").into_response(),
    };
    let operation = if service == "git-receive-pack" {
        GitOperation::Push
    } else {
        GitOperation::Pull
    };

    let request = match resolve_git_request(&state, &headers, &alias, operation) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let protocol = state.protocol.clone();
    let advertisement = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, Error> {
        let mut lockfile = Lockfile::new(&request.repo_path);
        lockfile.lock_shared()?;
        let repo = open_repository(&request.repo_path)?;
        protocol.advertise_refs(&request.ctx, &repo, &service)
    })
    .await;

    match advertisement {
        Ok(Ok(body)) => {
            let content_type = if operation == GitOperation::Push {
                "application/x-git-receive-pack-advertisement"
            } else {
                "application/x-git-upload-pack-advertisement"
            };
            build_git_response(body, content_type)
        }
        Ok(Err(err)) => internal_error("info/refs", &err),
        Err(err) => {
            warn!("info/refs task panicked: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

pub async fn git_upload_pack(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match resolve_git_request(&state, &headers, &alias, GitOperation::Pull) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let input = match read_request_body(&headers, body).await {
        Ok(data) => data,
        Err(response) => return response,
    };

    let protocol = state.protocol.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, Error> {
        let mut lockfile = Lockfile::new(&request.repo_path);
        lockfile.lock_shared()?;
        let repo = open_repository(&request.repo_path)?;
        protocol.upload_pack(&repo, &input)
    })
    .await;

    match result {
        Ok(Ok(body)) => build_git_response(body, "application/x-git-upload-pack-result"),
        Ok(Err(err)) => internal_error("git-upload-pack", &err),
        Err(err) => {
            warn!("git-upload-pack task panicked: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

pub async fn git_receive_pack(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match resolve_git_request(&state, &headers, &alias, GitOperation::Push) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let input = match read_request_body(&headers, body).await {
        Ok(data) => data,
        Err(response) => return response,
    };

    let protocol = state.protocol.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, Error> {
        let (commands, pack) = parse_receive_pack_request(&input)?;
        let mut lockfile = Lockfile::new(&request.repo_path);
        lockfile.lock_exclusive()?;
        let repo = open_repository(&request.repo_path)?;
        let deadline = Deadline::new(protocol.overall_wall_time_hard_limit);
        let result = protocol.push_packfile(&request.ctx, &repo, commands, &pack, &deadline);
        Ok(render_report(&result))
    })
    .await;

    match result {
        Ok(Ok(body)) => build_git_response(body, "application/x-git-receive-pack-result"),
        Ok(Err(Error::Unpack(reason))) => {
            (StatusCode::BAD_REQUEST, format!("Malformed request: {reason}")).into_response()
        }
        Ok(Err(err)) => internal_error("git-receive-pack", &err),
        Err(err) => {
            warn!("git-receive-pack task panicked: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

pub async fn git_upload_zip(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
    Query(query): Query<UploadZipQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match resolve_git_request(&state, &headers, &alias, GitOperation::Push) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let mask = match query.update.as_deref() {
        None | Some("all") => ZipUpdateMask::ALL,
        Some("cases") => ZipUpdateMask::CASES,
        Some("statements") => ZipUpdateMask::STATEMENTS,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid update mask '{other}'"),
            )
                .into_response();
        }
    };
    let message = query
        .message
        .unwrap_or_else(|| "Uploaded problem".to_string());

    // The zip path re-enters the policy engine with admin authorization.
    let mut protocol = state.protocol.clone();
    protocol.allow_direct_push_to_master = true;
    protocol.accepts_submissions = query.accepts_submissions.unwrap_or(true);
    let elevated = RequestContext {
        is_admin: true,
        can_view: true,
        can_edit: true,
        ..request.ctx.clone()
    };

    let result = tokio::task::spawn_blocking(move || -> Result<UpdateResult, Error> {
        let contents = read_zip(&body)?;

        let mut lockfile = Lockfile::new(&request.repo_path);
        lockfile.lock_exclusive()?;

        let author = elevated.username.clone().unwrap_or_else(|| "omegaup".to_string());
        let signature = Signature::now(&author, &format!("{author}@omegaup"))?;

        let convert_repo = open_repository(&request.repo_path)?;
        let (new_oid, pack) = convert_zip_to_packfile(
            &convert_repo,
            contents,
            None,
            mask,
            &signature,
            &signature,
            &message,
        )?;

        let repo = open_repository(&request.repo_path)?;
        let old = repo
            .find_reference(MASTER_REF)
            .ok()
            .and_then(|reference| reference.target())
            .unwrap_or_else(git2::Oid::zero);
        let deadline = Deadline::new(protocol.overall_wall_time_hard_limit);
        let push = protocol.push_packfile(
            &elevated,
            &repo,
            vec![GitCommand {
                old,
                new: new_oid,
                reference_name: MASTER_REF.to_string(),
            }],
            &pack,
            &deadline,
        );

        if let Some(err) = push.unpack_error {
            return Ok(UpdateResult::error(err.wire_reason()));
        }
        for status in &push.statuses {
            if let Err(err) = &status.status {
                return Ok(UpdateResult::error(err.wire_reason()));
            }
        }
        Ok(UpdateResult::ok(push.updated_refs))
    })
    .await;

    match result {
        Ok(Ok(update)) => (StatusCode::OK, Json(update)).into_response(),
        Ok(Err(err)) => {
            let update = UpdateResult::error(err.wire_reason());
            (StatusCode::OK, Json(update)).into_response()
        }
        Err(err) => {
            warn!("git-upload-zip task panicked: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

/// Recovers the raw request body. git clients gzip large push bodies and
/// announce it with `Content-Encoding: gzip`.
async fn read_request_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, Response> {
    let gzipped = headers
        .get(axum::http::header::CONTENT_ENCODING)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"gzip"));
    if !gzipped {
        return Ok(body.into());
    }

    let mut inflated = Vec::with_capacity(body.len().saturating_mul(2));
    let mut decoder = GzipDecoder::new(tokio::io::BufReader::new(&body[..]));
    match decoder.read_to_end(&mut inflated).await {
        Ok(_) => Ok(inflated),
        Err(_) => Err((
            StatusCode::BAD_REQUEST,
            "Request body is not valid gzip",
        )
            .into_response()),
    }
}
