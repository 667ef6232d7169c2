// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{Oid, Repository, Signature, Time};

use omegaup_gitserver::interactive::FakeInteractiveSettingsCompiler;
use omegaup_gitserver::pktline::{PktLine, PktLineReader};
use omegaup_gitserver::problem::OVERALL_WALL_TIME_HARD_LIMIT;
use omegaup_gitserver::protocol::GitProtocol;
use omegaup_gitserver::repository::{init_repository, repository_path};
use omegaup_gitserver::request::{
    AuthorizationLevel, AuthorizationResponse, GitOperation, RequestContext,
};
use omegaup_gitserver::server::auth::basic_auth;
use omegaup_gitserver::server::{create_router, AppState};

pub const USER_AUTHORIZATION: &str = "Basic dXNlcjp1c2Vy";
pub const ADMIN_AUTHORIZATION: &str = "Basic YWRtaW46YWRtaW4=";
pub const READONLY_AUTHORIZATION: &str = "Basic cmVhZG9ubHk6cmVhZG9ubHk=";

/// Mirror of the host-supplied callback: `admin` has full rights, `user`
/// can edit, `readonly` can only read.
pub fn test_authorize(
    ctx: &mut RequestContext,
    headers: &axum::http::HeaderMap,
    _repository: &str,
    _operation: GitOperation,
) -> AuthorizationResponse {
    let Some((username, _)) = basic_auth(headers) else {
        return AuthorizationResponse::denied(true);
    };
    ctx.username = Some(username.clone());
    match username.as_str() {
        "admin" => {
            ctx.is_admin = true;
            ctx.can_view = true;
            ctx.can_edit = true;
            AuthorizationResponse::granted(AuthorizationLevel::Allowed)
        }
        "user" => {
            ctx.can_view = true;
            ctx.can_edit = true;
            AuthorizationResponse::granted(AuthorizationLevel::Restricted)
        }
        "readonly" => {
            ctx.can_view = true;
            AuthorizationResponse::granted(AuthorizationLevel::ReadOnly)
        }
        _ => AuthorizationResponse::denied(false),
    }
}

#[must_use]
pub fn test_protocol(compiler: FakeInteractiveSettingsCompiler, allow_direct: bool) -> GitProtocol {
    GitProtocol::new(
        Arc::new(test_authorize),
        None,
        allow_direct,
        OVERALL_WALL_TIME_HARD_LIMIT,
        Arc::new(compiler),
    )
}

#[must_use]
pub fn default_test_protocol() -> GitProtocol {
    test_protocol(
        FakeInteractiveSettingsCompiler {
            settings: None,
            error: Some("unsupported".to_string()),
        },
        false,
    )
}

pub struct TestServer {
    _root_dir: Option<tempfile::TempDir>,
    root: PathBuf,
    pub base_url: String,
}

impl TestServer {
    pub async fn start(protocol: GitProtocol) -> Self {
        let root_dir = tempfile::tempdir().expect("create temp root");
        let root = root_dir.path().to_path_buf();
        // Keep the fixture around for debugging when PRESERVE is set.
        let root_dir = if std::env::var_os("PRESERVE").is_some() {
            let kept = root_dir.keep();
            eprintln!("preserving test root at {}", kept.display());
            None
        } else {
            Some(root_dir)
        };

        let state = Arc::new(AppState {
            root: root.clone(),
            protocol,
        });
        let router = create_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });

        Self {
            _root_dir: root_dir,
            root,
            base_url: format!("http://127.0.0.1:{port}"),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn init_repository(&self, alias: &str) -> PathBuf {
        let path = repository_path(&self.root, alias);
        init_repository(&path).expect("init repository");
        path
    }
}

/// Builds a commit in the problem repository's mempack and returns it plus
/// the packfile carrying its objects, without making anything reachable.
pub fn create_commit(
    root: &Path,
    alias: &str,
    parent: Oid,
    contents: &[(&str, &[u8])],
    commit_message: &str,
) -> (Oid, Vec<u8>) {
    let repo = Repository::open(repository_path(root, alias)).expect("open repository");
    let odb = repo.odb().expect("open odb");
    let mempack = odb.add_new_mempack_backend(999).expect("mempack");

    let map: BTreeMap<String, Vec<u8>> = contents
        .iter()
        .map(|(path, data)| (path.to_string(), data.to_vec()))
        .collect();
    let tree_oid = omegaup_gitserver::tree::build_tree(&repo, &map).expect("build tree");
    let tree = repo.find_tree(tree_oid).expect("find tree");

    let author =
        Signature::new("author", "author@test.test", &Time::new(0, 0)).expect("signature");
    let committer =
        Signature::new("committer", "committer@test.test", &Time::new(0, 0)).expect("signature");

    let parent_commit = if parent.is_zero() {
        None
    } else {
        Some(repo.find_commit(parent).expect("find parent"))
    };
    let parents: Vec<&git2::Commit<'_>> = parent_commit.iter().collect();
    let commit = repo
        .commit(None, &author, &committer, commit_message, &tree, &parents)
        .expect("create commit");

    let mut pack = git2::Buf::new();
    mempack.dump(&repo, &mut pack).expect("dump mempack");
    (commit, pack.to_vec())
}

/// Builds the body of a `git-receive-pack` request: one command, the
/// capability list, then the packfile.
#[must_use]
pub fn receive_pack_body(old: Oid, new: Oid, reference_name: &str, pack: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    {
        let mut writer = omegaup_gitserver::pktline::PktLineWriter::new(&mut body);
        writer
            .write_pkt_line(format!("{old} {new} {reference_name}\0report-status\n").as_bytes())
            .expect("write command");
        writer.flush_pkt().expect("flush");
    }
    body.extend_from_slice(pack);
    body
}

/// Parses a pkt-line response body into its data lines.
#[must_use]
pub fn parse_pkt_lines(body: &[u8]) -> Vec<String> {
    let mut reader = PktLineReader::new(body);
    let mut lines = Vec::new();
    while let Some(line) = reader.read_pkt_line().expect("parse pkt line") {
        if let PktLine::Data(data) = line {
            lines.push(String::from_utf8_lossy(&data).into_owned());
        }
    }
    lines
}

/// Pushes one reference update and returns the report-status lines.
pub async fn push_lines(
    server: &TestServer,
    authorization: &str,
    alias: &str,
    reference_name: &str,
    old: Oid,
    new: Oid,
    pack: &[u8],
) -> Vec<String> {
    let body = receive_pack_body(old, new, reference_name, pack);
    let response = reqwest::Client::new()
        .post(format!("{}/{alias}/git-receive-pack", server.base_url))
        .header("Authorization", authorization)
        .body(body)
        .send()
        .await
        .expect("push request");
    assert!(
        response.status() == reqwest::StatusCode::OK
            || response.status() == reqwest::StatusCode::FORBIDDEN,
        "unexpected push status {}",
        response.status()
    );
    let bytes = response.bytes().await.expect("response body");
    parse_pkt_lines(&bytes)
}

/// Pushes and asserts the exact report-status lines.
pub async fn push(
    server: &TestServer,
    authorization: &str,
    alias: &str,
    reference_name: &str,
    old: Oid,
    new: Oid,
    pack: &[u8],
    expected: &[&str],
) {
    let lines = push_lines(server, authorization, alias, reference_name, old, new, pack).await;
    assert_eq!(
        lines, expected,
        "push to {reference_name}: expected {expected:?}, got {lines:?}"
    );
}

/// Reads the current value of a reference through the advertisement, the
/// way a git client learns it before pushing.
pub async fn get_reference(server: &TestServer, alias: &str, reference_name: &str) -> Oid {
    let response = reqwest::Client::new()
        .get(format!(
            "{}/{alias}/info/refs?service=git-receive-pack",
            server.base_url
        ))
        .header("Authorization", ADMIN_AUTHORIZATION)
        .send()
        .await
        .expect("info/refs request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let bytes = response.bytes().await.expect("advertisement body");

    for line in parse_pkt_lines(&bytes) {
        let line = line.trim_end_matches('\n');
        let tokens: Vec<&str> = line
            .split(|c| c == ' ' || c == '\0')
            .filter(|token| !token.is_empty())
            .collect();
        if tokens.len() < 2 || tokens[0].starts_with('#') {
            continue;
        }
        if tokens[1] == reference_name {
            return Oid::from_str(tokens[0]).expect("parse oid");
        }
    }
    Oid::zero()
}

/// Creates a zip archive from a path → contents map.
#[must_use]
pub fn create_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(name.to_string(), zip::write::SimpleFileOptions::default())
            .expect("start zip entry");
        writer.write_all(data.as_bytes()).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}
