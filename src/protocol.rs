use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use git2::{Oid, Repository};
use serde::Serialize;
use tracing::info;

use crate::error::{Error, ErrorCategory, Result};
use crate::interactive::InteractiveSettingsCompiler;
use crate::packfile::{pack_object_count, persist_pack, unpack_packfile};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::policy::{GitCommand, PolicyEngine, RefUpdate};
use crate::repository::MASTER_REF;
use crate::request::{
    AuthorizationCallback, Deadline, ReferenceDiscoveryCallback, RequestContext,
};

/// Maximum number of objects a push may introduce before it is rejected
/// with `too-many-objects-in-packfile`.
pub const DEFAULT_OBJECT_LIMIT: usize = 10_000;

const RECEIVE_PACK_CAPABILITIES: &str = "report-status delete-refs ofs-delta";
const UPLOAD_PACK_CAPABILITIES: &str = "ofs-delta symref=HEAD:refs/heads/master";

/// The push validation protocol: authorization callback, reference
/// discovery filter and the knobs the policy engine runs under.
#[derive(Clone)]
pub struct GitProtocol {
    pub authorize: AuthorizationCallback,
    pub reference_discovery: Option<ReferenceDiscoveryCallback>,
    pub allow_direct_push_to_master: bool,
    pub overall_wall_time_hard_limit: Duration,
    pub object_limit: usize,
    pub accepts_submissions: bool,
    pub compiler: Arc<dyn InteractiveSettingsCompiler>,
}

impl GitProtocol {
    pub fn new(
        authorize: AuthorizationCallback,
        reference_discovery: Option<ReferenceDiscoveryCallback>,
        allow_direct_push_to_master: bool,
        overall_wall_time_hard_limit: Duration,
        compiler: Arc<dyn InteractiveSettingsCompiler>,
    ) -> Self {
        Self {
            authorize,
            reference_discovery,
            allow_direct_push_to_master,
            overall_wall_time_hard_limit,
            object_limit: DEFAULT_OBJECT_LIMIT,
            accepts_submissions: true,
            compiler,
        }
    }

    fn reference_visible(&self, ctx: &RequestContext, name: &str) -> bool {
        match &self.reference_discovery {
            Some(filter) => filter(ctx, name),
            None => true,
        }
    }
}

/// A reference the push moved, reported to CLI consumers.
#[derive(Debug, Clone, Serialize)]
pub struct UpdatedRef {
    pub name: String,
    pub from: String,
    pub to: String,
}

/// Per-requested-reference outcome of a push.
pub struct RefStatus {
    pub reference_name: String,
    pub status: std::result::Result<(), Error>,
}

/// Outcome of a whole push. When `unpack_error` is set the push failed out
/// of band and carries no per-reference statuses.
pub struct PushResult {
    pub unpack_error: Option<Error>,
    pub statuses: Vec<RefStatus>,
    pub updated_refs: Vec<UpdatedRef>,
}

/// Splits a `git-receive-pack` request body into its command list and the
/// trailing packfile.
pub fn parse_receive_pack_request(body: &[u8]) -> Result<(Vec<GitCommand>, Vec<u8>)> {
    let mut reader = PktLineReader::new(body);
    let mut commands = Vec::new();
    loop {
        match reader.read_pkt_line()? {
            None | Some(PktLine::Flush) => break,
            Some(PktLine::Data(line)) => {
                let line = String::from_utf8(line)
                    .map_err(|_| Error::Unpack("malformed command".to_string()))?;
                // The first command carries the capability list after a NUL.
                let line = line.split('\0').next().unwrap_or("").trim_end_matches('\n');
                let mut tokens = line.splitn(3, ' ');
                let (old, new, reference_name) =
                    match (tokens.next(), tokens.next(), tokens.next()) {
                        (Some(old), Some(new), Some(name)) => (old, new, name),
                        _ => return Err(Error::Unpack(format!("malformed command '{line}'"))),
                    };
                commands.push(GitCommand {
                    old: Oid::from_str(old)
                        .map_err(|_| Error::Unpack(format!("malformed oid '{old}'")))?,
                    new: Oid::from_str(new)
                        .map_err(|_| Error::Unpack(format!("malformed oid '{new}'")))?,
                    reference_name: reference_name.to_string(),
                });
            }
        }
    }
    Ok((commands, reader.into_inner().to_vec()))
}

impl GitProtocol {
    /// Runs the full receive-pack pipeline against an exclusively locked
    /// repository: unpack, per-reference policy evaluation, then an atomic
    /// multi-reference commit with the pack persisted first.
    pub fn push_packfile(
        &self,
        ctx: &RequestContext,
        repo: &Repository,
        commands: Vec<GitCommand>,
        pack: &[u8],
        deadline: &Deadline,
    ) -> PushResult {
        match self.push_packfile_inner(ctx, repo, &commands, pack, deadline) {
            Ok(result) => result,
            Err(err) => PushResult {
                unpack_error: Some(err),
                statuses: Vec::new(),
                updated_refs: Vec::new(),
            },
        }
    }

    fn push_packfile_inner(
        &self,
        ctx: &RequestContext,
        repo: &Repository,
        commands: &[GitCommand],
        pack: &[u8],
        deadline: &Deadline,
    ) -> Result<PushResult> {
        let odb = repo.odb()?;
        let staging = tempfile::tempdir()?;

        if !pack.is_empty() {
            let declared = pack_object_count(pack)?;
            if declared as usize > self.object_limit {
                return Ok(PushResult {
                    unpack_error: None,
                    statuses: commands
                        .iter()
                        .map(|command| RefStatus {
                            reference_name: command.reference_name.clone(),
                            status: Err(Error::categorized(
                                ErrorCategory::TooManyObjectsInPackfile,
                            )),
                        })
                        .collect(),
                    updated_refs: Vec::new(),
                });
            }
            if declared > 0 {
                unpack_packfile(&odb, pack, staging.path())?;
                let staging_path = staging
                    .path()
                    .to_str()
                    .ok_or_else(|| Error::Unpack("non-utf8 staging path".to_string()))?;
                odb.add_disk_alternate(staging_path)?;
            }
        }

        let mempack = odb.add_new_mempack_backend(999)?;
        let engine = PolicyEngine {
            repo,
            compiler: self.compiler.as_ref(),
            object_limit: self.object_limit,
            allow_direct_push_to_master: self.allow_direct_push_to_master,
            accepts_submissions: self.accepts_submissions,
            hard_wall_time_limit: self.overall_wall_time_hard_limit,
        };

        let mut statuses = Vec::with_capacity(commands.len());
        let mut accepted: Vec<RefUpdate> = Vec::new();
        for command in commands {
            if deadline.expired() {
                return Err(Error::Unpack("push deadline exceeded".to_string()));
            }
            match engine.evaluate(ctx, command, deadline) {
                Ok(updates) => {
                    statuses.push(RefStatus {
                        reference_name: command.reference_name.clone(),
                        status: Ok(()),
                    });
                    accepted.extend(updates);
                }
                Err(err) => statuses.push(RefStatus {
                    reference_name: command.reference_name.clone(),
                    status: Err(err),
                }),
            }
        }

        let mut updated_refs = Vec::new();
        if !accepted.is_empty() {
            // Objects reach permanent storage before any reference moves.
            if !pack.is_empty() {
                persist_pack(&odb, pack)?;
            }
            let mut created = git2::Buf::new();
            mempack.dump(repo, &mut created)?;
            persist_pack(&odb, &created)?;

            let mut transaction = repo.transaction()?;
            for update in &accepted {
                transaction.lock_ref(&update.name)?;
            }
            for update in &accepted {
                transaction.set_target(&update.name, update.new, None, "push")?;
            }
            transaction.commit()?;

            for update in accepted {
                info!(
                    reference = %update.name,
                    from = %update.old,
                    to = %update.new,
                    username = ctx.username.as_deref().unwrap_or(""),
                    "reference updated"
                );
                updated_refs.push(UpdatedRef {
                    name: update.name,
                    from: update.old.to_string(),
                    to: update.new.to_string(),
                });
            }
        }

        Ok(PushResult {
            unpack_error: None,
            statuses,
            updated_refs,
        })
    }

    /// Renders the refs advertisement for `GET /info/refs`, filtered by the
    /// reference discovery callback.
    pub fn advertise_refs(
        &self,
        ctx: &RequestContext,
        repo: &Repository,
        service: &str,
    ) -> Result<Vec<u8>> {
        let for_upload = service == "git-upload-pack";
        let capabilities = if for_upload {
            UPLOAD_PACK_CAPABILITIES
        } else {
            RECEIVE_PACK_CAPABILITIES
        };

        let mut references: BTreeMap<String, Oid> = BTreeMap::new();
        for reference in repo.references()? {
            let reference = reference?;
            let (Some(name), Some(target)) = (reference.name(), reference.target()) else {
                continue;
            };
            if self.reference_visible(ctx, name) {
                references.insert(name.to_string(), target);
            }
        }

        let mut lines: Vec<(String, Oid)> = Vec::new();
        if for_upload {
            if let Some(master) = references.get(MASTER_REF) {
                lines.push(("HEAD".to_string(), *master));
            }
        }
        lines.extend(references);

        let mut body = Vec::new();
        let mut writer = PktLineWriter::new(&mut body);
        writer.write_pkt_line(format!("# service={service}\n").as_bytes())?;
        writer.flush_pkt()?;
        if lines.is_empty() {
            writer.write_pkt_line(
                format!("{} capabilities^{{}}\0{capabilities}\n", Oid::zero()).as_bytes(),
            )?;
        } else {
            for (index, (name, oid)) in lines.iter().enumerate() {
                if index == 0 {
                    writer.write_pkt_line(
                        format!("{oid} {name}\0{capabilities}\n").as_bytes(),
                    )?;
                } else {
                    writer.write_pkt_line(format!("{oid} {name}\n").as_bytes())?;
                }
            }
        }
        writer.flush_pkt()?;
        Ok(body)
    }

    /// Serves a `git-upload-pack` fetch request: single-round negotiation,
    /// `NAK`, then a packfile with the wanted closure minus the client's
    /// haves.
    pub fn upload_pack(&self, repo: &Repository, body: &[u8]) -> Result<Vec<u8>> {
        let mut wants = Vec::new();
        let mut haves = Vec::new();

        let mut reader = PktLineReader::new(body);
        while let Some(line) = reader.read_pkt_line()? {
            let PktLine::Data(data) = line else {
                continue;
            };
            let text = String::from_utf8_lossy(&data);
            let text = text.split('\0').next().unwrap_or("").trim_end();
            if let Some(oid) = text.strip_prefix("want ") {
                wants.push(
                    Oid::from_str(oid.split(' ').next().unwrap_or(oid))
                        .map_err(|_| Error::Unpack(format!("malformed want '{text}'")))?,
                );
            } else if let Some(oid) = text.strip_prefix("have ") {
                if let Ok(oid) = Oid::from_str(oid) {
                    haves.push(oid);
                }
            } else if text == "done" {
                break;
            }
        }
        if wants.is_empty() {
            return Err(Error::Unpack("no wants in upload-pack request".to_string()));
        }

        let mut walk = repo.revwalk()?;
        for want in &wants {
            walk.push(*want)?;
        }
        for have in &haves {
            if repo.find_commit(*have).is_ok() {
                walk.hide(*have)?;
            }
        }

        let mut builder = repo.packbuilder()?;
        builder.insert_walk(&mut walk)?;
        let mut pack = git2::Buf::new();
        builder.write_buf(&mut pack)?;

        let mut response = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut response);
            writer.write_pkt_line(b"NAK\n")?;
        }
        response.extend_from_slice(&pack);
        Ok(response)
    }
}

/// Renders the report-status body returned to the pushing client.
#[must_use]
pub fn render_report(result: &PushResult) -> Vec<u8> {
    let mut body = Vec::new();
    let mut writer = PktLineWriter::new(&mut body);
    match &result.unpack_error {
        Some(err) => {
            writer
                .write_pkt_line(format!("unpack {}\n", err.wire_reason()).as_bytes())
                .expect("write to Vec");
        }
        None => {
            writer
                .write_pkt_line(b"unpack ok\n")
                .expect("write to Vec");
            for status in &result.statuses {
                let line = match &status.status {
                    Ok(()) => format!("ok {}\n", status.reference_name),
                    Err(err) => format!(
                        "ng {} {}\n",
                        status.reference_name,
                        err.wire_reason()
                    ),
                };
                writer
                    .write_pkt_line(line.as_bytes())
                    .expect("write to Vec");
            }
        }
    }
    writer.flush_pkt().expect("write to Vec");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_receive_pack_request() {
        let mut body = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut body);
            writer
                .write_pkt_line(
                    format!(
                        "{} {} refs/changes/initial\0report-status\n",
                        Oid::zero(),
                        "4bc943d4792eea56d925723b3e4eb8cb668bbcbb"
                    )
                    .as_bytes(),
                )
                .unwrap();
            writer.flush_pkt().unwrap();
        }
        body.extend_from_slice(&crate::packfile::EMPTY_PACKFILE);

        let (commands, pack) = parse_receive_pack_request(&body).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].old.is_zero());
        assert_eq!(
            commands[0].new.to_string(),
            "4bc943d4792eea56d925723b3e4eb8cb668bbcbb"
        );
        assert_eq!(commands[0].reference_name, "refs/changes/initial");
        assert_eq!(pack, crate::packfile::EMPTY_PACKFILE);
    }

    #[test]
    fn test_render_report() {
        let result = PushResult {
            unpack_error: None,
            statuses: vec![
                RefStatus {
                    reference_name: "refs/changes/initial".to_string(),
                    status: Ok(()),
                },
                RefStatus {
                    reference_name: "refs/heads/private".to_string(),
                    status: Err(Error::categorized(ErrorCategory::ReadOnly)),
                },
            ],
            updated_refs: Vec::new(),
        };
        let body = String::from_utf8(render_report(&result)).unwrap();
        assert!(body.contains("unpack ok\n"));
        assert!(body.contains("ok refs/changes/initial\n"));
        assert!(body.contains("ng refs/heads/private read-only\n"));
        assert!(body.ends_with("0000"));
    }
}
