use std::time::Duration;

use git2::{Commit, Oid, Repository};
use tracing::debug;

use crate::error::{Error, ErrorCategory, Result};
use crate::interactive::InteractiveSettingsCompiler;
use crate::problem::{
    canonicalize_problem_tree, visibility_tree, CanonicalizeOptions, Visibility,
};
use crate::publishconfig::validate_config_tree;
use crate::repository::{
    CONFIG_REF, MASTER_REF, PRIVATE_REF, PROTECTED_REF, PUBLIC_REF, PUBLISHED_REF, REVIEW_REF,
};
use crate::request::{Deadline, RequestContext};
use crate::review::validate_review_commit;
use crate::tree::ensure_connectivity;

/// One requested reference update, as parsed off the wire.
#[derive(Debug, Clone)]
pub struct GitCommand {
    pub old: Oid,
    pub new: Oid,
    pub reference_name: String,
}

impl GitCommand {
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.new.is_zero()
    }
}

/// An accepted reference move, possibly one of several derived from a
/// single command (master advances its visibility siblings).
#[derive(Debug, Clone)]
pub struct RefUpdate {
    pub name: String,
    pub old: Oid,
    pub new: Oid,
}

/// Update rule governing one reference name pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefRule {
    /// Maintained by the engine; never writable by clients.
    ReadOnlyRef,
    /// Not a recognized reference name.
    InvalidRef,
    /// `refs/changes/<name>`: pending proposal, full problem validation.
    ProblemChange,
    /// `refs/heads/master`: admin merge of a canonical change.
    MasterMerge,
    /// `refs/heads/published`: must stay within master's first-parent chain.
    Published,
    /// `refs/meta/review`: append-only code review ledger.
    ReviewLog,
    /// `refs/meta/config`: single-file publishing configuration.
    ConfigBlob,
}

#[must_use]
pub fn rule_for_reference(name: &str) -> RefRule {
    match name {
        MASTER_REF => RefRule::MasterMerge,
        PUBLISHED_REF => RefRule::Published,
        PUBLIC_REF | PROTECTED_REF | PRIVATE_REF => RefRule::ReadOnlyRef,
        REVIEW_REF => RefRule::ReviewLog,
        CONFIG_REF => RefRule::ConfigBlob,
        _ => match name.strip_prefix("refs/changes/") {
            Some(change)
                if !change.is_empty()
                    && change
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
            {
                RefRule::ProblemChange
            }
            _ => RefRule::InvalidRef,
        },
    }
}

/// Evaluates reference updates against the per-reference rules, invoking
/// the problem/review/config validators and synthesizing the canonical
/// commits the accepted references will point at.
pub struct PolicyEngine<'a> {
    pub repo: &'a Repository,
    pub compiler: &'a dyn InteractiveSettingsCompiler,
    pub object_limit: usize,
    pub allow_direct_push_to_master: bool,
    pub accepts_submissions: bool,
    pub hard_wall_time_limit: Duration,
}

impl PolicyEngine<'_> {
    pub fn evaluate(
        &self,
        ctx: &RequestContext,
        command: &GitCommand,
        deadline: &Deadline,
    ) -> Result<Vec<RefUpdate>> {
        debug!(
            reference = %command.reference_name,
            old = %command.old,
            new = %command.new,
            "evaluating reference update"
        );
        match rule_for_reference(&command.reference_name) {
            RefRule::ReadOnlyRef => Err(Error::categorized(ErrorCategory::ReadOnly)),
            RefRule::InvalidRef => Err(Error::categorized(ErrorCategory::InvalidRef)),
            RefRule::ProblemChange => self.evaluate_problem_change(ctx, command, deadline),
            RefRule::MasterMerge => self.evaluate_master_merge(ctx, command, deadline),
            RefRule::Published => self.evaluate_published(ctx, command),
            RefRule::ReviewLog => self.evaluate_review(ctx, command),
            RefRule::ConfigBlob => self.evaluate_config(ctx, command),
        }
    }

    fn current_target(&self, name: &str) -> Result<Option<Oid>> {
        match self.repo.find_reference(name) {
            Ok(reference) => Ok(reference.target()),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn lookup_pushed_commit(&self, command: &GitCommand) -> Result<Commit<'_>> {
        self.repo.find_commit(command.new).map_err(Error::from)
    }

    fn check_connectivity(&self, commit: &Commit<'_>) -> Result<()> {
        let odb = self.repo.odb()?;
        let tree = commit.tree()?;
        ensure_connectivity(self.repo, &odb, &tree, self.object_limit)
    }

    /// Rewrites a pushed commit into canonical form: validated canonical
    /// tree, parent pinned to the current master tip, author, committer and
    /// message preserved.
    fn canonicalize_commit(&self, commit: &Commit<'_>, deadline: &Deadline) -> Result<Oid> {
        let options = CanonicalizeOptions {
            accepts_submissions: self.accepts_submissions,
            hard_wall_time_limit: self.hard_wall_time_limit,
        };
        let tree = commit.tree()?;
        let canonical =
            canonicalize_problem_tree(self.repo, &tree, self.compiler, &options, deadline)?;

        let master = self.current_target(MASTER_REF)?;
        let already_canonical = commit.tree_id() == canonical.tree
            && match master {
                Some(master) => {
                    commit.parent_count() == 1 && commit.parent_id(0)? == master
                }
                None => commit.parent_count() == 0,
            };
        if already_canonical {
            return Ok(commit.id());
        }

        let canonical_tree = self.repo.find_tree(canonical.tree)?;
        let master_commit = master
            .map(|oid| self.repo.find_commit(oid))
            .transpose()?;
        let parents: Vec<&Commit<'_>> = master_commit.iter().collect();
        Ok(self.repo.commit(
            None,
            &commit.author(),
            &commit.committer(),
            commit.message().unwrap_or(""),
            &canonical_tree,
            &parents,
        )?)
    }

    fn evaluate_problem_change(
        &self,
        ctx: &RequestContext,
        command: &GitCommand,
        deadline: &Deadline,
    ) -> Result<Vec<RefUpdate>> {
        if !ctx.can_edit {
            return Err(Error::categorized(ErrorCategory::Forbidden));
        }
        if command.is_delete() {
            return Err(Error::categorized(ErrorCategory::DeleteUnallowed));
        }
        let current = self.current_target(&command.reference_name)?;
        let commit = self.lookup_pushed_commit(command)?;
        if let Some(current) = current {
            if command.new != current && !self.repo.graph_descendant_of(command.new, current)? {
                return Err(Error::with_detail(
                    ErrorCategory::Forbidden,
                    "non-fast-forward update",
                ));
            }
        }
        self.check_connectivity(&commit)?;
        let canonical = self.canonicalize_commit(&commit, deadline)?;
        Ok(vec![RefUpdate {
            name: command.reference_name.clone(),
            old: current.unwrap_or_else(Oid::zero),
            new: canonical,
        }])
    }

    fn evaluate_master_merge(
        &self,
        ctx: &RequestContext,
        command: &GitCommand,
        deadline: &Deadline,
    ) -> Result<Vec<RefUpdate>> {
        if !ctx.is_admin {
            return Err(Error::categorized(ErrorCategory::Forbidden));
        }
        if command.is_delete() {
            return Err(Error::categorized(ErrorCategory::DeleteUnallowed));
        }
        if !self.allow_direct_push_to_master && !self.is_change_tip(command.new)? {
            return Err(Error::with_detail(
                ErrorCategory::Forbidden,
                "master only accepts the tip of a refs/changes reference",
            ));
        }
        let commit = self.lookup_pushed_commit(command)?;
        self.check_connectivity(&commit)?;
        let canonical = self.canonicalize_commit(&commit, deadline)?;
        let canonical_commit = self.repo.find_commit(canonical)?;
        let canonical_tree = canonical_commit.tree()?;

        let mut updates = vec![RefUpdate {
            name: MASTER_REF.to_string(),
            old: self.current_target(MASTER_REF)?.unwrap_or_else(Oid::zero),
            new: canonical,
        }];

        // Siblings move in lockstep, but only when their projection changed.
        for (name, visibility) in [
            (PUBLIC_REF, Visibility::Public),
            (PROTECTED_REF, Visibility::Protected),
            (PRIVATE_REF, Visibility::Private),
        ] {
            let filtered = visibility_tree(self.repo, &canonical_tree, visibility)?;
            let current = self.current_target(name)?;
            if let Some(tip) = current {
                if self.repo.find_commit(tip)?.tree_id() == filtered {
                    continue;
                }
            }
            let parent_commit = current
                .map(|oid| self.repo.find_commit(oid))
                .transpose()?;
            let parents: Vec<&Commit<'_>> = parent_commit.iter().collect();
            let sibling = self.repo.commit(
                None,
                &canonical_commit.author(),
                &canonical_commit.committer(),
                canonical_commit.message().unwrap_or(""),
                &self.repo.find_tree(filtered)?,
                &parents,
            )?;
            updates.push(RefUpdate {
                name: name.to_string(),
                old: current.unwrap_or_else(Oid::zero),
                new: sibling,
            });
        }

        Ok(updates)
    }

    fn is_change_tip(&self, oid: Oid) -> Result<bool> {
        for reference in self.repo.references_glob("refs/changes/*")? {
            let reference = reference?;
            if reference.target() == Some(oid) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn evaluate_published(
        &self,
        ctx: &RequestContext,
        command: &GitCommand,
    ) -> Result<Vec<RefUpdate>> {
        if !ctx.is_admin {
            return Err(Error::categorized(ErrorCategory::Forbidden));
        }
        if command.is_delete() {
            return Err(Error::categorized(ErrorCategory::DeleteUnallowed));
        }
        self.lookup_pushed_commit(command)?;

        let master = self.current_target(MASTER_REF)?;
        if !self.first_parent_chain_contains(master, command.new)? {
            return Err(Error::categorized(
                ErrorCategory::PublishedMustPointToCommitInMaster,
            ));
        }
        Ok(vec![RefUpdate {
            name: command.reference_name.clone(),
            old: self
                .current_target(&command.reference_name)?
                .unwrap_or_else(Oid::zero),
            new: command.new,
        }])
    }

    fn first_parent_chain_contains(&self, tip: Option<Oid>, target: Oid) -> Result<bool> {
        let mut cursor = tip;
        while let Some(oid) = cursor {
            if oid == target {
                return Ok(true);
            }
            let commit = self.repo.find_commit(oid)?;
            cursor = if commit.parent_count() > 0 {
                Some(commit.parent_id(0)?)
            } else {
                None
            };
        }
        Ok(false)
    }

    fn evaluate_review(
        &self,
        ctx: &RequestContext,
        command: &GitCommand,
    ) -> Result<Vec<RefUpdate>> {
        if !ctx.can_edit {
            return Err(Error::categorized(ErrorCategory::Forbidden));
        }
        if command.is_delete() {
            return Err(Error::categorized(ErrorCategory::DeleteUnallowed));
        }
        let commit = self.lookup_pushed_commit(command)?;
        let current = self.current_target(REVIEW_REF)?;
        let old_commit = current
            .map(|oid| self.repo.find_commit(oid))
            .transpose()?;
        validate_review_commit(self.repo, old_commit.as_ref(), &commit)?;
        Ok(vec![RefUpdate {
            name: command.reference_name.clone(),
            old: current.unwrap_or_else(Oid::zero),
            new: command.new,
        }])
    }

    fn evaluate_config(
        &self,
        ctx: &RequestContext,
        command: &GitCommand,
    ) -> Result<Vec<RefUpdate>> {
        if !ctx.is_admin {
            return Err(Error::categorized(ErrorCategory::RestrictedRef));
        }
        if command.is_delete() {
            return Err(Error::categorized(ErrorCategory::DeleteUnallowed));
        }
        let commit = self.lookup_pushed_commit(command)?;
        validate_config_tree(self.repo, &commit.tree()?)?;
        Ok(vec![RefUpdate {
            name: command.reference_name.clone(),
            old: self
                .current_target(&command.reference_name)?
                .unwrap_or_else(Oid::zero),
            new: command.new,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_for_reference() {
        assert_eq!(rule_for_reference("refs/heads/master"), RefRule::MasterMerge);
        assert_eq!(rule_for_reference("refs/heads/published"), RefRule::Published);
        assert_eq!(rule_for_reference("refs/heads/public"), RefRule::ReadOnlyRef);
        assert_eq!(rule_for_reference("refs/heads/protected"), RefRule::ReadOnlyRef);
        assert_eq!(rule_for_reference("refs/heads/private"), RefRule::ReadOnlyRef);
        assert_eq!(
            rule_for_reference("refs/heads/arbitrarybranchname"),
            RefRule::InvalidRef
        );
        assert_eq!(
            rule_for_reference("refs/changes/initial"),
            RefRule::ProblemChange
        );
        assert_eq!(
            rule_for_reference("refs/changes/a/b"),
            RefRule::InvalidRef
        );
        assert_eq!(rule_for_reference("refs/changes/"), RefRule::InvalidRef);
        assert_eq!(rule_for_reference("refs/meta/review"), RefRule::ReviewLog);
        assert_eq!(rule_for_reference("refs/meta/config"), RefRule::ConfigBlob);
        assert_eq!(rule_for_reference("refs/tags/v1"), RefRule::InvalidRef);
    }
}
