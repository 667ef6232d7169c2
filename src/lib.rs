//! # omegaup-gitserver
//!
//! A git-over-HTTP server fronting one bare repository per omegaUp
//! problem. Every push is inspected: objects are unpacked into a transient
//! staging area, each requested reference update runs through a
//! per-reference policy (problem schema validation, review ledger state
//! machine, publishing config schema), accepted commits are rewritten into
//! canonical form, and references advance atomically under a per-repository
//! advisory lock.
//!
//! The library exposes the full pipeline so that the `omegaup-gitserver`
//! HTTP binary and the `omegaup-update-problem` CLI share one
//! implementation.

pub mod error;
pub mod interactive;
pub mod packfile;
pub mod pktline;
pub mod policy;
pub mod problem;
pub mod protocol;
pub mod publishconfig;
pub mod repository;
pub mod request;
pub mod review;
pub mod server;
pub mod tree;
pub mod updater;
pub mod ziputil;
