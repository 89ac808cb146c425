//! # pkgsync
//!
//! Publishes Composer packages to a Cloudsmith repository straight from git
//! pushes.
//!
//! A GitHub push webhook names a repository and a ref. pkgsync checks the ref
//! out in a local working copy, derives a package version from the ref name,
//! embeds that version (and optionally the source commit) in `composer.json`,
//! zips the tree and replaces whatever the registry held for that version.
//!
//! ## Pipeline
//!
//! 1. Verify the delivery signature and decode the event.
//! 2. Look the repository up in the configuration; unknown repositories are
//!    refused without touching disk.
//! 3. Lock the working copy, clone or fetch it, resolve and check out the ref.
//! 4. Read the package name, derive the version. Refs without a version are
//!    skipped.
//! 5. Delete any stored package at that version. Deletion pushes stop here.
//! 6. Rewrite the manifest, build the zip, upload it.
//! 7. Reset the working copy, whatever happened.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pkgsync::{Pipeline, WebhookServer};
//! use pkgsync_config::Config;
//!
//! let config = Config::load("pkgsync.toml".as_ref()).expect("config");
//! let listen = config.server.listen.clone();
//! let pipeline = Arc::new(Pipeline::from_config(config));
//!
//! WebhookServer::bind(&listen, pipeline).expect("bind").run().expect("serve");
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`] - the orchestrator and manual sync entry point
//! - [`outcome`] - run results, errors and their HTTP status mapping
//! - [`server`] - `tiny_http` listener, one worker thread per request

pub mod outcome;
pub mod pipeline;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

pub use outcome::{Outcome, PipelineError, Response};
pub use pipeline::{ACCEPTED_EVENTS, Pipeline, SyncRequest, cloudsmith_client};
pub use server::{ShutdownHandle, WebhookServer};
