//! Results of a pipeline run and their HTTP rendering.

use pkgsync_registry::RegistryReceipt;
use pkgsync_version::PackageVersion;
use pkgsync_webhook::WebhookError;
use serde::Serialize;
use thiserror::Error;

/// How a run ended when nothing went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// A `ping` delivery was acknowledged.
    Pong { hook_id: i64 },
    /// The ref does not map to a version or the registry refused the package.
    Skipped {
        package: String,
        reference: String,
        reason: String,
    },
    /// The ref was deleted upstream; the registry copy was removed if present.
    Deleted {
        package: String,
        version: PackageVersion,
        existed: bool,
    },
    /// A fresh artifact was uploaded, replacing any previous one.
    Published {
        package: String,
        version: PackageVersion,
        commit: String,
        receipt: RegistryReceipt,
    },
}

impl Outcome {
    pub fn status(&self) -> u16 {
        match self {
            Outcome::Pong { .. } => 201,
            Outcome::Skipped { .. } => 200,
            Outcome::Deleted { .. } | Outcome::Published { .. } => 204,
        }
    }

    /// Response body; empty for 204 outcomes.
    pub fn body(&self) -> String {
        match self {
            Outcome::Pong { hook_id } => format!("pong ({hook_id})"),
            Outcome::Skipped {
                package,
                reference,
                reason,
            } => format!("Skipping {package}@{reference} due to {reason}...\n"),
            Outcome::Deleted { .. } | Outcome::Published { .. } => String::new(),
        }
    }
}

/// Why a run failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error("repository not configured")]
    RepositoryNotConfigured,
    #[error("{0:#}")]
    Infrastructure(#[from] anyhow::Error),
    #[error("failed to publish {package}@{reference}: {source:#}")]
    Registry {
        package: String,
        reference: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Webhook(e) => e.status(),
            PipelineError::RepositoryNotConfigured => 422,
            PipelineError::Infrastructure(_) | PipelineError::Registry { .. } => 500,
        }
    }
}

/// Status code and body sent back to the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

impl From<&Outcome> for Response {
    fn from(outcome: &Outcome) -> Self {
        Self::new(outcome.status(), outcome.body())
    }
}

impl From<&PipelineError> for Response {
    fn from(err: &PipelineError) -> Self {
        Self::new(err.status(), err.to_string())
    }
}

impl From<&Result<Outcome, PipelineError>> for Response {
    fn from(result: &Result<Outcome, PipelineError>) -> Self {
        match result {
            Ok(outcome) => outcome.into(),
            Err(err) => err.into(),
        }
    }
}
