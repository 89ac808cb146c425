//! GitHub webhook verification and payload parsing.
//!
//! A delivery is checked in a fixed order: event header, accepted event
//! kinds, signature (when a secret is configured), then the JSON body. Each
//! failure maps to a distinct [`WebhookError`] so callers can answer with the
//! right status code.
//!
//! # Example
//!
//! ```
//! use pkgsync_webhook::{Event, EventKind, GithubWebhook, WebhookRequest};
//!
//! let hook = GithubWebhook::new(None);
//! let request = WebhookRequest::new(br#"{"hook_id": 42}"#.to_vec())
//!     .with_header("X-GitHub-Event", "ping");
//!
//! match hook.parse(&request, &[EventKind::Push, EventKind::Ping]) {
//!     Ok(Event::Ping(ping)) => assert_eq!(ping.hook_id, 42),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header naming the event type
pub const EVENT_HEADER: &str = "X-GitHub-Event";

/// Header carrying the HMAC-SHA256 signature of the body
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Header carrying the unique delivery id
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Why a delivery was refused.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing {EVENT_HEADER} header")]
    MissingEventHeader,
    #[error("missing {SIGNATURE_HEADER} header")]
    MissingSignatureHeader,
    #[error("HMAC verification failed")]
    HmacVerificationFailed,
    #[error("event `{0}` not handled")]
    EventNotFound(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl WebhookError {
    /// HTTP status to answer the sender with.
    pub fn status(&self) -> u16 {
        match self {
            WebhookError::MissingEventHeader | WebhookError::MissingSignatureHeader => 400,
            WebhookError::HmacVerificationFailed => 403,
            WebhookError::EventNotFound(_) => 422,
            WebhookError::InvalidPayload(_) => 400,
        }
    }
}

/// Event types this crate can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    Ping,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::Ping => "ping",
        }
    }

    fn from_header(value: &str) -> Option<Self> {
        match value {
            "push" => Some(EventKind::Push),
            "ping" => Some(EventKind::Ping),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-independent view of an inbound delivery.
///
/// Header names are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookRequest {
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Delivery id, when the sender provided one.
    pub fn delivery(&self) -> Option<&str> {
        self.header(DELIVERY_HEADER)
    }
}

/// Repository block of a push payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub ssh_url: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl Repository {
    /// Remote URLs in lookup order: ssh, clone, git, html.
    pub fn remote_urls(&self) -> impl Iterator<Item = &str> {
        [&self.ssh_url, &self.clone_url, &self.git_url, &self.html_url]
            .into_iter()
            .filter_map(|url| url.as_deref())
            .filter(|url| !url.is_empty())
    }
}

/// Decoded `push` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub after: Option<String>,
    pub repository: Repository,
}

/// Decoded `ping` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub hook_id: i64,
    #[serde(default)]
    pub zen: Option<String>,
}

/// A verified, decoded delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Ping(PingPayload),
    Push(PushPayload),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Ping(_) => EventKind::Ping,
            Event::Push(_) => EventKind::Push,
        }
    }
}

/// Verifier for GitHub deliveries.
#[derive(Clone, Default)]
pub struct GithubWebhook {
    secret: Option<String>,
}

impl fmt::Debug for GithubWebhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubWebhook")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GithubWebhook {
    /// An empty secret disables signature checks, same as `None`.
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn verifies_signatures(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify and decode a delivery, accepting only the given event kinds.
    pub fn parse(
        &self,
        request: &WebhookRequest,
        accepted: &[EventKind],
    ) -> Result<Event, WebhookError> {
        let event = request
            .header(EVENT_HEADER)
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or(WebhookError::MissingEventHeader)?;

        let kind = EventKind::from_header(event)
            .filter(|k| accepted.contains(k))
            .ok_or_else(|| WebhookError::EventNotFound(event.to_string()))?;

        if let Some(secret) = &self.secret {
            let signature = request
                .header(SIGNATURE_HEADER)
                .ok_or(WebhookError::MissingSignatureHeader)?;
            verify_signature(secret, request.body(), signature)?;
        }

        let event = match kind {
            EventKind::Ping => Event::Ping(serde_json::from_slice(request.body())?),
            EventKind::Push => Event::Push(serde_json::from_slice(request.body())?),
        };
        Ok(event)
    }
}

/// Compute the `sha256=<hex>` signature header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac(secret, body).finalize().into_bytes()))
}

/// Check a `sha256=<hex>` signature in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), WebhookError> {
    let expected = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or(WebhookError::HmacVerificationFailed)?;

    mac(secret, body)
        .verify_slice(&expected)
        .map_err(|_| WebhookError::HmacVerificationFailed)
}

fn mac(secret: &str, body: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so this never takes the fallback.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| <HmacSha256 as Mac>::new(&Default::default()));
    mac.update(body);
    mac
}
