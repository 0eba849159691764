use std::sync::LazyLock;

use cdo_core::models::Branch;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

static IGNORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DEPLOY\s*:\s*(SKIP|IGNORED?)").unwrap());

const BRANCH_REF_PREFIX: &str = "refs/heads/";
const NULL_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature")]
    MissingSignature,

    #[error("signature mismatch")]
    BadSignature,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// What a delivery asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Deploy { branch: Branch, reference: String },
    Cleanup { branch: Branch },
    Ignored(String),
    Ping,
}

/// Check `X-Hub-Signature-256` (`sha256=<hex hmac of body>`).
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), WebhookError> {
    let header = header.ok_or(WebhookError::MissingSignature)?;
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or(WebhookError::BadSignature)?;
    let digest = hex::decode(hex_digest).map_err(|_| WebhookError::BadSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::BadSignature)?;
    mac.update(body);
    mac.verify_slice(&digest).map_err(|_| WebhookError::BadSignature)
}

/// `sha256=<hex>` for `body`, as a sender would compute it.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn is_ignored(message: &str) -> bool {
    IGNORE_RE.is_match(message)
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    reference: String,
    after: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    head_commit: Option<HeadCommit>,
}

#[derive(Deserialize)]
struct HeadCommit {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    number: u64,
    pull_request: PullRequest,
}

#[derive(Deserialize)]
struct PullRequest {
    head: PullRequestHead,
}

#[derive(Deserialize)]
struct PullRequestHead {
    sha: String,
}

/// Interpret a delivery of `event` (the `X-GitHub-Event` header) for `app`.
pub fn parse_event(app: &str, event: &str, body: &[u8]) -> Result<HookEvent, WebhookError> {
    let malformed = |e: serde_json::Error| WebhookError::Malformed(e.to_string());
    match event {
        "ping" => Ok(HookEvent::Ping),
        "push" => {
            let push: PushPayload = serde_json::from_slice(body).map_err(malformed)?;
            let Some(name) = push.reference.strip_prefix(BRANCH_REF_PREFIX) else {
                return Ok(HookEvent::Ignored(format!("{} is not a branch", push.reference)));
            };
            let branch = Branch::named(app, name);
            if push.deleted || push.after == NULL_SHA {
                return Ok(HookEvent::Cleanup { branch });
            }
            if let Some(commit) = &push.head_commit {
                if is_ignored(&commit.message) {
                    return Ok(HookEvent::Ignored(format!("{} asked to be skipped", &push.after)));
                }
            }
            Ok(HookEvent::Deploy {
                branch,
                reference: push.after,
            })
        }
        "pull_request" => {
            let pull: PullRequestPayload = serde_json::from_slice(body).map_err(malformed)?;
            let branch = Branch::pull_request(app, pull.number);
            match pull.action.as_str() {
                "closed" => Ok(HookEvent::Cleanup { branch }),
                "opened" | "reopened" | "synchronize" => Ok(HookEvent::Deploy {
                    branch,
                    reference: pull.pull_request.head.sha,
                }),
                other => Ok(HookEvent::Ignored(format!("pull request action {other}"))),
            }
        }
        other => Ok(HookEvent::Ignored(format!("event {other}"))),
    }
}
