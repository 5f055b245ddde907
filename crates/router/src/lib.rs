//! kubelink router: parse command envelopes, dispatch to reconcilers, publish replies.
//!
//! Envelope: `<id>@<operation>|<percent-encoded manifest>`. The reply goes to
//! `<base>/cmdexe` as `<id>@<operation>|<result text>`, or `invalid payload`
//! when the envelope itself does not parse.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kubelink_apply::{Reconciled, ResourceReconciler};
use kubelink_core::{decode_manifest, DecodeError, Manifest};
use kubelink_transport::{Publisher, TransportError};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tracing::{debug, error, info};

pub mod body;

pub use body::BodyError;

pub const DEFAULT_REPLY_DELAY: Duration = Duration::from_millis(500);

pub const INVALID_PAYLOAD: &str = "invalid payload";
pub const EMPTY_BODY: &str = "empty command body";
pub const INVALID_BODY: &str = "command body is invalid format";
pub const UNKNOWN_COMMAND: &str = "unknown command";
pub const INVALID_MANIFEST: &str = "invalid format, skip this message";
pub const UNKNOWN_TYPE: &str = "unknown type, skip this message";

// ASCII word characters; `.` stops at a newline.
static GRAMMAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?-u)^([\w\-]+)@([\w\-]+)\|(.*)$").unwrap());

/// A parsed command message. `op` is kept verbatim, dispatchable or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub id: &'a str,
    pub op: &'a str,
    pub body: &'a [u8],
}

pub fn parse_envelope(payload: &[u8]) -> Option<Envelope<'_>> {
    let caps = GRAMMAR.captures(payload)?;
    Some(Envelope {
        id: std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?,
        op: std::str::from_utf8(caps.get(2)?.as_bytes()).ok()?,
        body: caps.get(3)?.as_bytes(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Delete,
}

impl Operation {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "apply" => Some(Operation::Apply),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Apply => "apply",
            Operation::Delete => "delete",
        }
    }
}

/// One reconciler per managed kind.
pub struct Reconcilers {
    pub deployments: ResourceReconciler<Deployment>,
    pub services: ResourceReconciler<Service>,
    pub config_maps: ResourceReconciler<ConfigMap>,
    pub secrets: ResourceReconciler<Secret>,
}

impl Reconcilers {
    pub async fn dispatch(&self, op: Operation, manifest: &Manifest) -> Reconciled {
        match (op, manifest) {
            (Operation::Apply, Manifest::Deployment(o)) => self.deployments.apply(o).await,
            (Operation::Apply, Manifest::Service(o)) => self.services.apply(o).await,
            (Operation::Apply, Manifest::ConfigMap(o)) => self.config_maps.apply(o).await,
            (Operation::Apply, Manifest::Secret(o)) => self.secrets.apply(o).await,
            (Operation::Delete, Manifest::Deployment(o)) => self.deployments.delete(o).await,
            (Operation::Delete, Manifest::Service(o)) => self.services.delete(o).await,
            (Operation::Delete, Manifest::ConfigMap(o)) => self.config_maps.delete(o).await,
            (Operation::Delete, Manifest::Secret(o)) => self.secrets.delete(o).await,
        }
    }
}

/// Stateless per message; share behind an `Arc` and call concurrently.
pub struct CommandRouter {
    reconcilers: Reconcilers,
    cmd_topic: String,
    reply_topic: String,
    reply_delay: Duration,
    publisher: Arc<dyn Publisher>,
}

impl CommandRouter {
    pub fn new(reconcilers: Reconcilers, cmd_base: &str, reply_delay: Duration, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            reconcilers,
            cmd_topic: kubelink_core::cmd_topic(cmd_base),
            reply_topic: kubelink_core::reply_topic(cmd_base),
            reply_delay,
            publisher,
        }
    }

    pub fn cmd_topic(&self) -> &str { &self.cmd_topic }
    pub fn reply_topic(&self) -> &str { &self.reply_topic }

    /// Handle one inbound message: compute the reply, wait the reply delay, publish it.
    pub async fn handle(&self, payload: &[u8]) -> Result<(), TransportError> {
        let reply = self.respond(payload).await;
        if !self.reply_delay.is_zero() {
            tokio::time::sleep(self.reply_delay).await;
        }
        info!(topic = %self.reply_topic, reply = %reply, "reply");
        self.publisher.publish(&self.reply_topic, reply).await.map_err(|e| {
            error!(topic = %self.reply_topic, error = %e, "publishing reply failed");
            e
        })
    }

    /// Reply text for one payload.
    pub async fn respond(&self, payload: &[u8]) -> String {
        let Some(env) = parse_envelope(payload) else {
            info!(bytes = payload.len(), "{}", INVALID_PAYLOAD);
            rejected("invalid_payload");
            return INVALID_PAYLOAD.to_string();
        };
        info!(id = env.id, op = env.op, bytes = env.body.len(), "command received");
        format!("{}@{}|{}", env.id, env.op, self.execute(&env).await)
    }

    async fn execute(&self, env: &Envelope<'_>) -> String {
        let body = match body::unescape(env.body) {
            Ok(b) => b,
            Err(BodyError::Empty) => {
                info!(id = env.id, "{}", EMPTY_BODY);
                rejected("empty_body");
                return EMPTY_BODY.to_string();
            }
            Err(e) => {
                info!(id = env.id, error = %e, "{}", INVALID_BODY);
                rejected("invalid_body");
                return INVALID_BODY.to_string();
            }
        };
        debug!(id = env.id, body = %String::from_utf8_lossy(&body), "decoded body");

        let Some(op) = Operation::parse(env.op) else {
            info!(id = env.id, op = env.op, "{}", UNKNOWN_COMMAND);
            rejected("unknown_command");
            return UNKNOWN_COMMAND.to_string();
        };

        let manifest = match decode_manifest(&body) {
            Ok(m) => m,
            Err(e @ DecodeError::Malformed(_)) => {
                info!(id = env.id, error = %e, "{}", INVALID_MANIFEST);
                rejected("invalid_manifest");
                return INVALID_MANIFEST.to_string();
            }
            Err(e @ DecodeError::Unsupported { .. }) => {
                info!(id = env.id, error = %e, "{}", UNKNOWN_TYPE);
                rejected("unknown_type");
                return UNKNOWN_TYPE.to_string();
            }
        };

        debug!(id = env.id, op = op.as_str(), kind = manifest.kind().label(), name = manifest.name(), "dispatching");
        let res = self.reconcilers.dispatch(op, &manifest).await;
        let result = if res.outcome.is_failure() { "failed" } else { "ok" };
        counter!("kubelink_commands_total", 1u64, "op" => op.as_str(), "kind" => res.kind.label(), "result" => result);
        res.to_string()
    }
}

fn rejected(reason: &'static str) {
    counter!("kubelink_commands_total", 1u64, "result" => reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_splits_on_first_at_and_pipe() {
        let env = parse_envelope(b"req-1@apply|a|b@c").unwrap();
        assert_eq!(env, Envelope { id: "req-1", op: "apply", body: b"a|b@c" });
        assert_eq!(parse_envelope(b"a@b|").unwrap().body, b"");
    }

    #[test]
    fn envelope_rejects_bad_tokens() {
        let cases: [&[u8]; 7] = [b"", b"invalid", b"@b|", b"a@|x", b"a b@apply|x", b"a@apply|x\ny", "é@apply|x".as_bytes()];
        for p in cases {
            assert!(parse_envelope(p).is_none(), "{:?}", String::from_utf8_lossy(p));
        }
    }

    #[test]
    fn operations() {
        assert_eq!(Operation::parse("apply"), Some(Operation::Apply));
        assert_eq!(Operation::parse("delete"), Some(Operation::Delete));
        assert_eq!(Operation::parse("Apply"), None);
        assert_eq!(Operation::Delete.as_str(), "delete");
    }
}
