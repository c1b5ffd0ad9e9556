// SPDX-License-Identifier: MIT OR Apache-2.0
//! Routing attributes shared by both exchange fabrics.
//!
//! The same attribute set serves two purposes: it is the pub/sub message
//! attribute map (and subscription filter input), and its canonical JSON
//! encoding is the AAD that binds every envelope to its route. The AAD
//! bytes must be identical on both peers, so the encoding is fixed here and
//! nowhere else.

use crate::MESSAGE_KIND_TOOL;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which direction a message travels on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSide {
    /// Producer → executor.
    Req,
    /// Executor → producer.
    Resp,
}

impl ChannelSide {
    /// Wire string for this side.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Req => "req",
            Self::Resp => "resp",
        }
    }
}

impl fmt::Display for ChannelSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing attributes for one message.
///
/// `session_id` is the empty string when the route is not session-scoped;
/// that convention keeps the AAD total (both peers always emit the field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAttrs {
    /// Owning user.
    pub user_id: String,
    /// Owning project.
    pub project_id: String,
    /// Session scope, or empty.
    pub session_id: String,
    /// Message direction.
    pub channel: ChannelSide,
    /// Payload kind, e.g. `tool`.
    pub kind: String,
    /// Monotonic sequence number; replies echo the request's value.
    pub seq: u64,
}

/// Serialization view fixing the canonical AAD field order.
///
/// Field order here *is* the interoperability contract: `user_id`,
/// `project_id`, `session_id`, `channel`, `type`, `seq` — with `seq`
/// stringified. Do not reorder.
#[derive(Serialize)]
struct AadView<'a> {
    user_id: &'a str,
    project_id: &'a str,
    session_id: &'a str,
    channel: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    seq: String,
}

impl RouteAttrs {
    /// Attributes for a tool request on the given route.
    pub fn request(
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        session_id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            session_id: session_id.into(),
            channel: ChannelSide::Req,
            kind: MESSAGE_KIND_TOOL.to_string(),
            seq,
        }
    }

    /// The reply attributes for this request: same route and seq, `resp` side.
    #[must_use]
    pub fn reply(&self) -> Self {
        Self {
            channel: ChannelSide::Resp,
            ..self.clone()
        }
    }

    /// Canonical AAD bytes binding an envelope to this route.
    #[must_use]
    pub fn canonical_aad(&self) -> Vec<u8> {
        let view = AadView {
            user_id: &self.user_id,
            project_id: &self.project_id,
            session_id: &self.session_id,
            channel: self.channel.as_str(),
            kind: &self.kind,
            seq: self.seq.to_string(),
        };
        // Struct serialization preserves declaration order, which is the
        // canonical order.
        serde_json::to_vec(&view).expect("AAD view serializes")
    }

    /// The pub/sub attribute map for this route (all values stringified).
    #[must_use]
    pub fn to_attributes(&self, scheme: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("user_id".to_string(), self.user_id.clone()),
            ("project_id".to_string(), self.project_id.clone()),
            ("session_id".to_string(), self.session_id.clone()),
            ("channel".to_string(), self.channel.to_string()),
            ("type".to_string(), self.kind.clone()),
            ("seq".to_string(), self.seq.to_string()),
            ("v".to_string(), scheme.to_string()),
        ])
    }

    /// Rebuild route attributes from a pub/sub attribute map.
    ///
    /// Returns `None` when a required attribute is missing or malformed.
    #[must_use]
    pub fn from_attributes(attrs: &BTreeMap<String, String>) -> Option<Self> {
        let channel = match attrs.get("channel").map(String::as_str) {
            Some("req") => ChannelSide::Req,
            Some("resp") => ChannelSide::Resp,
            _ => return None,
        };
        Some(Self {
            user_id: attrs.get("user_id")?.clone(),
            project_id: attrs.get("project_id")?.clone(),
            session_id: attrs.get("session_id").cloned().unwrap_or_default(),
            channel,
            kind: attrs.get("type")?.clone(),
            seq: attrs.get("seq")?.parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_is_byte_exact() {
        let attrs = RouteAttrs {
            user_id: "u".into(),
            project_id: "p".into(),
            session_id: "s".into(),
            channel: ChannelSide::Req,
            kind: "tool".into(),
            seq: 7,
        };
        assert_eq!(
            attrs.canonical_aad(),
            br#"{"user_id":"u","project_id":"p","session_id":"s","channel":"req","type":"tool","seq":"7"}"#
        );
    }

    #[test]
    fn reply_flips_channel_and_keeps_seq() {
        let req = RouteAttrs::request("u", "p", "", 42);
        let resp = req.reply();
        assert_eq!(resp.channel, ChannelSide::Resp);
        assert_eq!(resp.seq, 42);
        assert_eq!(resp.project_id, req.project_id);
    }

    #[test]
    fn attributes_round_trip() {
        let attrs = RouteAttrs::request("u", "p", "sess", 3);
        let map = attrs.to_attributes("a256gcm:v1");
        assert_eq!(map["v"], "a256gcm:v1");
        assert_eq!(RouteAttrs::from_attributes(&map), Some(attrs));
    }

    #[test]
    fn from_attributes_rejects_missing_seq() {
        let mut map = RouteAttrs::request("u", "p", "", 1).to_attributes("a256gcm:v1");
        map.remove("seq");
        assert!(RouteAttrs::from_attributes(&map).is_none());
    }

    #[test]
    fn aad_differs_when_any_field_differs() {
        let base = RouteAttrs::request("u", "p", "s", 7);
        let mut other = base.clone();
        other.seq = 8;
        assert_ne!(base.canonical_aad(), other.canonical_aad());

        let mut other = base.clone();
        other.session_id = "t".into();
        assert_ne!(base.canonical_aad(), other.canonical_aad());
    }
}
