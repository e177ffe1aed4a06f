//! Hub wire protocol. Every message is one JSON text frame of shape
//! `{"type": ..., "data": ...}`; relayed reports and commands additionally
//! carry `id`, `received`, and `client` added by the hub. Unknown or
//! malformed frames are rejected in one place, at decode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ManifestError, Result};

/// Enrichment the hub stamps onto relayed reports and commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMeta {
    /// Fresh unique id per relayed message.
    pub id: String,
    /// Unix seconds at which the hub received the original.
    pub received: u64,
    /// Remote address of the originating connection.
    pub client: String,
}

impl RelayMeta {
    pub fn stamp(origin: &std::net::SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            received: crate::util::unix_now(),
            client: origin.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTypesData {
    pub image_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsData {
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewManifestData {
    pub image_type: String,
}

/// Closed set of hub messages, exhaustive at the decode boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// Sent to every connection on open: the image types this hub tracks.
    ImageTypes { data: ImageTypesData },
    /// Live slave hostnames; sent to masters on open and on table changes.
    Targets { data: TargetsData },
    /// A new manifest was installed for an image type; sent to everyone.
    NewManifest { data: NewManifestData },
    /// Slave status report. `relay` is absent on the inbound frame and
    /// stamped by the hub before fan-out to masters.
    Report {
        #[serde(flatten)]
        relay: Option<RelayMeta>,
        data: serde_json::Value,
    },
    /// Operator command addressed to one slave hostname.
    Command {
        target: String,
        #[serde(flatten)]
        relay: Option<RelayMeta>,
        data: serde_json::Value,
    },
}

impl HubMessage {
    pub fn image_types(image_types: Vec<String>) -> Self {
        HubMessage::ImageTypes {
            data: ImageTypesData { image_types },
        }
    }

    pub fn targets(targets: Vec<String>) -> Self {
        HubMessage::Targets {
            data: TargetsData { targets },
        }
    }

    pub fn new_manifest(image_type: impl Into<String>) -> Self {
        HubMessage::NewManifest {
            data: NewManifestData {
                image_type: image_type.into(),
            },
        }
    }

    /// Decode one frame; anything malformed or unknown-typed is a
    /// `ProtocolError` for the caller to drop.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ManifestError::Protocol(e.to_string()))
    }

    /// Short wire-type label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::ImageTypes { .. } => "image_types",
            HubMessage::Targets { .. } => "targets",
            HubMessage::NewManifest { .. } => "new_manifest",
            HubMessage::Report { .. } => "report",
            HubMessage::Command { .. } => "command",
        }
    }

    pub fn to_json(&self) -> String {
        // The closed enum always serializes; a failure here is a bug.
        serde_json::to_string(self).unwrap_or_default()
    }
}
