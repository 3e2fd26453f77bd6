//! Common identifier types used throughout the coordinator

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identity of one signaling connection. Never reused after disconnect.
    PeerId
);

string_id!(
    /// Caller-supplied or ad-hoc room identifier
    RoomId
);

string_id!(
    /// Identifier of a two-peer pairing session
    SessionId
);

string_id!(
    /// Engine-assigned router identifier
    RouterId
);

string_id!(
    /// Engine-assigned transport identifier
    TransportId
);

string_id!(
    /// Engine-assigned producer identifier
    ProducerId
);

string_id!(
    /// Engine-assigned consumer identifier
    ConsumerId
);

impl PeerId {
    /// Allocate a fresh connection identity
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(16))
    }
}

/// Media kind carried by a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Peer produces media through this transport
    Send,
    /// Peer consumes media through this transport
    Recv,
}

impl Direction {
    #[must_use]
    pub const fn from_sender(is_sender: bool) -> Self {
        if is_sender {
            Self::Send
        } else {
            Self::Recv
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}
