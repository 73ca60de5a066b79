//! Canonical key identities.
//!
//! A [`LogicalKey`] is the source-independent name a binding resolves to
//! (e.g. `"KEY_PLAY"`). The set is open: any well-formed name coming from
//! configuration is accepted, and the well-known names used by the UI
//! processes are provided as constants.
//!
//! ## Naming rules
//! - non-empty
//! - ASCII upper-case letters, digits and `_` only
//!
//! Names are stored behind an `Arc<str>`, so cloning a key per event is cheap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Canonical, source-independent key identity.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalKey(Arc<str>);

/// Returned when a key name does not follow the naming rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid key name {0:?} (expected upper-case letters, digits and '_')")]
pub struct InvalidKeyName(pub String);

impl LogicalKey {
    /// Validate and wrap a key name.
    pub fn new(name: &str) -> Result<Self, InvalidKeyName> {
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
        if valid {
            Ok(Self(Arc::from(name)))
        } else {
            Err(InvalidKeyName(name.to_string()))
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for the system keys the UI processes rely on.
    pub fn is_reserved(&self) -> bool {
        is_reserved_name(&self.0)
    }
}

impl TryFrom<String> for LogicalKey {
    type Error = InvalidKeyName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        LogicalKey::new(&value)
    }
}

impl From<LogicalKey> for String {
    fn from(key: LogicalKey) -> Self {
        key.0.to_string()
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalKey({})", self.0)
    }
}

pub const KEY_UP: &str = "KEY_UP";
pub const KEY_DOWN: &str = "KEY_DOWN";
pub const KEY_LEFT: &str = "KEY_LEFT";
pub const KEY_RIGHT: &str = "KEY_RIGHT";
pub const KEY_OK: &str = "KEY_OK";
pub const KEY_BACK: &str = "KEY_BACK";
pub const KEY_INFO: &str = "KEY_INFO";
pub const KEY_CHANNELUP: &str = "KEY_CHANNELUP";
pub const KEY_CHANNELDOWN: &str = "KEY_CHANNELDOWN";
pub const KEY_PLAY: &str = "KEY_PLAY";
pub const KEY_STOP: &str = "KEY_STOP";
pub const KEY_NEXT: &str = "KEY_NEXT";
pub const KEY_PREVIOUS: &str = "KEY_PREVIOUS";
pub const KEY_FORWARD: &str = "KEY_FORWARD";
pub const KEY_REWIND: &str = "KEY_REWIND";
pub const KEY_VOLUMEUP: &str = "KEY_VOLUMEUP";
pub const KEY_VOLUMEDOWN: &str = "KEY_VOLUMEDOWN";
pub const KEY_MUTE: &str = "KEY_MUTE";
pub const KEY_POWER: &str = "KEY_POWER";

/// Navigation keys every control surface is expected to provide.
pub const REQUIRED_KEYS: [&str; 10] = [
    KEY_UP,
    KEY_DOWN,
    KEY_LEFT,
    KEY_RIGHT,
    KEY_OK,
    KEY_BACK,
    KEY_INFO,
    KEY_CHANNELUP,
    KEY_CHANNELDOWN,
    KEY_PLAY,
];

/// Multimedia keys that are optional but still reserved.
pub const OPTIONAL_KEYS: [&str; 9] = [
    KEY_STOP,
    KEY_NEXT,
    KEY_PREVIOUS,
    KEY_FORWARD,
    KEY_REWIND,
    KEY_VOLUMEUP,
    KEY_VOLUMEDOWN,
    KEY_MUTE,
    KEY_POWER,
];

/// `true` if `name` is one of the system-level key names.
pub fn is_reserved_name(name: &str) -> bool {
    REQUIRED_KEYS.contains(&name) || OPTIONAL_KEYS.contains(&name)
}
