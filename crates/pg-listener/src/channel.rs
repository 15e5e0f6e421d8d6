//! Channel naming
//!
//! Ordinary channels name a table or entity; the database fires `<name>_create`,
//! `<name>_update` and `<name>_delete` for them. System channels start with
//! [`SYSTEM_CHANNEL_PREFIX`], take a single handler and carry no action suffix.

use crate::error::{ListenerError, Result};
use std::fmt;
use std::str::FromStr;

/// Prefix reserved for system channels.
pub const SYSTEM_CHANNEL_PREFIX: &str = "sys_";

/// Row change carried by an ordinary channel notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Create,
    Delete,
    Update,
}

impl Action {
    /// Every action, in the order LISTEN statements are issued.
    pub const ALL: [Action; 3] = [Action::Create, Action::Delete, Action::Update];

    /// Name used as the channel suffix.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Delete => "delete",
            Action::Update => "update",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Action::Create),
            "delete" => Ok(Action::Delete),
            "update" => Ok(Action::Update),
            other => Err(ListenerError::Notify(format!(
                "{other} action is not supported"
            ))),
        }
    }
}

/// System channels carry a single handler and are listened on verbatim.
pub fn is_system_channel(channel: &str) -> bool {
    channel.starts_with(SYSTEM_CHANNEL_PREFIX)
}

/// Accepts plain SQL identifiers only.
pub fn validate_channel_name(channel: &str) -> Result<()> {
    let valid = !channel.is_empty()
        && !channel.starts_with(|c: char| c.is_ascii_digit())
        && channel.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(ListenerError::InvalidChannel(channel.to_string()))
    }
}

/// The postgres channels behind a registered channel.
pub fn pg_channels(channel: &str) -> Vec<String> {
    if is_system_channel(channel) {
        vec![channel.to_string()]
    } else {
        Action::ALL
            .iter()
            .map(|action| format!("{channel}_{action}"))
            .collect()
    }
}

/// `LISTEN` statements for every database channel behind `channel`.
pub fn listen_statements(channel: &str) -> Vec<String> {
    pg_channels(channel)
        .into_iter()
        .map(|name| format!("LISTEN {name};"))
        .collect()
}

/// `UNLISTEN` counterparts of [`listen_statements`].
pub fn unlisten_statements(channel: &str) -> Vec<String> {
    pg_channels(channel)
        .into_iter()
        .map(|name| format!("UNLISTEN {name};"))
        .collect()
}

/// Splits `<name>_<action>` at the last underscore.
pub fn split_notify_channel(pg_channel: &str) -> Result<(&str, Action)> {
    let (name, action) = pg_channel.rsplit_once('_').ok_or_else(|| {
        ListenerError::Notify(format!("{pg_channel} has no action suffix"))
    })?;
    Ok((name, action.parse()?))
}
