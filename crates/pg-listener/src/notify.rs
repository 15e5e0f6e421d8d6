//! Sending notifications
//!
//! Payloads travel as `pg_notify` parameters, so they never need quoting.

use crate::channel::{validate_channel_name, Action};
use crate::error::Result;
use serde::Serialize;
use tokio_postgres::Client;

const PG_NOTIFY: &str = "SELECT pg_notify($1, $2)";

/// Channel an ordinary-channel notification for `target` and `action` is sent on.
pub fn action_channel(target: &str, action: Action) -> String {
    format!("{target}_{action}")
}

/// Sends `payload`, JSON encoded, on `channel`.
pub async fn notify<T: Serialize + ?Sized>(
    client: &Client,
    channel: &str,
    payload: &T,
) -> Result<()> {
    validate_channel_name(channel)?;
    let payload = serde_json::to_string(payload)?;
    client.execute(PG_NOTIFY, &[&channel, &payload]).await?;
    Ok(())
}

/// Sends `identifier` on `<target>_<action>`, the way row triggers do.
pub async fn notify_action(
    client: &Client,
    target: &str,
    action: Action,
    identifier: &str,
) -> Result<()> {
    validate_channel_name(target)?;
    let channel = action_channel(target, action);
    client.execute(PG_NOTIFY, &[&channel, &identifier]).await?;
    Ok(())
}
