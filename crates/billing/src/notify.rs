//! Realtime fan-out
//!
//! Webhook handlers publish to opaque room identifiers; the socket layer that
//! fans these out to connected clients lives elsewhere. Publishing is fire
//! and forget from the caller's perspective.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::json;

use crate::error::{BillingError, BillingResult};

/// Room receiving contract events for a talent
pub fn contract_room(talent_id: &str) -> String {
    format!("contract_{talent_id}")
}

#[async_trait]
pub trait RealtimeNotifier: Send + Sync {
    async fn publish(
        &self,
        room: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> BillingResult<()>;
}

/// Publishes room events over Redis pub/sub
#[derive(Clone)]
pub struct RedisNotifier {
    conn: ConnectionManager,
}

impl RedisNotifier {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RealtimeNotifier for RedisNotifier {
    async fn publish(
        &self,
        room: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> BillingResult<()> {
        let message = json!({ "event": event, "payload": payload }).to_string();
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(room, message)
            .await
            .map_err(|e| BillingError::Internal(format!("redis publish failed: {e}")))?;
        Ok(())
    }
}

/// Drops every event. Used by the worker and in tests.
pub struct NullNotifier;

#[async_trait]
impl RealtimeNotifier for NullNotifier {
    async fn publish(
        &self,
        _room: &str,
        _event: &str,
        _payload: serde_json::Value,
    ) -> BillingResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_room_is_keyed_by_talent() {
        assert_eq!(contract_room("abc-123"), "contract_abc-123");
    }
}
