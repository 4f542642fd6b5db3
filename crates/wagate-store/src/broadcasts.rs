//! Broadcast campaign executions and per-recipient message rows.

use crate::{store_err, Store};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;
use wagate_core::GatewayError;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BroadcastExecution {
    pub id: String,
    pub broadcast_id: String,
    pub status: String,
    pub total_contacts: i64,
    pub current_index: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub message_content: String,
    pub image_url: Option<String>,
    pub delay_mode: String,
    pub notification_contact: Option<String>,
    pub started_at: String,
    pub last_sent_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BroadcastMessage {
    pub id: String,
    pub execution_id: String,
    pub contact_id: Option<String>,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub send_order: i64,
    pub status: String,
    pub sent_at: Option<String>,
    pub error: Option<String>,
}

/// Recipient as handed to the executor.
#[derive(Debug, Clone)]
pub struct BroadcastRecipient {
    pub contact_id: Option<String>,
    pub name: String,
    pub phone: String,
}

/// Preflight parameters for a new campaign.
#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub broadcast_id: String,
    pub message_content: String,
    pub image_url: Option<String>,
    pub delay_mode: String,
    pub notification_contact: Option<String>,
}

impl Store {
    /// Insert the execution row and all pending message rows in one
    /// transaction. Creation is keyed by `broadcast_id`: re-submitting the
    /// same id returns the existing execution instead of a second campaign.
    pub async fn create_broadcast(
        &self,
        new: &NewBroadcast,
        recipients: &[BroadcastRecipient],
    ) -> Result<BroadcastExecution, GatewayError> {
        if let Some(existing) = self.get_broadcast_by_broadcast_id(&new.broadcast_id).await? {
            return Ok(existing);
        }

        let execution_id = Uuid::new_v4().to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("broadcast tx begin failed"))?;

        sqlx::query(
            "INSERT INTO broadcast_executions \
             (id, broadcast_id, status, total_contacts, message_content, image_url, \
              delay_mode, notification_contact) \
             VALUES (?, ?, 'running', ?, ?, ?, ?, ?)",
        )
        .bind(&execution_id)
        .bind(&new.broadcast_id)
        .bind(recipients.len() as i64)
        .bind(&new.message_content)
        .bind(&new.image_url)
        .bind(&new.delay_mode)
        .bind(&new.notification_contact)
        .execute(&mut *tx)
        .await
        .map_err(store_err("broadcast execution insert failed"))?;

        for (index, recipient) in recipients.iter().enumerate() {
            sqlx::query(
                "INSERT INTO broadcast_messages \
                 (id, execution_id, contact_id, recipient_name, recipient_phone, send_order) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&execution_id)
            .bind(&recipient.contact_id)
            .bind(&recipient.name)
            .bind(&recipient.phone)
            .bind(index as i64 + 1)
            .execute(&mut *tx)
            .await
            .map_err(store_err("broadcast message insert failed"))?;
        }

        tx.commit()
            .await
            .map_err(store_err("broadcast tx commit failed"))?;

        self.get_broadcast_execution(&execution_id).await
    }

    pub async fn get_broadcast_execution(
        &self,
        id: &str,
    ) -> Result<BroadcastExecution, GatewayError> {
        sqlx::query_as("SELECT * FROM broadcast_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("broadcast query failed"))?
            .ok_or_else(|| GatewayError::NotFound(format!("broadcast execution {id}")))
    }

    pub async fn get_broadcast_by_broadcast_id(
        &self,
        broadcast_id: &str,
    ) -> Result<Option<BroadcastExecution>, GatewayError> {
        sqlx::query_as("SELECT * FROM broadcast_executions WHERE broadcast_id = ?")
            .bind(broadcast_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("broadcast query failed"))
    }

    /// Resolve either an execution id or a `broadcast_*` public id.
    pub async fn resolve_broadcast(
        &self,
        id_or_broadcast_id: &str,
    ) -> Result<BroadcastExecution, GatewayError> {
        if let Some(found) = self.get_broadcast_by_broadcast_id(id_or_broadcast_id).await? {
            return Ok(found);
        }
        self.get_broadcast_execution(id_or_broadcast_id).await
    }

    pub async fn list_broadcast_history(
        &self,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<BroadcastExecution>, GatewayError> {
        match status {
            Some(s) => sqlx::query_as(
                "SELECT * FROM broadcast_executions WHERE status = ? \
                 ORDER BY started_at DESC LIMIT ?",
            )
            .bind(s)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("broadcast history failed")),
            None => sqlx::query_as(
                "SELECT * FROM broadcast_executions ORDER BY started_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("broadcast history failed")),
        }
    }

    pub async fn list_broadcast_messages(
        &self,
        execution_id: &str,
    ) -> Result<Vec<BroadcastMessage>, GatewayError> {
        sqlx::query_as(
            "SELECT * FROM broadcast_messages WHERE execution_id = ? ORDER BY send_order",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("broadcast message list failed"))
    }

    pub async fn mark_broadcast_message_sending(&self, id: &str) -> Result<(), GatewayError> {
        sqlx::query("UPDATE broadcast_messages SET status = 'sending' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("broadcast message update failed"))?;
        Ok(())
    }

    pub async fn mark_broadcast_message_sent(&self, id: &str) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE broadcast_messages SET status = 'sent', sent_at = datetime('now') \
             WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("broadcast message update failed"))?;
        Ok(())
    }

    pub async fn mark_broadcast_message_failed(
        &self,
        id: &str,
        error: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE broadcast_messages SET status = 'failed', error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("broadcast message update failed"))?;
        Ok(())
    }

    /// Persist campaign progress after each contact.
    pub async fn update_broadcast_progress(
        &self,
        execution_id: &str,
        current_index: i64,
        sent_count: i64,
        failed_count: i64,
        touched_last_sent: bool,
    ) -> Result<(), GatewayError> {
        let sql = if touched_last_sent {
            "UPDATE broadcast_executions SET current_index = ?, sent_count = ?, \
             failed_count = ?, last_sent_at = datetime('now') WHERE id = ?"
        } else {
            "UPDATE broadcast_executions SET current_index = ?, sent_count = ?, \
             failed_count = ? WHERE id = ?"
        };
        sqlx::query(sql)
            .bind(current_index)
            .bind(sent_count)
            .bind(failed_count)
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(store_err("broadcast progress update failed"))?;
        Ok(())
    }

    /// Terminal transition: `completed`, `failed`, or `cancelled`.
    pub async fn finalize_broadcast(
        &self,
        execution_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE broadcast_executions SET status = ?, completed_at = datetime('now'), \
             error = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(store_err("broadcast finalize failed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipients(n: usize) -> Vec<BroadcastRecipient> {
        (0..n)
            .map(|i| BroadcastRecipient {
                contact_id: None,
                name: format!("Contact {i}"),
                phone: format!("659123456{i}"),
            })
            .collect()
    }

    fn new_broadcast(id: &str) -> NewBroadcast {
        NewBroadcast {
            broadcast_id: id.to_string(),
            message_content: "Hi {name}, rates attached.".into(),
            image_url: None,
            delay_mode: "1-2min".into(),
            notification_contact: None,
        }
    }

    #[tokio::test]
    async fn preflight_creates_ordered_pending_rows() {
        let store = Store::in_memory().await.unwrap();
        let exec = store
            .create_broadcast(&new_broadcast("broadcast_1"), &recipients(3))
            .await
            .unwrap();

        assert_eq!(exec.status, "running");
        assert_eq!(exec.total_contacts, 3);
        assert_eq!(exec.current_index, 0);

        let messages = store.list_broadcast_messages(&exec.id).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages.iter().map(|m| m.send_order).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(messages.iter().all(|m| m.status == "pending"));
    }

    #[tokio::test]
    async fn create_is_idempotent_by_broadcast_id() {
        let store = Store::in_memory().await.unwrap();
        let first = store
            .create_broadcast(&new_broadcast("broadcast_1"), &recipients(2))
            .await
            .unwrap();
        let second = store
            .create_broadcast(&new_broadcast("broadcast_1"), &recipients(5))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.total_contacts, 2);
    }

    #[tokio::test]
    async fn resolve_accepts_either_id() {
        let store = Store::in_memory().await.unwrap();
        let exec = store
            .create_broadcast(&new_broadcast("broadcast_7"), &recipients(1))
            .await
            .unwrap();

        assert_eq!(store.resolve_broadcast("broadcast_7").await.unwrap().id, exec.id);
        assert_eq!(store.resolve_broadcast(&exec.id).await.unwrap().id, exec.id);
        assert!(store.resolve_broadcast("missing").await.is_err());
    }

    #[tokio::test]
    async fn progress_and_finalize() {
        let store = Store::in_memory().await.unwrap();
        let exec = store
            .create_broadcast(&new_broadcast("broadcast_2"), &recipients(2))
            .await
            .unwrap();
        let messages = store.list_broadcast_messages(&exec.id).await.unwrap();

        store.mark_broadcast_message_sending(&messages[0].id).await.unwrap();
        store.mark_broadcast_message_sent(&messages[0].id).await.unwrap();
        store.update_broadcast_progress(&exec.id, 1, 1, 0, true).await.unwrap();

        store.mark_broadcast_message_failed(&messages[1].id, "no wid").await.unwrap();
        store.update_broadcast_progress(&exec.id, 2, 1, 1, false).await.unwrap();
        store.finalize_broadcast(&exec.id, "completed", None).await.unwrap();

        let done = store.get_broadcast_execution(&exec.id).await.unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(done.current_index, done.sent_count + done.failed_count);
        assert!(done.current_index <= done.total_contacts);
        assert!(done.completed_at.is_some());

        let rows = store.list_broadcast_messages(&exec.id).await.unwrap();
        assert_eq!(rows[0].status, "sent");
        assert!(rows[0].sent_at.is_some());
        assert_eq!(rows[1].status, "failed");
        assert_eq!(rows[1].error.as_deref(), Some("no wid"));
    }
}
