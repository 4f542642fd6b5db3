//! Valuation request lifecycle records.
//!
//! `forward_message_id` is the join key: it is persisted before the
//! acknowledgment is enqueued, so a banker reply quoting the forward is
//! guaranteed to find the row.

use crate::{store_err, Store};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;
use wagate_core::GatewayError;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ValuationRequest {
    pub id: String,
    pub requester_group_id: String,
    pub request_message_id: String,
    pub address: String,
    pub size: String,
    pub asking: String,
    pub salesperson_name: String,
    pub agent_number_raw: String,
    pub agent_phone_e164: String,
    pub agent_whatsapp_id: String,
    pub banker_name_requested: String,
    pub banker_id: String,
    pub banker_name: String,
    pub target_group_id: String,
    pub forward_message_id: Option<String>,
    pub forwarded_at: Option<String>,
    pub acknowledgment_message_id: Option<String>,
    pub banker_reply_message_id: Option<String>,
    pub banker_reply_text: Option<String>,
    pub banker_replied_at: Option<String>,
    pub final_reply_message_id: Option<String>,
    pub agent_notification_message_id: Option<String>,
    pub status: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Fields known at insert time (status starts `pending`).
#[derive(Debug, Clone, Default)]
pub struct NewValuation {
    pub requester_group_id: String,
    pub request_message_id: String,
    pub address: String,
    pub size: String,
    pub asking: String,
    pub salesperson_name: String,
    pub agent_number_raw: String,
    pub agent_phone_e164: String,
    pub agent_whatsapp_id: String,
    pub banker_name_requested: String,
    pub banker_id: String,
    pub banker_name: String,
    pub target_group_id: String,
}

impl Store {
    pub async fn create_valuation(
        &self,
        new: &NewValuation,
    ) -> Result<ValuationRequest, GatewayError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO valuation_requests \
             (id, requester_group_id, request_message_id, address, size, asking, \
              salesperson_name, agent_number_raw, agent_phone_e164, agent_whatsapp_id, \
              banker_name_requested, banker_id, banker_name, target_group_id, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')",
        )
        .bind(&id)
        .bind(&new.requester_group_id)
        .bind(&new.request_message_id)
        .bind(&new.address)
        .bind(&new.size)
        .bind(&new.asking)
        .bind(&new.salesperson_name)
        .bind(&new.agent_number_raw)
        .bind(&new.agent_phone_e164)
        .bind(&new.agent_whatsapp_id)
        .bind(&new.banker_name_requested)
        .bind(&new.banker_id)
        .bind(&new.banker_name)
        .bind(&new.target_group_id)
        .execute(&self.pool)
        .await
        .map_err(store_err("valuation insert failed"))?;
        self.get_valuation(&id).await
    }

    pub async fn get_valuation(&self, id: &str) -> Result<ValuationRequest, GatewayError> {
        sqlx::query_as("SELECT * FROM valuation_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("valuation query failed"))?
            .ok_or_else(|| GatewayError::NotFound(format!("valuation {id}")))
    }

    pub async fn list_valuations(
        &self,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ValuationRequest>, GatewayError> {
        match status {
            Some(s) => sqlx::query_as(
                "SELECT * FROM valuation_requests WHERE status = ? \
                 ORDER BY created_at DESC LIMIT ?",
            )
            .bind(s)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("valuation list failed")),
            None => sqlx::query_as(
                "SELECT * FROM valuation_requests ORDER BY created_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("valuation list failed")),
        }
    }

    pub async fn delete_valuation(&self, id: &str) -> Result<(), GatewayError> {
        let deleted = sqlx::query("DELETE FROM valuation_requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("valuation delete failed"))?;
        if deleted.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("valuation {id}")));
        }
        Ok(())
    }

    /// Record the forward to the banker group. Status → `forwarded`.
    pub async fn mark_valuation_forwarded(
        &self,
        id: &str,
        forward_message_id: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE valuation_requests SET forward_message_id = ?, \
             forwarded_at = datetime('now'), status = 'forwarded' WHERE id = ?",
        )
        .bind(forward_message_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("valuation update failed"))?;
        Ok(())
    }

    pub async fn set_valuation_acknowledgment(
        &self,
        id: &str,
        ack_message_id: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE valuation_requests SET acknowledgment_message_id = ? WHERE id = ?")
            .bind(ack_message_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("valuation update failed"))?;
        Ok(())
    }

    /// Locate the request a banker reply is quoting.
    pub async fn find_valuation_by_forward(
        &self,
        forward_message_id: &str,
        target_group_id: &str,
    ) -> Result<Option<ValuationRequest>, GatewayError> {
        sqlx::query_as(
            "SELECT * FROM valuation_requests \
             WHERE forward_message_id = ? AND target_group_id = ?",
        )
        .bind(forward_message_id)
        .bind(target_group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("valuation query failed"))
    }

    /// Record the banker's reply. Status → `replied_by_banker`.
    pub async fn record_banker_reply(
        &self,
        id: &str,
        reply_message_id: &str,
        reply_text: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE valuation_requests SET banker_reply_message_id = ?, banker_reply_text = ?, \
             banker_replied_at = datetime('now'), status = 'replied_by_banker' WHERE id = ?",
        )
        .bind(reply_message_id)
        .bind(reply_text)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("valuation update failed"))?;
        Ok(())
    }

    pub async fn set_valuation_final_reply(
        &self,
        id: &str,
        final_reply_message_id: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE valuation_requests SET final_reply_message_id = ? WHERE id = ?")
            .bind(final_reply_message_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("valuation update failed"))?;
        Ok(())
    }

    pub async fn set_valuation_agent_notification(
        &self,
        id: &str,
        agent_notification_message_id: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE valuation_requests SET agent_notification_message_id = ? WHERE id = ?",
        )
        .bind(agent_notification_message_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("valuation update failed"))?;
        Ok(())
    }

    /// Terminal transition once both outbound replies succeeded.
    pub async fn mark_valuation_completed(&self, id: &str) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE valuation_requests SET status = 'completed', \
             completed_at = datetime('now') WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("valuation update failed"))?;
        Ok(())
    }
}
