//! Banker records and valuation-request routing.

use crate::{store_err, Store};
use serde::Serialize;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;
use wagate_core::GatewayError;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Banker {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub agent_number: String,
    pub bank_name: String,
    pub whatsapp_group_id: String,
    /// JSON array of lowercase keywords.
    pub routing_keywords: String,
    pub priority: i64,
    pub is_active: bool,
    pub created_at: String,
}

impl Banker {
    /// Parsed routing keywords. Malformed JSON yields no keywords.
    pub fn keywords(&self) -> Vec<String> {
        serde_json::from_str::<Vec<String>>(&self.routing_keywords).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct BankerInput {
    pub name: String,
    pub display_name: String,
    pub agent_number: String,
    pub bank_name: String,
    pub whatsapp_group_id: String,
    pub routing_keywords: Vec<String>,
    pub priority: i64,
    pub is_active: bool,
}

impl Store {
    pub async fn create_banker(&self, input: &BankerInput) -> Result<Banker, GatewayError> {
        if input.whatsapp_group_id.is_empty() {
            return Err(GatewayError::Validation(
                "banker whatsapp_group_id is required".into(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let keywords = serde_json::to_string(
            &input
                .routing_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect::<Vec<_>>(),
        )?;
        sqlx::query(
            "INSERT INTO bankers (id, name, display_name, agent_number, bank_name, \
             whatsapp_group_id, routing_keywords, priority, is_active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.display_name)
        .bind(&input.agent_number)
        .bind(&input.bank_name)
        .bind(&input.whatsapp_group_id)
        .bind(&keywords)
        .bind(input.priority)
        .bind(input.is_active)
        .execute(&self.pool)
        .await
        .map_err(store_err("banker insert failed"))?;
        self.get_banker(&id).await
    }

    pub async fn get_banker(&self, id: &str) -> Result<Banker, GatewayError> {
        sqlx::query_as("SELECT * FROM bankers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("banker query failed"))?
            .ok_or_else(|| GatewayError::NotFound(format!("banker {id}")))
    }

    pub async fn list_bankers(&self, active_only: bool) -> Result<Vec<Banker>, GatewayError> {
        let sql = if active_only {
            "SELECT * FROM bankers WHERE is_active = 1 ORDER BY priority DESC, created_at, id"
        } else {
            "SELECT * FROM bankers ORDER BY priority DESC, created_at, id"
        };
        sqlx::query_as(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("banker list failed"))
    }

    pub async fn bank_names(&self) -> Result<Vec<String>, GatewayError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT bank_name FROM bankers ORDER BY bank_name")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err("bank name list failed"))?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    pub async fn update_banker(
        &self,
        id: &str,
        input: &BankerInput,
    ) -> Result<Banker, GatewayError> {
        let keywords = serde_json::to_string(
            &input
                .routing_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect::<Vec<_>>(),
        )?;
        let updated = sqlx::query(
            "UPDATE bankers SET name = ?, display_name = ?, agent_number = ?, bank_name = ?, \
             whatsapp_group_id = ?, routing_keywords = ?, priority = ?, is_active = ? \
             WHERE id = ?",
        )
        .bind(&input.name)
        .bind(&input.display_name)
        .bind(&input.agent_number)
        .bind(&input.bank_name)
        .bind(&input.whatsapp_group_id)
        .bind(&keywords)
        .bind(input.priority)
        .bind(input.is_active)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("banker update failed"))?;
        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("banker {id}")));
        }
        self.get_banker(id).await
    }

    pub async fn toggle_banker(&self, id: &str, is_active: bool) -> Result<Banker, GatewayError> {
        let updated = sqlx::query("UPDATE bankers SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("banker toggle failed"))?;
        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("banker {id}")));
        }
        self.get_banker(id).await
    }

    pub async fn delete_banker(&self, id: &str) -> Result<(), GatewayError> {
        let deleted = sqlx::query("DELETE FROM bankers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("banker delete failed"))?;
        if deleted.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("banker {id}")));
        }
        Ok(())
    }

    /// Pick the banker for a valuation request body.
    ///
    /// Highest-priority active banker with at least one routing keyword
    /// appearing (case-insensitively) in the body; ties broken by earliest
    /// `created_at`. The list query already orders by priority then age.
    pub async fn route_banker(&self, body: &str) -> Result<Option<Banker>, GatewayError> {
        let body_lower = body.to_lowercase();
        let bankers = self.list_bankers(true).await?;
        for banker in bankers {
            if banker
                .keywords()
                .iter()
                .any(|kw| !kw.is_empty() && body_lower.contains(kw))
            {
                debug!("routed valuation to banker {}", banker.name);
                return Ok(Some(banker));
            }
        }
        Ok(None)
    }
}
