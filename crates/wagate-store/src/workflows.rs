//! Workflow definitions and per-execution records.

use crate::{store_err, Store};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;
use wagate_core::GatewayError;

/// A registered workflow.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub trigger_type: String,
    pub trigger_config: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// One run of a workflow handler.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: String,
    pub trigger_payload: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

/// Fields accepted on workflow create/update.
#[derive(Debug, Clone)]
pub struct WorkflowInput {
    pub name: String,
    pub trigger_type: String,
    pub trigger_config: String,
    pub is_active: bool,
}

impl Store {
    pub async fn create_workflow(&self, input: &WorkflowInput) -> Result<Workflow, GatewayError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO workflows (id, name, trigger_type, trigger_config, is_active) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.trigger_type)
        .bind(&input.trigger_config)
        .bind(input.is_active)
        .execute(&self.pool)
        .await
        .map_err(store_err("workflow insert failed"))?;

        self.get_workflow(&id).await
    }

    /// Ensure a workflow row exists for a registered handler name.
    ///
    /// Used at startup so executions always have a parent row to point at.
    pub async fn ensure_workflow(
        &self,
        name: &str,
        trigger_type: &str,
    ) -> Result<Workflow, GatewayError> {
        if let Some(existing) = self.get_workflow_by_name(name).await? {
            return Ok(existing);
        }
        self.create_workflow(&WorkflowInput {
            name: name.to_string(),
            trigger_type: trigger_type.to_string(),
            trigger_config: "{}".to_string(),
            is_active: true,
        })
        .await
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Workflow, GatewayError> {
        sqlx::query_as("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("workflow query failed"))?
            .ok_or_else(|| GatewayError::NotFound(format!("workflow {id}")))
    }

    pub async fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Workflow>, GatewayError> {
        sqlx::query_as("SELECT * FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("workflow query failed"))
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, GatewayError> {
        sqlx::query_as("SELECT * FROM workflows ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("workflow list failed"))
    }

    pub async fn update_workflow(
        &self,
        id: &str,
        input: &WorkflowInput,
    ) -> Result<Workflow, GatewayError> {
        let updated = sqlx::query(
            "UPDATE workflows SET name = ?, trigger_type = ?, trigger_config = ?, \
             is_active = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(&input.name)
        .bind(&input.trigger_type)
        .bind(&input.trigger_config)
        .bind(input.is_active)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("workflow update failed"))?;

        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("workflow {id}")));
        }
        self.get_workflow(id).await
    }

    pub async fn toggle_workflow(&self, id: &str, is_active: bool) -> Result<Workflow, GatewayError> {
        let updated = sqlx::query(
            "UPDATE workflows SET is_active = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(is_active)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("workflow toggle failed"))?;

        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("workflow {id}")));
        }
        self.get_workflow(id).await
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<(), GatewayError> {
        let deleted = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("workflow delete failed"))?;

        if deleted.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("workflow {id}")));
        }
        Ok(())
    }

    /// Insert a `running` execution record and return its id.
    pub async fn begin_execution(
        &self,
        workflow_id: &str,
        trigger_payload: &str,
    ) -> Result<String, GatewayError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO workflow_executions (id, workflow_id, status, trigger_payload) \
             VALUES (?, ?, 'running', ?)",
        )
        .bind(&id)
        .bind(workflow_id)
        .bind(trigger_payload)
        .execute(&self.pool)
        .await
        .map_err(store_err("execution insert failed"))?;
        Ok(id)
    }

    /// Finalize an execution as `completed` or `failed`.
    pub async fn finish_execution(
        &self,
        execution_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE workflow_executions SET status = ?, completed_at = datetime('now'), \
             error = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(store_err("execution update failed"))?;
        Ok(())
    }

    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<WorkflowExecution>, GatewayError> {
        match workflow_id {
            Some(wf) => sqlx::query_as(
                "SELECT * FROM workflow_executions WHERE workflow_id = ? \
                 ORDER BY started_at DESC LIMIT ?",
            )
            .bind(wf)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("execution list failed")),
            None => sqlx::query_as(
                "SELECT * FROM workflow_executions ORDER BY started_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("execution list failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn workflow_crud_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let wf = store
            .create_workflow(&WorkflowInput {
                name: "valuation_request".into(),
                trigger_type: "keyword".into(),
                trigger_config: "{}".into(),
                is_active: true,
            })
            .await
            .unwrap();

        assert!(wf.is_active);
        let fetched = store.get_workflow(&wf.id).await.unwrap();
        assert_eq!(fetched.name, "valuation_request");

        let toggled = store.toggle_workflow(&wf.id, false).await.unwrap();
        assert!(!toggled.is_active);

        store.delete_workflow(&wf.id).await.unwrap();
        assert!(matches!(
            store.get_workflow(&wf.id).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ensure_workflow_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let a = store.ensure_workflow("valuation_reply", "keyword").await.unwrap();
        let b = store.ensure_workflow("valuation_reply", "keyword").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn execution_lifecycle() {
        let store = Store::in_memory().await.unwrap();
        let wf = store.ensure_workflow("interest_rate", "keyword").await.unwrap();

        let exec_id = store.begin_execution(&wf.id, "{}").await.unwrap();
        store
            .finish_execution(&exec_id, "failed", Some("no banker matched"))
            .await
            .unwrap();

        let execs = store.list_executions(Some(&wf.id), 10).await.unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].status, "failed");
        assert_eq!(execs[0].error.as_deref(), Some("no banker matched"));
        assert!(execs[0].completed_at.is_some());
    }
}
