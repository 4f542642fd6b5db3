//! Message templates with `{{variable}}` placeholders.

use crate::{store_err, Store};
use serde::Serialize;
use sqlx::FromRow;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;
use wagate_core::GatewayError;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub category: String,
    pub content: String,
    /// JSON array of variable names, derived from the content.
    pub variables: String,
    pub image_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct TemplateInput {
    pub name: String,
    pub category: String,
    pub content: String,
    pub image_url: Option<String>,
}

/// Extract the set of `{{name}}` placeholders from template content.
pub fn extract_variables(content: &str) -> Vec<String> {
    let mut vars = BTreeSet::new();
    let mut rest = content;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if !name.is_empty() {
                    vars.insert(name.to_string());
                }
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    vars.into_iter().collect()
}

/// Substitute `{{name}}` placeholders from the given map. Unknown
/// placeholders are left untouched.
pub fn render(content: &str, vars: &HashMap<String, String>) -> String {
    let mut out = content.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

impl Store {
    pub async fn create_template(&self, input: &TemplateInput) -> Result<Template, GatewayError> {
        if input.content.trim().is_empty() {
            return Err(GatewayError::Validation("template content is empty".into()));
        }
        let id = Uuid::new_v4().to_string();
        let variables = serde_json::to_string(&extract_variables(&input.content))?;
        sqlx::query(
            "INSERT INTO message_templates (id, name, category, content, variables, image_url) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.category)
        .bind(&input.content)
        .bind(&variables)
        .bind(&input.image_url)
        .execute(&self.pool)
        .await
        .map_err(store_err("template insert failed"))?;

        self.get_template(&id).await
    }

    pub async fn get_template(&self, id: &str) -> Result<Template, GatewayError> {
        sqlx::query_as("SELECT * FROM message_templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("template query failed"))?
            .ok_or_else(|| GatewayError::NotFound(format!("template {id}")))
    }

    pub async fn list_templates(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<Template>, GatewayError> {
        match category {
            Some(cat) => sqlx::query_as(
                "SELECT * FROM message_templates WHERE category = ? ORDER BY name",
            )
            .bind(cat)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("template list failed")),
            None => sqlx::query_as("SELECT * FROM message_templates ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err("template list failed")),
        }
    }

    pub async fn template_categories(&self) -> Result<Vec<String>, GatewayError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT category FROM message_templates ORDER BY category")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err("category list failed"))?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    pub async fn update_template(
        &self,
        id: &str,
        input: &TemplateInput,
    ) -> Result<Template, GatewayError> {
        let variables = serde_json::to_string(&extract_variables(&input.content))?;
        let updated = sqlx::query(
            "UPDATE message_templates SET name = ?, category = ?, content = ?, variables = ?, \
             image_url = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(&input.name)
        .bind(&input.category)
        .bind(&input.content)
        .bind(&variables)
        .bind(&input.image_url)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("template update failed"))?;

        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("template {id}")));
        }
        self.get_template(id).await
    }

    pub async fn duplicate_template(
        &self,
        id: &str,
        new_name: &str,
    ) -> Result<Template, GatewayError> {
        let original = self.get_template(id).await?;
        self.create_template(&TemplateInput {
            name: new_name.to_string(),
            category: original.category,
            content: original.content,
            image_url: original.image_url,
        })
        .await
    }

    pub async fn delete_template(&self, id: &str) -> Result<(), GatewayError> {
        let deleted = sqlx::query("DELETE FROM message_templates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("template delete failed"))?;
        if deleted.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("template {id}")));
        }
        Ok(())
    }
}
