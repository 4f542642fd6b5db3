//! Contact lists and broadcast contacts, with phone normalization.

use crate::{store_err, Store};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;
use wagate_core::GatewayError;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ContactList {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Contact {
    pub id: String,
    pub list_id: String,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub tier: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

/// One contact as supplied by an import (CSV row or manual entry).
#[derive(Debug, Clone)]
pub struct ContactInput {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub tier: Option<String>,
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    /// Duplicates within the list, dropped silently.
    pub skipped: usize,
    /// Rows rejected for an empty/invalid phone.
    pub rejected: usize,
}

/// Normalize a phone number to a digits-only string with the Singapore
/// country code: strip everything but digits (a leading `+` is tolerated),
/// then prefix `65` when missing. Idempotent.
pub fn normalize_phone(raw: &str) -> Result<String, GatewayError> {
    let trimmed = raw.trim();
    let without_plus = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let digits: String = without_plus.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return Err(GatewayError::Validation(format!(
            "phone number '{raw}' has no digits"
        )));
    }

    if digits.starts_with("65") {
        Ok(digits)
    } else {
        Ok(format!("65{digits}"))
    }
}

impl Store {
    pub async fn create_contact_list(
        &self,
        name: &str,
        description: &str,
        source: &str,
    ) -> Result<ContactList, GatewayError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO contact_lists (id, name, description, source) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .bind(source)
        .execute(&self.pool)
        .await
        .map_err(store_err("contact list insert failed"))?;
        self.get_contact_list(&id).await
    }

    pub async fn get_contact_list(&self, id: &str) -> Result<ContactList, GatewayError> {
        sqlx::query_as("SELECT * FROM contact_lists WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("contact list query failed"))?
            .ok_or_else(|| GatewayError::NotFound(format!("contact list {id}")))
    }

    pub async fn list_contact_lists(&self) -> Result<Vec<ContactList>, GatewayError> {
        sqlx::query_as("SELECT * FROM contact_lists ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("contact list query failed"))
    }

    pub async fn delete_contact_list(&self, id: &str) -> Result<(), GatewayError> {
        sqlx::query("DELETE FROM broadcast_contacts WHERE list_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("contact delete failed"))?;
        let deleted = sqlx::query("DELETE FROM contact_lists WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("contact list delete failed"))?;
        if deleted.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("contact list {id}")));
        }
        Ok(())
    }

    /// Import contacts into a list. Phones are normalized; rows with no
    /// digits are rejected; duplicates within the list are dropped silently.
    pub async fn import_contacts(
        &self,
        list_id: &str,
        contacts: &[ContactInput],
    ) -> Result<ImportSummary, GatewayError> {
        // Existence check up front so a bad list id is a 404, not a FK error.
        self.get_contact_list(list_id).await?;

        let mut summary = ImportSummary {
            imported: 0,
            skipped: 0,
            rejected: 0,
        };

        for contact in contacts {
            let phone = match normalize_phone(&contact.phone) {
                Ok(p) => p,
                Err(_) => {
                    summary.rejected += 1;
                    continue;
                }
            };

            let id = Uuid::new_v4().to_string();
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO broadcast_contacts \
                 (id, list_id, name, phone, email, tier) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(list_id)
            .bind(&contact.name)
            .bind(&phone)
            .bind(&contact.email)
            .bind(&contact.tier)
            .execute(&self.pool)
            .await
            .map_err(store_err("contact insert failed"))?;

            if inserted.rows_affected() == 0 {
                summary.skipped += 1;
            } else {
                summary.imported += 1;
            }
        }

        Ok(summary)
    }

    pub async fn list_contacts(&self, list_id: &str) -> Result<Vec<Contact>, GatewayError> {
        sqlx::query_as(
            "SELECT * FROM broadcast_contacts WHERE list_id = ? ORDER BY created_at, id",
        )
        .bind(list_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("contact list failed"))
    }

    pub async fn get_contact(&self, id: &str) -> Result<Contact, GatewayError> {
        sqlx::query_as("SELECT * FROM broadcast_contacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("contact query failed"))?
            .ok_or_else(|| GatewayError::NotFound(format!("contact {id}")))
    }

    pub async fn update_contact(
        &self,
        id: &str,
        input: &ContactInput,
        is_active: bool,
    ) -> Result<Contact, GatewayError> {
        let phone = normalize_phone(&input.phone)?;
        let updated = sqlx::query(
            "UPDATE broadcast_contacts SET name = ?, phone = ?, email = ?, tier = ?, \
             is_active = ? WHERE id = ?",
        )
        .bind(&input.name)
        .bind(&phone)
        .bind(&input.email)
        .bind(&input.tier)
        .bind(is_active)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("contact update failed"))?;
        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("contact {id}")));
        }
        self.get_contact(id).await
    }

    pub async fn delete_contact(&self, id: &str) -> Result<(), GatewayError> {
        let deleted = sqlx::query("DELETE FROM broadcast_contacts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("contact delete failed"))?;
        if deleted.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("contact {id}")));
        }
        Ok(())
    }
}
