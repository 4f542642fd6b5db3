//! CRUD endpoints for workflows, templates, contact lists, bankers, and
//! valuation records.

use super::{ok, ApiError, ApiResult};
use crate::gateway::Gateway;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use wagate_core::GatewayError;
use wagate_store::bankers::BankerInput;
use wagate_store::contacts::ContactInput;
use wagate_store::templates::TemplateInput;
use wagate_store::workflows::WorkflowInput;

pub fn routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/toggle", post(toggle_workflow))
        .route("/api/workflows/{id}/executions", get(list_executions))
        .route("/api/templates", get(list_templates).post(create_template))
        .route("/api/templates/categories", get(template_categories))
        .route(
            "/api/templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/api/templates/{id}/duplicate", post(duplicate_template))
        .route("/api/contacts", get(list_contact_lists).post(create_contact_list))
        .route(
            "/api/contacts/{id}",
            get(get_contact_list).delete(delete_contact_list),
        )
        .route("/api/contacts/{id}/import", post(import_contacts))
        .route("/api/broadcast-contacts", get(list_contacts))
        .route(
            "/api/broadcast-contacts/{id}",
            put(update_contact).delete(delete_contact),
        )
        .route("/api/bankers", get(list_bankers).post(create_banker))
        .route("/api/bankers/bank-names", get(bank_names))
        .route(
            "/api/bankers/{id}",
            get(get_banker).put(update_banker).delete(delete_banker),
        )
        .route("/api/bankers/{id}/toggle", post(toggle_banker))
        .route("/api/valuations", get(list_valuations))
        .route(
            "/api/valuations/{id}",
            get(get_valuation).delete(delete_valuation),
        )
}

// --- Workflows ---

#[derive(Deserialize)]
struct WorkflowBody {
    name: String,
    #[serde(default = "default_trigger_type")]
    trigger_type: String,
    #[serde(default)]
    trigger_config: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_trigger_type() -> String {
    "keyword".to_string()
}
fn default_true() -> bool {
    true
}

impl WorkflowBody {
    fn into_input(self) -> Result<WorkflowInput, GatewayError> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Validation("workflow name is required".into()));
        }
        if !matches!(
            self.trigger_type.as_str(),
            "keyword" | "schedule" | "manual" | "webhook"
        ) {
            return Err(GatewayError::Validation(format!(
                "unknown trigger_type '{}'",
                self.trigger_type
            )));
        }
        Ok(WorkflowInput {
            name: self.name,
            trigger_type: self.trigger_type,
            trigger_config: self
                .trigger_config
                .map(|v| v.to_string())
                .unwrap_or_else(|| "{}".to_string()),
            is_active: self.is_active,
        })
    }
}

async fn list_workflows(State(gw): State<Arc<Gateway>>) -> ApiResult {
    Ok(ok(gw.store.list_workflows().await?))
}

async fn create_workflow(
    State(gw): State<Arc<Gateway>>,
    Json(body): Json<WorkflowBody>,
) -> ApiResult {
    let input = body.into_input().map_err(ApiError::from)?;
    Ok(ok(gw.store.create_workflow(&input).await?))
}

async fn get_workflow(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(gw.store.get_workflow(&id).await?))
}

async fn update_workflow(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(body): Json<WorkflowBody>,
) -> ApiResult {
    let input = body.into_input().map_err(ApiError::from)?;
    Ok(ok(gw.store.update_workflow(&id, &input).await?))
}

#[derive(Deserialize)]
struct ToggleBody {
    is_active: bool,
}

async fn toggle_workflow(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> ApiResult {
    Ok(ok(gw.store.toggle_workflow(&id, body.is_active).await?))
}

async fn delete_workflow(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    gw.store.delete_workflow(&id).await?;
    Ok(ok(json!({ "deleted": id })))
}

#[derive(Deserialize)]
struct ExecutionsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_executions(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Query(query): Query<ExecutionsQuery>,
) -> ApiResult {
    let limit = query.limit.clamp(1, 500);
    Ok(ok(gw.store.list_executions(Some(&id), limit).await?))
}

// --- Templates ---

#[derive(Deserialize)]
struct TemplateBody {
    name: String,
    #[serde(default = "default_category")]
    category: String,
    content: String,
    #[serde(default)]
    image_url: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Deserialize)]
struct TemplateQuery {
    category: Option<String>,
}

async fn list_templates(
    State(gw): State<Arc<Gateway>>,
    Query(query): Query<TemplateQuery>,
) -> ApiResult {
    Ok(ok(gw.store.list_templates(query.category.as_deref()).await?))
}

async fn template_categories(State(gw): State<Arc<Gateway>>) -> ApiResult {
    Ok(ok(gw.store.template_categories().await?))
}

async fn create_template(
    State(gw): State<Arc<Gateway>>,
    Json(body): Json<TemplateBody>,
) -> ApiResult {
    let input = TemplateInput {
        name: body.name,
        category: body.category,
        content: body.content,
        image_url: body.image_url,
    };
    Ok(ok(gw.store.create_template(&input).await?))
}

async fn get_template(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(gw.store.get_template(&id).await?))
}

async fn update_template(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(body): Json<TemplateBody>,
) -> ApiResult {
    let input = TemplateInput {
        name: body.name,
        category: body.category,
        content: body.content,
        image_url: body.image_url,
    };
    Ok(ok(gw.store.update_template(&id, &input).await?))
}

#[derive(Deserialize)]
struct DuplicateBody {
    new_name: String,
}

async fn duplicate_template(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(body): Json<DuplicateBody>,
) -> ApiResult {
    Ok(ok(gw.store.duplicate_template(&id, &body.new_name).await?))
}

async fn delete_template(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    gw.store.delete_template(&id).await?;
    Ok(ok(json!({ "deleted": id })))
}

// --- Contact lists & contacts ---

#[derive(Deserialize)]
struct ContactListBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_source")]
    source: String,
}

fn default_source() -> String {
    "manual".to_string()
}

async fn list_contact_lists(State(gw): State<Arc<Gateway>>) -> ApiResult {
    Ok(ok(gw.store.list_contact_lists().await?))
}

async fn create_contact_list(
    State(gw): State<Arc<Gateway>>,
    Json(body): Json<ContactListBody>,
) -> ApiResult {
    if body.name.trim().is_empty() {
        return Err(GatewayError::Validation("list name is required".into()).into());
    }
    Ok(ok(gw
        .store
        .create_contact_list(&body.name, &body.description, &body.source)
        .await?))
}

async fn get_contact_list(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    let list = gw.store.get_contact_list(&id).await?;
    let contacts = gw.store.list_contacts(&id).await?;
    Ok(ok(json!({ "list": list, "contacts": contacts })))
}

async fn delete_contact_list(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    gw.store.delete_contact_list(&id).await?;
    Ok(ok(json!({ "deleted": id })))
}

#[derive(Deserialize)]
struct ImportBody {
    contacts: Vec<ImportContact>,
}

#[derive(Deserialize)]
struct ImportContact {
    #[serde(default)]
    name: String,
    phone: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    tier: Option<String>,
}

async fn import_contacts(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(body): Json<ImportBody>,
) -> ApiResult {
    let rows: Vec<ContactInput> = body
        .contacts
        .into_iter()
        .map(|c| ContactInput {
            name: c.name,
            phone: c.phone,
            email: c.email,
            tier: c.tier,
        })
        .collect();
    Ok(ok(gw.store.import_contacts(&id, &rows).await?))
}

#[derive(Deserialize)]
struct ContactsQuery {
    list_id: String,
}

async fn list_contacts(
    State(gw): State<Arc<Gateway>>,
    Query(query): Query<ContactsQuery>,
) -> ApiResult {
    Ok(ok(gw.store.list_contacts(&query.list_id).await?))
}

#[derive(Deserialize)]
struct ContactBody {
    name: String,
    phone: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default = "default_true")]
    is_active: bool,
}

async fn update_contact(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(body): Json<ContactBody>,
) -> ApiResult {
    let input = ContactInput {
        name: body.name,
        phone: body.phone,
        email: body.email,
        tier: body.tier,
    };
    Ok(ok(gw.store.update_contact(&id, &input, body.is_active).await?))
}

async fn delete_contact(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    gw.store.delete_contact(&id).await?;
    Ok(ok(json!({ "deleted": id })))
}

// --- Bankers ---

#[derive(Deserialize)]
struct BankerBody {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    agent_number: String,
    bank_name: String,
    whatsapp_group_id: String,
    #[serde(default)]
    routing_keywords: Vec<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default = "default_true")]
    is_active: bool,
}

impl BankerBody {
    fn into_input(self) -> BankerInput {
        let display_name = self.display_name.unwrap_or_else(|| self.name.clone());
        BankerInput {
            name: self.name,
            display_name,
            agent_number: self.agent_number,
            bank_name: self.bank_name,
            whatsapp_group_id: self.whatsapp_group_id,
            routing_keywords: self.routing_keywords,
            priority: self.priority,
            is_active: self.is_active,
        }
    }
}

#[derive(Deserialize)]
struct BankersQuery {
    #[serde(default)]
    active_only: bool,
}

async fn list_bankers(
    State(gw): State<Arc<Gateway>>,
    Query(query): Query<BankersQuery>,
) -> ApiResult {
    Ok(ok(gw.store.list_bankers(query.active_only).await?))
}

async fn bank_names(State(gw): State<Arc<Gateway>>) -> ApiResult {
    Ok(ok(gw.store.bank_names().await?))
}

async fn create_banker(
    State(gw): State<Arc<Gateway>>,
    Json(body): Json<BankerBody>,
) -> ApiResult {
    Ok(ok(gw.store.create_banker(&body.into_input()).await?))
}

async fn get_banker(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(gw.store.get_banker(&id).await?))
}

async fn update_banker(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(body): Json<BankerBody>,
) -> ApiResult {
    Ok(ok(gw.store.update_banker(&id, &body.into_input()).await?))
}

async fn toggle_banker(
    State(gw): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> ApiResult {
    Ok(ok(gw.store.toggle_banker(&id, body.is_active).await?))
}

async fn delete_banker(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    gw.store.delete_banker(&id).await?;
    Ok(ok(json!({ "deleted": id })))
}

// --- Valuations ---

#[derive(Deserialize)]
struct ValuationsQuery {
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn list_valuations(
    State(gw): State<Arc<Gateway>>,
    Query(query): Query<ValuationsQuery>,
) -> ApiResult {
    let limit = query.limit.clamp(1, 500);
    Ok(ok(gw
        .store
        .list_valuations(query.status.as_deref(), limit)
        .await?))
}

async fn get_valuation(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(gw.store.get_valuation(&id).await?))
}

async fn delete_valuation(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    gw.store.delete_valuation(&id).await?;
    Ok(ok(json!({ "deleted": id })))
}
