//! Valuation request and reply workflows.
//!
//! A request is parsed from labeled lines, routed to a banker group, and
//! acknowledged; the banker's quoted reply is joined back to the request
//! row through the forwarded message id and relayed to the requester and
//! the listing agent.

use super::{Handler, HandlerCtx, HandlerPayload};
use crate::gateway::sendq::SendRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::info;
use wagate_core::message::SendPriority;
use wagate_core::GatewayError;
use wagate_store::contacts::normalize_phone;
use wagate_store::valuations::NewValuation;

const SCHEMA_HINT: &str = "Sorry, I couldn't read that valuation request. Please send it as:\n\n\
Valuation Request:\n\n\
Address: <property address>\n\
Size: <size>\n\
Asking: <asking price>\n\
Salesperson Name: <name>\n\
Agent Number: <mobile>\n\
Banker Name: <banker>";

/// Split a message body into `label: value` pairs.
///
/// Labels match case-insensitively; the value is everything after the
/// first `:` on the line. The first occurrence of a label wins.
fn parse_labeled_fields(body: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in body.lines() {
        if let Some((label, value)) = line.split_once(':') {
            let key = label.trim().to_lowercase();
            if !key.is_empty() {
                fields.entry(key).or_insert_with(|| value.trim().to_string());
            }
        }
    }
    fields
}

fn field<'a>(fields: &'a HashMap<String, String>, key: &str) -> &'a str {
    fields.get(key).map(String::as_str).unwrap_or("")
}

/// Handles `valuation_request` messages.
pub struct ValuationRequestHandler;

#[async_trait]
impl Handler for ValuationRequestHandler {
    async fn handle(
        &self,
        ctx: &HandlerCtx,
        payload: &HandlerPayload,
    ) -> Result<(), GatewayError> {
        let msg = &payload.msg;
        let fields = parse_labeled_fields(&msg.body);

        let address = field(&fields, "address");
        let banker_name_requested = field(&fields, "banker name");

        if address.is_empty() || banker_name_requested.is_empty() {
            ctx.sendq
                .send(SendRequest::text(
                    &msg.chat_id,
                    SCHEMA_HINT,
                    SendPriority::High,
                ))
                .await?;
            return Err(GatewayError::Validation(
                "valuation request missing address or banker name".into(),
            ));
        }

        let size = field(&fields, "size");
        let asking = field(&fields, "asking");
        let salesperson = field(&fields, "salesperson name");
        let agent_number_raw = field(&fields, "agent number");

        let (agent_phone, agent_whatsapp_id) = match normalize_phone(agent_number_raw) {
            Ok(phone) => {
                let wid = format!("{phone}@c.us");
                (phone, wid)
            }
            Err(_) => (String::new(), String::new()),
        };

        let Some(banker) = ctx.store.route_banker(&msg.body).await? else {
            ctx.sendq
                .send(SendRequest::text(
                    &msg.chat_id,
                    format!(
                        "No banker matched \"{banker_name_requested}\". \
                         Please check the banker name and try again."
                    ),
                    SendPriority::High,
                ))
                .await?;
            return Err(GatewayError::Validation(format!(
                "no banker matched '{banker_name_requested}'"
            )));
        };

        let row = ctx
            .store
            .create_valuation(&NewValuation {
                requester_group_id: msg.chat_id.clone(),
                request_message_id: msg.wa_message_id.clone(),
                address: address.to_string(),
                size: size.to_string(),
                asking: asking.to_string(),
                salesperson_name: salesperson.to_string(),
                agent_number_raw: agent_number_raw.to_string(),
                agent_phone_e164: agent_phone,
                agent_whatsapp_id,
                banker_name_requested: banker_name_requested.to_string(),
                banker_id: banker.id.clone(),
                banker_name: banker.name.clone(),
                target_group_id: banker.whatsapp_group_id.clone(),
            })
            .await?;

        // Forward to the banker group. The forward id must be persisted
        // before the acknowledgment goes out: the banker's quoted reply
        // joins on it.
        let forward_body = format!(
            "Valuation Request:\n\nAddress: {address}\nSize: {size}\nAsking: {asking}"
        );
        let forward = ctx
            .sendq
            .send(SendRequest::text(
                &banker.whatsapp_group_id,
                forward_body,
                SendPriority::High,
            ))
            .await?;
        ctx.store
            .mark_valuation_forwarded(&row.id, &forward.message_id)
            .await?;

        info!(
            "valuation {} forwarded to {} as {}",
            row.id, banker.name, forward.message_id
        );

        let ack = ctx
            .sendq
            .send(SendRequest::text(
                &msg.chat_id,
                format!(
                    "Thanks! We've forwarded your request to {}.\nWe'll let you know when they replied.",
                    banker.name
                ),
                SendPriority::Normal,
            ))
            .await?;
        ctx.store
            .set_valuation_acknowledgment(&row.id, &ack.message_id)
            .await?;

        Ok(())
    }
}

/// Handles banker replies quoting a forwarded request.
pub struct ValuationReplyHandler;

#[async_trait]
impl Handler for ValuationReplyHandler {
    async fn handle(
        &self,
        ctx: &HandlerCtx,
        payload: &HandlerPayload,
    ) -> Result<(), GatewayError> {
        let msg = &payload.msg;
        let quoted_id = msg.quoted_id.as_deref().ok_or_else(|| {
            GatewayError::Validation("valuation reply without a quoted message".into())
        })?;

        let Some(row) = ctx
            .store
            .find_valuation_by_forward(quoted_id, &msg.chat_id)
            .await?
        else {
            return Err(GatewayError::NotFound(format!(
                "no valuation forward {quoted_id} in {}",
                msg.chat_id
            )));
        };

        ctx.store
            .record_banker_reply(&row.id, &msg.wa_message_id, &msg.body)
            .await?;

        let bank_name = match ctx.store.get_banker(&row.banker_id).await {
            Ok(banker) => banker.bank_name,
            Err(_) => String::new(),
        };

        let detail = format!(
            "Address: {}\nSize: {}\nAsking: {}\nValuation: {}",
            row.address, row.size, row.asking, msg.body
        );

        // Relay to the requester group and notify the agent privately.
        // The two sends are independent: a failure of one does not roll
        // back the other, and every id that succeeded is persisted.
        let final_reply = ctx
            .sendq
            .send(SendRequest::text(
                &row.requester_group_id,
                format!("From Banker: {bank_name} - {}\n\n{detail}", row.banker_name),
                SendPriority::High,
            ))
            .await;
        let final_ok = match final_reply {
            Ok(receipt) => {
                ctx.store
                    .set_valuation_final_reply(&row.id, &receipt.message_id)
                    .await?;
                true
            }
            Err(_) => false,
        };

        let agent_ok = if row.agent_whatsapp_id.is_empty() {
            false
        } else {
            match ctx
                .sendq
                .send(SendRequest::text(
                    &row.agent_whatsapp_id,
                    detail.clone(),
                    SendPriority::High,
                ))
                .await
            {
                Ok(receipt) => {
                    ctx.store
                        .set_valuation_agent_notification(&row.id, &receipt.message_id)
                        .await?;
                    true
                }
                Err(_) => false,
            }
        };

        if final_ok && agent_ok {
            ctx.store.mark_valuation_completed(&row.id).await?;
            info!("valuation {} completed", row.id);
            Ok(())
        } else {
            Err(GatewayError::TerminalClient(format!(
                "valuation {} relay incomplete (requester: {final_ok}, agent: {agent_ok})",
                row.id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::gateway::sendq::tests_support::ready_queue_parts;
    use chrono::Utc;
    use std::sync::Arc;
    use wagate_core::classify::Classification;
    use wagate_core::clock::SystemClock;
    use wagate_core::message::InboundMessage;
    use wagate_store::bankers::BankerInput;
    use wagate_store::Store;

    const REQUEST_BODY: &str = "Valuation Request:\n\n\
Address: Blk 123 Ang Mo Kio Ave 4\n\
Size: 1200 sqft\n\
Asking: $500,000\n\
Salesperson Name: John Tan\n\
Agent Number: 91234567\n\
Banker Name: Yvonne";

    async fn ctx_with_banker() -> (
        HandlerCtx,
        Arc<crate::gateway::sendq::tests_support::AlwaysOkClient>,
    ) {
        let store = Store::in_memory().await.unwrap();
        store
            .create_banker(&BankerInput {
                name: "Yvonne".into(),
                display_name: "Yvonne".into(),
                agent_number: "AG001".into(),
                bank_name: "Premas".into(),
                whatsapp_group_id: "gY@g.us".into(),
                routing_keywords: vec!["yvonne".into(), "premas".into()],
                priority: 10,
                is_active: true,
            })
            .await
            .unwrap();

        let (sendq, client, _clock) = ready_queue_parts();
        (
            HandlerCtx {
                sendq,
                store,
                bus: EventBus::new(16),
                clock: Arc::new(SystemClock),
            },
            client,
        )
    }

    fn request_msg() -> InboundMessage {
        InboundMessage {
            wa_message_id: "m1".into(),
            chat_id: "R@g.us".into(),
            sender_id: "6590000000".into(),
            body: REQUEST_BODY.into(),
            timestamp: Utc::now(),
            quoted_id: None,
            quoted_body: None,
        }
    }

    #[test]
    fn parses_labeled_fields_case_insensitively() {
        let fields = parse_labeled_fields("ADDRESS: 1 Main St\nbanker name: Yvonne\nAsking: $1");
        assert_eq!(field(&fields, "address"), "1 Main St");
        assert_eq!(field(&fields, "banker name"), "Yvonne");
        assert_eq!(field(&fields, "asking"), "$1");
        assert_eq!(field(&fields, "size"), "");
    }

    #[test]
    fn first_occurrence_of_a_label_wins() {
        let fields = parse_labeled_fields("Address: first\nAddress: second");
        assert_eq!(field(&fields, "address"), "first");
    }

    #[tokio::test]
    async fn happy_path_forwards_and_acknowledges() {
        let (ctx, client) = ctx_with_banker().await;
        let payload = HandlerPayload {
            msg: request_msg(),
            classification: Classification::ValuationRequest,
        };

        ValuationRequestHandler.handle(&ctx, &payload).await.unwrap();

        let sent = client.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "gY@g.us");
        assert_eq!(
            sent[0].1,
            "Valuation Request:\n\nAddress: Blk 123 Ang Mo Kio Ave 4\nSize: 1200 sqft\nAsking: $500,000"
        );
        assert_eq!(sent[1].0, "R@g.us");
        assert_eq!(
            sent[1].1,
            "Thanks! We've forwarded your request to Yvonne.\nWe'll let you know when they replied."
        );

        let rows = ctx.store.list_valuations(None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.status, "forwarded");
        assert_eq!(row.forward_message_id.as_deref(), Some("sent-1"));
        assert_eq!(row.agent_whatsapp_id, "6591234567@c.us");
        assert_eq!(row.agent_phone_e164, "6591234567");
        assert!(row.acknowledgment_message_id.is_some());
    }

    #[tokio::test]
    async fn missing_mandatory_fields_sends_schema_hint() {
        let (ctx, client) = ctx_with_banker().await;
        let mut msg = request_msg();
        msg.body = "Valuation Request:\n\nSize: 1200 sqft".into();

        let err = ValuationRequestHandler
            .handle(
                &ctx,
                &HandlerPayload {
                    msg,
                    classification: Classification::ValuationRequest,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let sent = client.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "R@g.us");
        assert!(sent[0].1.contains("Address:"));
        assert!(ctx.store.list_valuations(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmatched_banker_sends_notice_and_fails() {
        let (ctx, client) = ctx_with_banker().await;
        let mut msg = request_msg();
        msg.body = "Valuation Request:\n\nAddress: 1 Main St\nBanker Name: Nobody".into();

        let err = ValuationRequestHandler
            .handle(
                &ctx,
                &HandlerPayload {
                    msg,
                    classification: Classification::ValuationRequest,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        let sent = client.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("No banker matched"));
    }

    #[tokio::test]
    async fn banker_reply_relays_and_completes() {
        let (ctx, client) = ctx_with_banker().await;

        // Seed the forwarded request.
        ValuationRequestHandler
            .handle(
                &ctx,
                &HandlerPayload {
                    msg: request_msg(),
                    classification: Classification::ValuationRequest,
                },
            )
            .await
            .unwrap();

        let reply = InboundMessage {
            wa_message_id: "m3".into(),
            chat_id: "gY@g.us".into(),
            sender_id: "6598887777".into(),
            body: "Estimated valuation $480,000 to $520,000. - Yvonne (AG001)".into(),
            timestamp: Utc::now(),
            quoted_id: Some("sent-1".into()),
            quoted_body: Some("Valuation Request:".into()),
        };
        ValuationReplyHandler
            .handle(
                &ctx,
                &HandlerPayload {
                    msg: reply,
                    classification: Classification::ValuationReply,
                },
            )
            .await
            .unwrap();

        let sent = client.sent.lock().unwrap().clone();
        // forward, ack, final reply, agent notification
        assert_eq!(sent.len(), 4);

        assert_eq!(sent[2].0, "R@g.us");
        assert!(sent[2].1.starts_with("From Banker: Premas - Yvonne\n\n"));
        assert!(sent[2]
            .1
            .contains("Valuation: Estimated valuation $480,000 to $520,000."));

        assert_eq!(sent[3].0, "6591234567@c.us");
        assert!(!sent[3].1.starts_with("From Banker"));
        assert!(sent[3].1.starts_with("Address: Blk 123 Ang Mo Kio Ave 4\n"));

        let row = &ctx.store.list_valuations(None, 10).await.unwrap()[0];
        assert_eq!(row.status, "completed");
        assert_eq!(row.banker_reply_message_id.as_deref(), Some("m3"));
        assert!(row.final_reply_message_id.is_some());
        assert!(row.agent_notification_message_id.is_some());
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn reply_quoting_unknown_forward_is_not_found() {
        let (ctx, _client) = ctx_with_banker().await;
        let reply = InboundMessage {
            wa_message_id: "m3".into(),
            chat_id: "gY@g.us".into(),
            sender_id: "6598887777".into(),
            body: "$500k".into(),
            timestamp: Utc::now(),
            quoted_id: Some("never-forwarded".into()),
            quoted_body: None,
        };
        let err = ValuationReplyHandler
            .handle(
                &ctx,
                &HandlerPayload {
                    msg: reply,
                    classification: Classification::ValuationReply,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
