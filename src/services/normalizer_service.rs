//! Flattens WhatsApp Cloud API webhook payloads into [`InboundEvent`]s.
//!
//! Payloads arrive as `entry[] -> changes[] -> value -> messages[] | statuses[]`.
//! Every level is parsed on its own so a malformed item is recorded as
//! skipped instead of failing the whole delivery.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ChangeContact, ChangeEvent, ChangeMetadata, DeliveryStatus, EventType, InboundEvent,
    MessageContent, NormalizationSkipped, NormalizedBatch, Provider, WaMessage, WaStatus,
    WebhookChange, WebhookEntry, WebhookEnvelope,
};

pub const WHATSAPP_OBJECT: &str = "whatsapp_business_account";

/// Failure of the envelope itself; individual entries never produce this
#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("payload is not a webhook envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unsupported webhook object `{0}`")]
    UnsupportedObject(String),
}

/// Collect the business account ids referenced by a payload so the caller
/// can resolve them to workspaces before normalizing.
pub fn collect_account_ids(payload: &Value) -> HashSet<String> {
    let mut ids = HashSet::new();
    let Some(entries) = payload.get("entry").and_then(Value::as_array) else {
        return ids;
    };
    for entry in entries {
        let Some(changes) = entry.get("changes").and_then(Value::as_array) else {
            continue;
        };
        for change in changes {
            if let Some(id) = change
                .pointer("/value/metadata/phone_number_id")
                .and_then(Value::as_str)
            {
                ids.insert(id.to_string());
            }
        }
    }
    ids
}

/// Normalize a webhook payload.
///
/// `resolve_workspace` maps a business account id to its workspace; changes for
/// unknown accounts are skipped. Events are deduplicated by external message id
/// within the request.
pub fn normalize<F>(payload: &Value, resolve_workspace: F) -> Result<NormalizedBatch, NormalizationError>
where
    F: Fn(&str) -> Option<Uuid>,
{
    let envelope: WebhookEnvelope = serde_json::from_value(payload.clone())
        .map_err(|e| NormalizationError::InvalidEnvelope(e.to_string()))?;

    if envelope.object != WHATSAPP_OBJECT {
        return Err(NormalizationError::UnsupportedObject(envelope.object));
    }

    let mut batch = NormalizedBatch::default();
    let mut seen: HashSet<String> = HashSet::new();

    for (entry_idx, raw_entry) in envelope.entry.into_iter().enumerate() {
        let location = format!("entry[{entry_idx}]");
        let entry: WebhookEntry = match serde_json::from_value(raw_entry) {
            Ok(entry) => entry,
            Err(e) => {
                skip(&mut batch, location, e.to_string());
                continue;
            }
        };

        for (change_idx, raw_change) in entry.changes.into_iter().enumerate() {
            let location = format!("{location}.changes[{change_idx}]");
            let change: WebhookChange = match serde_json::from_value(raw_change) {
                Ok(change) => change,
                Err(e) => {
                    skip(&mut batch, location, e.to_string());
                    continue;
                }
            };

            if let Some(field) = change.field.as_deref() {
                if field != "messages" {
                    skip(&mut batch, location, format!("unsupported field `{field}`"));
                    continue;
                }
            }

            normalize_change_value(&change.value, &location, &resolve_workspace, &mut seen, &mut batch);
        }
    }

    Ok(batch)
}

fn normalize_change_value<F>(
    value: &Value,
    location: &str,
    resolve_workspace: &F,
    seen: &mut HashSet<String>,
    batch: &mut NormalizedBatch,
) where
    F: Fn(&str) -> Option<Uuid>,
{
    let metadata: ChangeMetadata = match value
        .get("metadata")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(metadata)) => metadata,
        Some(Err(e)) => {
            skip(batch, location.to_string(), format!("invalid metadata: {e}"));
            return;
        }
        None => {
            skip(batch, location.to_string(), "missing metadata".to_string());
            return;
        }
    };

    let Some(workspace_id) = resolve_workspace(&metadata.phone_number_id) else {
        skip(
            batch,
            location.to_string(),
            format!("unknown account `{}`", metadata.phone_number_id),
        );
        return;
    };

    let contact_names: HashMap<String, String> = value
        .get("contacts")
        .and_then(Value::as_array)
        .map(|contacts| {
            contacts
                .iter()
                .filter_map(|c| serde_json::from_value::<ChangeContact>(c.clone()).ok())
                .filter_map(|c| c.profile.and_then(|p| p.name).map(|name| (c.wa_id, name)))
                .collect()
        })
        .unwrap_or_default();

    let items = classify_items(value, location);

    for (item_location, item, raw) in items {
        let event = match item {
            Ok(ChangeEvent::Message(message)) => {
                message_event(message, raw, workspace_id, &metadata.phone_number_id, &contact_names)
            }
            Ok(ChangeEvent::Status(status)) => {
                status_event(status, raw, workspace_id, &metadata.phone_number_id)
            }
            Ok(ChangeEvent::Unrecognized(kind)) => Err(format!("unrecognized item `{kind}`")),
            Err(e) => Err(e),
        };

        match event {
            Ok(event) => {
                if seen.insert(event.external_message_id.clone()) {
                    batch.events.push(event);
                } else {
                    batch.duplicates += 1;
                }
            }
            Err(reason) => skip(batch, item_location, reason),
        }
    }
}

type ClassifiedItem = (String, Result<ChangeEvent, String>, Value);

fn classify_items(value: &Value, location: &str) -> Vec<ClassifiedItem> {
    let mut items = Vec::new();

    if let Some(messages) = value.get("messages").and_then(Value::as_array) {
        for (idx, raw) in messages.iter().enumerate() {
            let parsed = serde_json::from_value::<WaMessage>(raw.clone())
                .map(ChangeEvent::Message)
                .map_err(|e| e.to_string());
            items.push((format!("{location}.messages[{idx}]"), parsed, raw.clone()));
        }
    }

    if let Some(statuses) = value.get("statuses").and_then(Value::as_array) {
        for (idx, raw) in statuses.iter().enumerate() {
            let parsed = serde_json::from_value::<WaStatus>(raw.clone())
                .map(ChangeEvent::Status)
                .map_err(|e| e.to_string());
            items.push((format!("{location}.statuses[{idx}]"), parsed, raw.clone()));
        }
    }

    if let Some(errors) = value.get("errors").and_then(Value::as_array) {
        for (idx, raw) in errors.iter().enumerate() {
            items.push((
                format!("{location}.errors[{idx}]"),
                Ok(ChangeEvent::Unrecognized("error".to_string())),
                raw.clone(),
            ));
        }
    }

    items
}

fn message_event(
    message: WaMessage,
    raw: Value,
    workspace_id: Uuid,
    account_id: &str,
    contact_names: &HashMap<String, String>,
) -> Result<InboundEvent, String> {
    let timestamp = parse_unix_timestamp(&message.timestamp)?;
    if message.id.trim().is_empty() || message.from.trim().is_empty() {
        return Err("message without id or sender".to_string());
    }

    let (event_type, text, postback_payload) = match MessageContent::from(&message) {
        MessageContent::Text(body) => (EventType::Message, Some(body), None),
        MessageContent::Button { payload, text } => (EventType::Postback, text, payload),
        MessageContent::InteractiveReply { id, title } => (EventType::Postback, title, Some(id)),
        MessageContent::Media { kind, caption } => (
            EventType::Message,
            Some(caption.unwrap_or_else(|| format!("[{kind}]"))),
            None,
        ),
        MessageContent::Unrecognized(kind) => {
            return Err(format!("unsupported message type `{kind}`"));
        }
    };

    Ok(InboundEvent {
        provider: Provider::WhatsappCloud,
        workspace_id,
        thread_id: message.from.clone(),
        account_id: account_id.to_string(),
        external_message_id: message.id,
        sender_name: contact_names.get(&message.from).cloned(),
        sender_id: message.from,
        timestamp,
        event_type,
        text,
        postback_payload,
        delivery_status: None,
        raw_payload: raw,
    })
}

fn status_event(
    status: WaStatus,
    raw: Value,
    workspace_id: Uuid,
    account_id: &str,
) -> Result<InboundEvent, String> {
    let timestamp = parse_unix_timestamp(&status.timestamp)?;
    let delivery_status = DeliveryStatus::parse(&status.status)
        .ok_or_else(|| format!("unknown delivery status `{}`", status.status))?;

    Ok(InboundEvent {
        provider: Provider::WhatsappCloud,
        workspace_id,
        thread_id: status.recipient_id.clone(),
        account_id: account_id.to_string(),
        external_message_id: format!("{}:{}", status.id, delivery_status),
        sender_id: account_id.to_string(),
        sender_name: None,
        timestamp,
        event_type: EventType::Status,
        text: None,
        postback_payload: None,
        delivery_status: Some(delivery_status),
        raw_payload: raw,
    })
}

/// WhatsApp timestamps are unix seconds encoded as strings
pub fn parse_unix_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let secs: i64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid timestamp `{raw}`"))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| format!("timestamp out of range `{raw}`"))
}

fn skip(batch: &mut NormalizedBatch, location: String, reason: String) {
    tracing::debug!(%location, %reason, "Skipping webhook item");
    batch.skipped.push(NormalizationSkipped { location, reason });
}
