//! Envelope model: BodyItem, RequestData, UserBuffer, FailedRequestLog.
//!
//! Only four BodyItem fields carry meaning for the core (`type`, `userNs`,
//! `url`, `nomeWorkspace`); everything else a producer sends is captured in a
//! flattened map and forwarded verbatim.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};

/// Discriminator value marking the control item that carries `userNs` and the
/// callback `url`.
pub const CONTROL_TYPE: &str = "dados";

/// One element of a producer payload.
///
/// The control item (`type == "dados"`) names the accumulation namespace and
/// the callback URL; every other item is opaque domain data that must survive
/// the round trip unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyItem {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(rename = "userNs", default, skip_serializing_if = "Option::is_none")]
    pub user_ns: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(
        rename = "nomeWorkspace",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub workspace: Option<String>,

    /// Pass-through fields, preserved verbatim on forward.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl BodyItem {
    /// Whether this is the control item.
    pub fn is_control(&self) -> bool {
        self.kind.as_deref() == Some(CONTROL_TYPE)
    }
}

/// Envelope for a producer request.
///
/// Only `body` is semantically significant; headers, params, query, webhook
/// URL and execution mode ride along untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<HashMap<String, String>>,

    #[serde(default)]
    pub body: Vec<BodyItem>,

    #[serde(rename = "webhookUrl", default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    #[serde(
        rename = "executionMode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_mode: Option<String>,
}

/// Accumulated state persisted per `userNs` between debounce flushes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserBuffer {
    #[serde(rename = "userNs")]
    pub user_ns: String,

    /// Callback URL, overwritten on every append (last wins).
    pub url: String,

    /// Appended items in arrival order.
    #[serde(default)]
    pub body: Vec<BodyItem>,
}

/// Durable record written when the flow serializer exhausts its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRequestLog {
    #[serde(rename = "userNs")]
    pub user_ns: String,

    pub request: serde_json::Map<String, Value>,

    #[serde(
        rename = "responseData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub response_data: Option<serde_json::Map<String, Value>>,

    #[serde(rename = "errorMsg")]
    pub error_msg: String,

    pub timestamp: DateTime<Utc>,
}

/// Borrowed view of the control item's routing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRef<'a> {
    pub user_ns: &'a str,
    pub url: &'a str,
}

/// Parses an ingress body into a list of RequestData.
///
/// Three shapes are accepted, tried in order:
/// 1. an array of RequestData (every element must carry a non-empty `body`),
/// 2. a single RequestData with a non-empty `body`,
/// 3. a bare array of BodyItem, wrapped into one RequestData.
///
/// An empty top-level array is accepted and yields no work.
pub fn parse_request_payload(bytes: &[u8]) -> DomainResult<Vec<RequestData>> {
    if let Ok(list) = serde_json::from_slice::<Vec<RequestData>>(bytes) {
        // A bare BodyItem array also decodes as RequestData elements with
        // empty bodies, so only take this shape when every element is real.
        if list.is_empty() || list.iter().all(|rd| !rd.body.is_empty()) {
            return Ok(list);
        }
    }

    if let Ok(single) = serde_json::from_slice::<RequestData>(bytes) {
        if !single.body.is_empty() {
            return Ok(vec![single]);
        }
    }

    if let Ok(items) = serde_json::from_slice::<Vec<BodyItem>>(bytes) {
        if !items.is_empty() {
            return Ok(vec![RequestData {
                body: items,
                ..Default::default()
            }]);
        }
    }

    Err(DomainError::InvalidPayload)
}

/// Extracts the namespace and callback URL from the first control item.
///
/// Later items with `type == "dados"` are ignored; both fields must be
/// present and non-empty.
pub fn extract_control(items: &[BodyItem]) -> DomainResult<ControlRef<'_>> {
    let control = items
        .iter()
        .find(|item| item.is_control())
        .ok_or(DomainError::MissingControlItem)?;

    match (control.user_ns.as_deref(), control.url.as_deref()) {
        (Some(user_ns), Some(url)) if !user_ns.is_empty() && !url.is_empty() => {
            Ok(ControlRef { user_ns, url })
        }
        _ => Err(DomainError::MissingControlItem),
    }
}

/// Moves the first control item to index 0, keeping the relative order of all
/// non-control items (a stable partition). Accumulated buffers hold one
/// control item per submit; the duplicates collapse into the first one.
/// Without any control item the sequence is returned unchanged.
pub fn reorder_control_first(items: &[BodyItem]) -> Vec<BodyItem> {
    let Some(control_idx) = items.iter().position(BodyItem::is_control) else {
        return items.to_vec();
    };

    let mut ordered = Vec::with_capacity(items.len());
    ordered.push(items[control_idx].clone());
    ordered.extend(items.iter().filter(|item| !item.is_control()).cloned());
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn control(user_ns: &str, url: &str) -> BodyItem {
        BodyItem {
            kind: Some(CONTROL_TYPE.to_string()),
            user_ns: Some(user_ns.to_string()),
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    fn item(kind: &str, content: &str) -> BodyItem {
        let mut extra = serde_json::Map::new();
        extra.insert("content".to_string(), json!(content));
        BodyItem {
            kind: Some(kind.to_string()),
            extra,
            ..Default::default()
        }
    }

    #[test]
    fn body_item_preserves_unknown_fields() {
        let raw = json!({
            "type": "x",
            "content": "a",
            "telefone": "+55",
            "nested": {"k": [1, 2, 3]}
        });
        let parsed: BodyItem = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(parsed.extra["telefone"], json!("+55"));
        assert_eq!(parsed.extra["nested"], json!({"k": [1, 2, 3]}));

        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn parse_accepts_request_data_array() {
        let raw = json!([{"body": [{"type": "dados", "userNs": "u1", "url": "http://cb"}]}]);
        let parsed = parse_request_payload(raw.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].body.len(), 1);
    }

    #[test]
    fn parse_accepts_single_request_data() {
        let raw = json!({
            "headers": {"h": "v"},
            "body": [{"type": "dados", "userNs": "u1", "url": "http://cb"}],
            "webhookUrl": "http://hook"
        });
        let parsed = parse_request_payload(raw.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].webhook_url.as_deref(), Some("http://hook"));
    }

    #[test]
    fn parse_accepts_bare_body_item_array() {
        let raw = json!([
            {"type": "dados", "userNs": "u1", "url": "http://cb"},
            {"type": "x", "content": "a"}
        ]);
        let parsed = parse_request_payload(raw.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].body.len(), 2);
        assert!(parsed[0].body[0].is_control());
    }

    #[test]
    fn parse_accepts_empty_array_as_no_work() {
        let parsed = parse_request_payload(b"[]").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn parse_rejects_garbage_and_empty_objects() {
        assert!(matches!(
            parse_request_payload(b"not json"),
            Err(DomainError::InvalidPayload)
        ));
        assert!(matches!(
            parse_request_payload(b"{}"),
            Err(DomainError::InvalidPayload)
        ));
    }

    #[test]
    fn extract_control_first_occurrence_wins() {
        let items = vec![
            item("x", "a"),
            control("first", "http://first"),
            control("second", "http://second"),
        ];
        let control = extract_control(&items).unwrap();
        assert_eq!(control.user_ns, "first");
        assert_eq!(control.url, "http://first");
    }

    #[test]
    fn extract_control_requires_both_fields() {
        let missing_url = vec![BodyItem {
            kind: Some(CONTROL_TYPE.to_string()),
            user_ns: Some("u1".to_string()),
            ..Default::default()
        }];
        assert!(matches!(
            extract_control(&missing_url),
            Err(DomainError::MissingControlItem)
        ));
        assert!(matches!(
            extract_control(&[item("x", "a")]),
            Err(DomainError::MissingControlItem)
        ));
    }

    #[test]
    fn reorder_is_a_stable_partition() {
        let items = vec![
            item("a", "1"),
            item("b", "2"),
            control("u1", "http://cb"),
            item("c", "3"),
        ];
        let ordered = reorder_control_first(&items);
        assert!(ordered[0].is_control());
        assert_eq!(ordered[1], items[0]);
        assert_eq!(ordered[2], items[1]);
        assert_eq!(ordered[3], items[3]);
    }

    #[test]
    fn reorder_without_control_is_identity() {
        let items = vec![item("a", "1"), item("b", "2")];
        assert_eq!(reorder_control_first(&items), items);
    }

    #[test]
    fn reorder_collapses_duplicate_control_items_first_wins() {
        // An accumulated buffer carries one control item per submit; the
        // forwarded payload keeps the first and drops the rest.
        let items = vec![
            item("a", "1"),
            control("u1", "http://cb"),
            item("b", "2"),
            control("u2", "http://other"),
        ];
        let ordered = reorder_control_first(&items);
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].user_ns.as_deref(), Some("u1"));
        assert_eq!(ordered[1].extra["content"], json!("1"));
        assert_eq!(ordered[2].extra["content"], json!("2"));
    }
}
