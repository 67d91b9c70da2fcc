//! Defensive normalization of raw claim payloads.
//!
//! Claim payloads differ by claim `type`. The resource reference is resolved
//! with this precedence:
//!
//! 1. top-level `resource_id`, with `resource` as a string kind (`Flat`)
//! 2. `resource.id` when `resource` is an object (`Nested`), kind taken from
//!    `resource.type` or `resource.name`
//! 3. nothing resolvable (`Missing`)
//!
//! The claim id itself is `id`, falling back to `claim_id`. Absent or
//! unparseable dates become `None`.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A claim payload exactly as returned by the marketplace.
pub type RawClaim = Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Order,
    Shipment,
    Payment,
    Purchase,
    Other(String),
}

impl ResourceKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "order" => Self::Order,
            "shipment" => Self::Shipment,
            "payment" => Self::Payment,
            "purchase" => Self::Purchase,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Order => "order",
            Self::Shipment => "shipment",
            Self::Payment => "payment",
            Self::Purchase => "purchase",
            Self::Other(kind) => kind,
        }
    }
}

/// Resolved resource reference, tagged by where the id was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Flat {
        kind: Option<ResourceKind>,
        id: String,
    },
    Nested {
        kind: Option<ResourceKind>,
        id: String,
    },
    Missing {
        kind: Option<ResourceKind>,
    },
}

impl ResourceRef {
    pub fn from_payload(raw: &Value) -> Self {
        let resource = raw.get("resource");

        if let Some(id) = raw.get("resource_id").and_then(id_string) {
            let kind = resource
                .and_then(|r| match r {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(_) => nested_kind(r),
                    _ => None,
                })
                .map(ResourceKind::parse);
            return Self::Flat { kind, id };
        }

        match resource {
            Some(obj @ Value::Object(_)) => {
                let kind = nested_kind(obj).map(ResourceKind::parse);
                match obj.get("id").and_then(id_string) {
                    Some(id) => Self::Nested { kind, id },
                    None => Self::Missing { kind },
                }
            }
            Some(Value::String(s)) => Self::Missing {
                kind: Some(ResourceKind::parse(s)),
            },
            _ => Self::Missing { kind: None },
        }
    }

    pub fn kind(&self) -> Option<&ResourceKind> {
        match self {
            Self::Flat { kind, .. } | Self::Nested { kind, .. } | Self::Missing { kind } => {
                kind.as_ref()
            }
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Flat { id, .. } | Self::Nested { id, .. } => Some(id),
            Self::Missing { .. } => None,
        }
    }

    /// Order id, only when the resource is an order.
    pub fn order_id(&self) -> Option<&str> {
        match self.kind() {
            Some(ResourceKind::Order) => self.id(),
            _ => None,
        }
    }
}

fn nested_kind(obj: &Value) -> Option<&str> {
    obj.get("type")
        .or_else(|| obj.get("name"))
        .and_then(Value::as_str)
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("claim payload has no usable id")]
    MissingId,
}

/// Normalized view of a claim, stored next to the untouched payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedClaim {
    pub claim_id: String,
    pub status: Option<String>,
    pub stage: Option<String>,
    pub claim_type: Option<String>,
    pub resource: ResourceRef,
    pub reason_id: Option<String>,
    pub date_created: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub date_closed: Option<DateTime<Utc>>,
}

impl NormalizedClaim {
    pub fn from_payload(raw: &RawClaim) -> Result<Self, NormalizeError> {
        let claim_id = raw
            .get("id")
            .and_then(id_string)
            .or_else(|| raw.get("claim_id").and_then(id_string))
            .ok_or(NormalizeError::MissingId)?;

        let date_closed = date_field(raw, "date_closed").or_else(|| {
            raw.get("resolution")
                .and_then(|r| date_field(r, "date_created"))
        });

        Ok(Self {
            claim_id,
            status: text_field(raw, "status"),
            stage: text_field(raw, "stage"),
            claim_type: text_field(raw, "type"),
            resource: ResourceRef::from_payload(raw),
            reason_id: raw.get("reason_id").and_then(id_string),
            date_created: date_field(raw, "date_created"),
            last_updated: date_field(raw, "last_updated"),
            date_closed,
        })
    }
}

/// Creation timestamp of a raw claim, used for cutoff filtering.
pub fn claim_created_at(raw: &RawClaim) -> Option<DateTime<Utc>> {
    date_field(raw, "date_created")
}

/// Marketplace ids arrive as JSON numbers or strings.
pub fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn date_field(raw: &Value, key: &str) -> Option<DateTime<Utc>> {
    raw.get(key).and_then(Value::as_str).and_then(parse_timestamp)
}

/// RFC 3339, plus the `-0400` offset form some endpoints emit.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn mediation_with_flat_order_resource() {
        let raw = json!({
            "id": 5012345678_u64,
            "type": "mediations",
            "stage": "claim",
            "status": "opened",
            "resource": "order",
            "resource_id": 2000003508419013_u64,
            "reason_id": "PDD9939",
            "date_created": "2024-03-10T12:00:00.000-04:00",
            "last_updated": "2024-03-11T08:30:00.000-04:00"
        });
        let claim = NormalizedClaim::from_payload(&raw).unwrap();
        assert_eq!(claim.claim_id, "5012345678");
        assert_eq!(claim.claim_type.as_deref(), Some("mediations"));
        assert_eq!(claim.resource.order_id(), Some("2000003508419013"));
        assert_eq!(claim.reason_id.as_deref(), Some("PDD9939"));
        assert_eq!(
            claim.date_created,
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 16, 0, 0).unwrap())
        );
        assert!(claim.date_closed.is_none());
    }

    #[test]
    fn return_on_shipment_has_no_order_id() {
        let raw = json!({
            "id": "777",
            "type": "returns",
            "resource": "shipment",
            "resource_id": "41234",
            "date_created": "2024-03-10T12:00:00Z"
        });
        let claim = NormalizedClaim::from_payload(&raw).unwrap();
        assert_eq!(claim.resource.id(), Some("41234"));
        assert_eq!(claim.resource.kind(), Some(&ResourceKind::Shipment));
        assert_eq!(claim.resource.order_id(), None);
    }

    #[test]
    fn nested_resource_object_is_used_without_resource_id() {
        let raw = json!({
            "id": 9,
            "type": "cancel_purchase",
            "resource": { "type": "order", "id": 123 },
            "date_created": "2024-03-10T12:00:00.000-0400"
        });
        let claim = NormalizedClaim::from_payload(&raw).unwrap();
        assert!(matches!(claim.resource, ResourceRef::Nested { .. }));
        assert_eq!(claim.resource.order_id(), Some("123"));
        assert_eq!(
            claim.date_created,
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 16, 0, 0).unwrap())
        );
    }

    #[test]
    fn resource_id_takes_precedence_over_nested_id() {
        let raw = json!({
            "id": 10,
            "type": "fulfillment",
            "resource_id": 55,
            "resource": { "name": "order", "id": 66 }
        });
        let claim = NormalizedClaim::from_payload(&raw).unwrap();
        assert!(matches!(claim.resource, ResourceRef::Flat { .. }));
        assert_eq!(claim.resource.order_id(), Some("55"));
    }

    #[test]
    fn closed_claim_takes_resolution_date() {
        let raw = json!({
            "id": 11,
            "type": "ml_case",
            "status": "closed",
            "resource": "payment",
            "resource_id": 8,
            "resolution": { "reason": "refunded", "date_created": "2024-04-01T00:00:00Z" }
        });
        let claim = NormalizedClaim::from_payload(&raw).unwrap();
        assert_eq!(
            claim.date_closed,
            Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(claim.resource.order_id(), None);
    }

    #[test]
    fn missing_fields_become_none() {
        let raw = json!({ "claim_id": "12", "type": "change", "date_created": "not a date" });
        let claim = NormalizedClaim::from_payload(&raw).unwrap();
        assert_eq!(claim.claim_id, "12");
        assert_eq!(claim.resource, ResourceRef::Missing { kind: None });
        assert!(claim.date_created.is_none());
        assert!(claim.status.is_none());
    }

    #[test]
    fn payload_without_id_is_rejected() {
        let raw = json!({ "type": "service", "resource": "order", "resource_id": 1 });
        assert!(matches!(
            NormalizedClaim::from_payload(&raw),
            Err(NormalizeError::MissingId)
        ));
    }
}
