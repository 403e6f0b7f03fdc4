//! Request/response envelope for transports sitting in front of
//! [`ContextService`](crate::ContextService).

use crate::Tenant;
use crate::error::ContextError;
use crate::path::ValueTree;
use crate::storage::{Entry, ExportPage, Mutation, PageRequest, ScopeExport};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Get,
    Set,
    Delete,
    Keys,
    Clean,
    ExportPage,
    ImportBulk,
    Usage,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::Set => "set",
            OperationKind::Delete => "delete",
            OperationKind::Keys => "keys",
            OperationKind::Clean => "clean",
            OperationKind::ExportPage => "exportPage",
            OperationKind::ImportBulk => "importBulk",
            OperationKind::Usage => "usage",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call against the context store.
///
/// `payload` depends on the operation:
/// - `get`: `["key", ...]`
/// - `set`: `[{"key": ..., "value": ...}, ...]`, a missing `value` deletes
/// - `clean`: `["live-id", ...]`
/// - `exportPage`: `{"cursor": ..., "limit": ...}`
/// - `importBulk`: `{"scope": ..., "values": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub operation: OperationKind,
    #[serde(default)]
    pub payload: Value,
    /// Quota resolved for the caller's tenant, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Get { scope: String, keys: Vec<String> },
    Set { scope: String, batch: Vec<Mutation> },
    Delete { scope: String },
    Keys { scope: String },
    Clean { live_ids: Vec<String> },
    ExportPage(PageRequest),
    ImportBulk { scope: String, values: ValueTree },
    Usage,
}

#[derive(Deserialize)]
struct ImportPayload {
    #[serde(default)]
    scope: Option<String>,
    values: ValueTree,
}

impl ContextRequest {
    pub fn new(project: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            project: project.into(),
            scope: None,
            operation,
            payload: Value::Null,
            quota: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota = Some(quota_bytes);
        self
    }

    pub fn tenant(&self) -> Tenant {
        Tenant {
            project_id: self.project.clone(),
            context_quota: self.quota,
        }
    }

    pub fn into_operation(self) -> Result<(Tenant, Operation), ContextError> {
        let tenant = self.tenant();
        let kind = self.operation;
        let scope = self.scope;
        let payload = self.payload;
        let require_scope = |scope: Option<String>| {
            scope.ok_or_else(|| ContextError::Validation(format!("{kind} requires a scope")))
        };
        let operation = match kind {
            OperationKind::Get => Operation::Get {
                scope: require_scope(scope)?,
                keys: decode_payload(kind, payload, Value::Array(Vec::new()))?,
            },
            OperationKind::Set => Operation::Set {
                scope: require_scope(scope)?,
                batch: decode_payload(kind, payload, Value::Array(Vec::new()))?,
            },
            OperationKind::Delete => Operation::Delete {
                scope: require_scope(scope)?,
            },
            OperationKind::Keys => Operation::Keys {
                scope: require_scope(scope)?,
            },
            OperationKind::Clean => Operation::Clean {
                live_ids: decode_payload(kind, payload, Value::Array(Vec::new()))?,
            },
            OperationKind::ExportPage => Operation::ExportPage(decode_payload(
                kind,
                payload,
                Value::Object(Map::new()),
            )?),
            OperationKind::ImportBulk => {
                let import: ImportPayload = decode_payload(kind, payload, Value::Null)?;
                Operation::ImportBulk {
                    scope: require_scope(import.scope.or(scope))?,
                    values: import.values,
                }
            }
            OperationKind::Usage => Operation::Usage,
        };
        Ok((tenant, operation))
    }
}

fn decode_payload<T: DeserializeOwned>(
    kind: OperationKind,
    payload: Value,
    when_missing: Value,
) -> Result<T, ContextError> {
    let payload = if payload.is_null() {
        when_missing
    } else {
        payload
    };
    serde_json::from_value(payload)
        .map_err(|e| ContextError::Decode(format!("{kind} payload: {e}")))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportPageBody {
    pub data: Vec<ScopeExport>,
    pub count: u64,
    pub meta: PageMeta,
}

impl From<ExportPage> for ExportPageBody {
    fn from(page: ExportPage) -> Self {
        Self {
            data: page.data,
            count: page.count,
            meta: PageMeta {
                next_cursor: page.next_cursor,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ContextResponse {
    Entries(Vec<Entry>),
    Keys(Vec<String>),
    Page(ExportPageBody),
    Usage { used: u64 },
    Empty {},
}

/// Error payload mirrored by transports: `{code, error, limit?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip)]
    pub status: u16,
}

impl From<&ContextError> for ErrorBody {
    fn from(err: &ContextError) -> Self {
        let limit = match err {
            ContextError::OverQuota { limit, .. } => Some(*limit),
            _ => None,
        };
        Self {
            code: err.code_str().to_string(),
            error: err.to_string(),
            limit,
            status: err.status_code(),
        }
    }
}

impl ErrorBody {
    pub fn status_code(&self) -> u16 {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextRequest, ContextResponse, ErrorBody, Operation, OperationKind, PageMeta};
    use crate::error::ContextError;
    use crate::storage::Mutation;
    use serde_json::json;

    #[test]
    fn parses_set_request_with_delete_sentinel() {
        let request: ContextRequest = serde_json::from_value(json!({
            "project": "test-project-1",
            "scope": "global",
            "operation": "set",
            "payload": [{"key": "a", "value": 1}, {"key": "b"}],
            "quota": 1000
        }))
        .expect("parse");
        let (tenant, operation) = request.into_operation().expect("operation");
        assert_eq!(tenant.project_id, "test-project-1");
        assert_eq!(tenant.context_quota, Some(1000));
        assert_eq!(
            operation,
            Operation::Set {
                scope: "global".into(),
                batch: vec![Mutation::set("a", json!(1)), Mutation::delete("b")],
            }
        );
    }

    #[test]
    fn scoped_operation_without_scope_is_rejected() {
        let err = ContextRequest::new("p", OperationKind::Keys)
            .into_operation()
            .expect_err("missing scope");
        assert_eq!(err.code_str(), "validation");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn export_payload_defaults_when_missing() {
        let (_, operation) = ContextRequest::new("p", OperationKind::ExportPage)
            .into_operation()
            .expect("operation");
        match operation {
            Operation::ExportPage(page) => {
                assert_eq!(page.limit, 20);
                assert_eq!(page.cursor, None);
            }
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn import_scope_may_come_from_payload_or_request() {
        let (_, from_payload) = ContextRequest::new("p", OperationKind::ImportBulk)
            .with_payload(json!({"scope": "global", "values": {"test": 1}}))
            .into_operation()
            .expect("payload scope");
        assert!(matches!(from_payload, Operation::ImportBulk { ref scope, .. } if scope == "global"));

        let (_, from_request) = ContextRequest::new("p", OperationKind::ImportBulk)
            .with_scope("flow-1")
            .with_payload(json!({"values": {}}))
            .into_operation()
            .expect("request scope");
        assert!(matches!(from_request, Operation::ImportBulk { ref scope, .. } if scope == "flow-1"));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = ContextRequest::new("p", OperationKind::Get)
            .with_scope("global")
            .with_payload(json!({"not": "a list"}))
            .into_operation()
            .expect_err("bad payload");
        assert_eq!(err.code_str(), "decode");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn responses_serialize_to_wire_shapes() {
        assert_eq!(
            serde_json::to_value(ContextResponse::Empty {}).expect("encode"),
            json!({})
        );
        assert_eq!(
            serde_json::to_value(ContextResponse::Usage { used: 768 }).expect("encode"),
            json!({"used": 768})
        );
        assert_eq!(
            serde_json::to_value(PageMeta::default()).expect("encode"),
            json!({})
        );
    }

    #[test]
    fn over_quota_error_body_carries_limit() {
        let err = ContextError::OverQuota {
            limit: 1000,
            used: 768,
            delta: 256,
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.status_code(), 413);
        let wire = serde_json::to_value(&body).expect("encode");
        assert_eq!(wire["code"], "over_quota");
        assert_eq!(wire["limit"], 1000);
        assert!(wire.get("error").is_some());
        assert!(wire.get("status").is_none());
    }
}
