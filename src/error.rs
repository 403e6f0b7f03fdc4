use thiserror::Error;

/// Optional driver capabilities probed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ExportPage,
    ImportBulk,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::ExportPage => write!(f, "exportPage"),
            Capability::ImportBulk => write!(f, "importBulk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidScope,
    InvalidExpression,
    InvalidCursor,
    OverQuota,
    ProjectNotFound,
    CapabilityUnsupported,
    InvalidConfig,
    Backend,
    Unavailable,
}

impl ContextErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextErrorCode::Io => "io",
            ContextErrorCode::Encode => "encode",
            ContextErrorCode::Decode => "decode",
            ContextErrorCode::Validation => "validation",
            ContextErrorCode::InvalidScope => "invalid_scope",
            ContextErrorCode::InvalidExpression => "INVALID_EXPR",
            ContextErrorCode::InvalidCursor => "invalid_cursor",
            ContextErrorCode::OverQuota => "over_quota",
            ContextErrorCode::ProjectNotFound => "project_not_found",
            ContextErrorCode::CapabilityUnsupported => "capability_unsupported",
            ContextErrorCode::InvalidConfig => "invalid_config",
            ContextErrorCode::Backend => "backend",
            ContextErrorCode::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid scope '{scope}': {reason}")]
    InvalidScope { scope: String, reason: String },
    #[error("invalid key expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: &'static str },
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("over quota: limit {limit} bytes")]
    OverQuota { limit: u64, used: u64, delta: i64 },
    #[error("project '{project_id}' not found")]
    ProjectNotFound { project_id: String },
    #[error("driver '{driver}' does not support {capability}")]
    CapabilityUnsupported {
        driver: &'static str,
        capability: Capability,
    },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
}

impl From<rusqlite::Error> for ContextError {
    fn from(err: rusqlite::Error) -> Self {
        ContextError::Backend(err.to_string())
    }
}

impl ContextError {
    pub fn code(&self) -> ContextErrorCode {
        match self {
            ContextError::Io(_) => ContextErrorCode::Io,
            ContextError::Encode(_) => ContextErrorCode::Encode,
            ContextError::Decode(_) => ContextErrorCode::Decode,
            ContextError::Validation(_) => ContextErrorCode::Validation,
            ContextError::InvalidScope { .. } => ContextErrorCode::InvalidScope,
            ContextError::InvalidExpression { .. } => ContextErrorCode::InvalidExpression,
            ContextError::InvalidCursor(_) => ContextErrorCode::InvalidCursor,
            ContextError::OverQuota { .. } => ContextErrorCode::OverQuota,
            ContextError::ProjectNotFound { .. } => ContextErrorCode::ProjectNotFound,
            ContextError::CapabilityUnsupported { .. } => ContextErrorCode::CapabilityUnsupported,
            ContextError::InvalidConfig { .. } => ContextErrorCode::InvalidConfig,
            ContextError::Backend(_) => ContextErrorCode::Backend,
            ContextError::Unavailable { .. } => ContextErrorCode::Unavailable,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True when the caller sent something malformed or over its allowance,
    /// false for configuration and backend faults.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            ContextError::Decode(_)
                | ContextError::Validation(_)
                | ContextError::InvalidScope { .. }
                | ContextError::InvalidExpression { .. }
                | ContextError::InvalidCursor(_)
                | ContextError::OverQuota { .. }
                | ContextError::ProjectNotFound { .. }
        )
    }

    /// Status class for a transport layer sitting in front of the service.
    pub fn status_code(&self) -> u16 {
        match self {
            ContextError::OverQuota { .. } => 413,
            ContextError::ProjectNotFound { .. } => 404,
            _ if self.is_request_error() => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Capability, ContextError, ContextErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ContextErrorCode::OverQuota.as_str(), "over_quota");
        assert_eq!(ContextErrorCode::InvalidExpression.as_str(), "INVALID_EXPR");
        assert_eq!(ContextErrorCode::InvalidScope.as_str(), "invalid_scope");
    }

    #[test]
    fn status_codes_follow_error_class() {
        let over = ContextError::OverQuota {
            limit: 1000,
            used: 768,
            delta: 256,
        };
        assert_eq!(over.status_code(), 413);
        assert_eq!(over.code_str(), "over_quota");

        let expr = ContextError::InvalidExpression {
            expr: ".{}".into(),
            reason: "empty path segment",
        };
        assert_eq!(expr.status_code(), 400);

        let unsupported = ContextError::CapabilityUnsupported {
            driver: "memory",
            capability: Capability::ExportPage,
        };
        assert!(!unsupported.is_request_error());
        assert_eq!(unsupported.status_code(), 500);
        assert_eq!(
            unsupported.to_string(),
            "driver 'memory' does not support exportPage"
        );
    }
}
