//! Typed error taxonomy shared by every layer of the crate.
//!
//! Expected failure modes — bad caller input, absent resources, operation
//! failures, upstream platform faults — travel as [`Error`] values through
//! `Result`, never as panics. Callers branch on the kind; the collaborating
//! HTTP boundary serialises errors with [`Error::to_wire_json`].

use thiserror::Error as ThisError;

/// Named operation attached to an [`Error::InstanceOperation`] failure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    /// Instance or machine creation.
    Create,
    /// Fetching a single instance or machine.
    Get,
    /// Listing instances or machines.
    List,
    /// Powering an instance on.
    Start,
    /// Powering an instance off.
    Stop,
    /// Stop-then-start cycle.
    Restart,
    /// Tearing an instance down.
    Destroy,
    /// Remote command execution.
    Execute,
    /// Reachability / running-state probe.
    HealthCheck,
    /// Credential rejection by the backend (401/403).
    Authenticate,
}

impl Operation {
    /// Stable lowercase name used in error messages and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Get => "get",
            Self::List => "list",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Destroy => "destroy",
            Self::Execute => "execute",
            Self::HealthCheck => "health-check",
            Self::Authenticate => "authenticate",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Discriminated failure value returned by every public operation.
#[derive(Clone, Debug, PartialEq, ThisError)]
pub enum Error {
    /// Bad caller input, rejected before any network call.
    #[error("{message}")]
    Validation {
        /// Field that failed validation, when one can be named.
        field: Option<String>,
        /// Human-readable description of the rejection.
        message: String,
    },
    /// A referenced resource does not exist.
    #[error("{resource} '{id}' not found")]
    NotFound {
        /// Resource kind (for example `instance` or `machine`).
        resource: String,
        /// Identifier that failed to resolve.
        id: String,
    },
    /// An operation against an instance failed.
    #[error("{operation} failed: {message}")]
    InstanceOperation {
        /// Operation that failed.
        operation: Operation,
        /// Human-readable description of the failure.
        message: String,
        /// Structured backend details, when the backend supplied any.
        details: Option<serde_json::Value>,
    },
    /// Upstream platform failure (5xx, transport errors).
    #[error("infrastructure failure: {message}")]
    Infrastructure {
        /// HTTP status reported by the backend, when one exists.
        status: Option<u16>,
        /// Human-readable description of the failure.
        message: String,
    },
}

impl Error {
    /// Builds a validation error with no named field.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    /// Builds a validation error naming the offending field.
    pub fn validation_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// Builds a not-found error for the given resource kind and id.
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Builds an operation failure without backend details.
    pub fn operation(operation: Operation, message: impl Into<String>) -> Self {
        Self::InstanceOperation {
            operation,
            message: message.into(),
            details: None,
        }
    }

    /// Builds an operation failure carrying structured backend details.
    pub fn operation_with_details(
        operation: Operation,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::InstanceOperation {
            operation,
            message: message.into(),
            details: Some(details),
        }
    }

    /// Builds an infrastructure error with no HTTP status.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            status: None,
            message: message.into(),
        }
    }

    /// Builds an infrastructure error recording the backend status code.
    pub fn infrastructure_status(status: u16, message: impl Into<String>) -> Self {
        Self::Infrastructure {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Maps a non-success backend HTTP status to an error kind.
    ///
    /// The table is fixed across backends: 404 becomes [`Error::NotFound`],
    /// 401/403 become an [`Operation::Authenticate`] failure, 5xx becomes
    /// [`Error::Infrastructure`], and any other non-2xx status becomes a
    /// generic operation failure carrying the response body.
    #[must_use]
    pub fn from_backend_status(
        status: u16,
        operation: Operation,
        resource: &str,
        id: &str,
        body: &str,
    ) -> Self {
        match status {
            404 => Self::not_found(resource, id),
            401 | 403 => Self::operation(
                Operation::Authenticate,
                format!("backend rejected credentials (status {status})"),
            ),
            s if s >= 500 => {
                Self::infrastructure_status(s, format!("backend returned status {s}: {body}"))
            }
            s => Self::operation(
                operation,
                format!("backend returned status {s}: {body}"),
            ),
        }
    }

    /// User-visible HTTP status for this error at the collaborating
    /// REST boundary.
    ///
    /// Operation failures split by operation: caller-correctable operations
    /// (create, execute, authenticate) surface 400, lifecycle failures on
    /// the provider side surface 500.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::InstanceOperation { operation, .. } => match operation {
                Operation::Create | Operation::Execute | Operation::Authenticate => 400,
                _ => 500,
            },
            Self::Infrastructure { .. } => 500,
        }
    }

    /// Serialises the error to the `{error, status}` JSON shape consumed by
    /// the collaborating HTTP boundary.
    #[must_use]
    pub fn to_wire_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "status": self.http_status(),
        })
    }

    /// Returns `true` for the not-found kind.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for the validation kind.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(404, Error::not_found("machine", "m1"))]
    #[case(
        401,
        Error::operation(
            Operation::Authenticate,
            "backend rejected credentials (status 401)"
        )
    )]
    #[case(
        403,
        Error::operation(
            Operation::Authenticate,
            "backend rejected credentials (status 403)"
        )
    )]
    #[case(500, Error::infrastructure_status(500, "backend returned status 500: boom"))]
    #[case(503, Error::infrastructure_status(503, "backend returned status 503: boom"))]
    #[case(
        422,
        Error::operation(Operation::Start, "backend returned status 422: boom")
    )]
    fn backend_status_table(#[case] status: u16, #[case] expected: Error) {
        let err = Error::from_backend_status(status, Operation::Start, "machine", "m1", "boom");
        assert_eq!(err, expected);
    }

    #[rstest]
    #[case(Error::validation("bad name"), 400)]
    #[case(Error::not_found("instance", "i1"), 404)]
    #[case(Error::operation(Operation::Execute, "nope"), 400)]
    #[case(Error::operation(Operation::Authenticate, "nope"), 400)]
    #[case(Error::operation(Operation::Destroy, "nope"), 500)]
    #[case(Error::infrastructure("down"), 500)]
    fn http_status_mapping(#[case] err: Error, #[case] expected: u16) {
        assert_eq!(err.http_status(), expected);
    }

    #[test]
    fn wire_json_carries_message_and_status() {
        let wire = Error::not_found("instance", "dev1").to_wire_json();
        assert_eq!(wire["error"], "instance 'dev1' not found");
        assert_eq!(wire["status"], 404);
    }

    #[test]
    fn operation_details_are_preserved() {
        let err = Error::operation_with_details(
            Operation::Create,
            "quota exceeded",
            serde_json::json!({"limit": 5}),
        );
        let Error::InstanceOperation { details, .. } = err else {
            panic!("expected operation error");
        };
        assert_eq!(details, Some(serde_json::json!({"limit": 5})));
    }
}
