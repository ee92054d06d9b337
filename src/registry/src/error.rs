use std::fmt::{Debug, Display};

use svcalloc_trace::error::TraceableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Service {name:?} is invalid: {errors}")]
    Invalid { name: String, errors: ErrorList },

    #[error("failed to allocate {field}: range is full")]
    RangeFull { field: String },

    #[error("failed to allocate {field}: {value} is already allocated")]
    AlreadyAllocated { field: String, value: String },

    #[error("Service {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("Operation cannot be fulfilled on Service {namespace}/{name}: the object has been modified")]
    Conflict { namespace: String, name: String },

    #[error("Service {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },

    #[error("Ipam Error: {0}")]
    Ipam(#[source] svcalloc_ipam::error::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("std::io::Error: {0}")]
    StdIo(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load: {0}")]
    FailedToLoad(String),
    #[error("at least one service cluster IP range is required")]
    NoServiceRange,
    #[error("at most two service cluster IP ranges are allowed, got {0}")]
    TooManyServiceRanges(usize),
    #[error("service cluster IP ranges must be of different families")]
    SameFamilyServiceRanges,
    #[error("invalid service cluster IP range: {0}")]
    InvalidServiceRange(String),
    #[error("invalid node port range: {0}")]
    InvalidNodePortRange(String),
}

impl Error {
    pub fn invalid(name: &str, errors: impl Into<ErrorList>) -> Error {
        Error::Invalid {
            name: name.to_string(),
            errors: errors.into(),
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Error::Invalid { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            Error::Invalid { errors, .. } => &errors.0,
            _ => &[],
        }
    }
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::Invalid { .. } => "invalid",
            Error::RangeFull { .. } => "range_full",
            Error::AlreadyAllocated { .. } => "already_allocated",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Ipam(_) => "ipam",
            Error::Config(_) => "config",
            Error::StdIo(_) => "std_io",
        }
        .to_string()
    }
}

impl TraceableError for &Error {
    fn metric_label(&self) -> String {
        (*self).metric_label()
    }
}

/// Maps an allocator failure for one field of a Service.
pub(crate) fn allocation_error(
    name: &str,
    field: String,
    value: impl Debug,
    e: svcalloc_ipam::error::Error,
) -> Error {
    use svcalloc_ipam::error::Error as IpamError;

    match e {
        IpamError::Full => Error::RangeFull { field },
        IpamError::AlreadyAllocated(value) => Error::AlreadyAllocated { field, value },
        e @ (IpamError::OutOfRange { .. } | IpamError::ProtocolMismatch(_)) => Error::invalid(
            name,
            FieldError::invalid(field, value, format!("failed to allocate: {e}")),
        ),
        e => Error::Ipam(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorKind {
    Invalid,
    Required,
    Forbidden,
    Duplicate,
    NotSupported,
}

impl Display for FieldErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldErrorKind::Invalid => write!(f, "Invalid value"),
            FieldErrorKind::Required => write!(f, "Required value"),
            FieldErrorKind::Forbidden => write!(f, "Forbidden"),
            FieldErrorKind::Duplicate => write!(f, "Duplicate value"),
            FieldErrorKind::NotSupported => write!(f, "Unsupported value"),
        }
    }
}

/// A problem with one field of a Service, addressed by its JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub kind: FieldErrorKind,
    pub field: String,
    pub value: Option<String>,
    pub detail: String,
}

impl FieldError {
    pub fn invalid(field: impl Into<String>, value: impl Debug, detail: impl Into<String>) -> Self {
        FieldError {
            kind: FieldErrorKind::Invalid,
            field: field.into(),
            value: Some(format!("{value:?}")),
            detail: detail.into(),
        }
    }

    pub fn required(field: impl Into<String>, detail: impl Into<String>) -> Self {
        FieldError {
            kind: FieldErrorKind::Required,
            field: field.into(),
            value: None,
            detail: detail.into(),
        }
    }

    pub fn forbidden(field: impl Into<String>, detail: impl Into<String>) -> Self {
        FieldError {
            kind: FieldErrorKind::Forbidden,
            field: field.into(),
            value: None,
            detail: detail.into(),
        }
    }

    pub fn duplicate(field: impl Into<String>, value: impl Debug) -> Self {
        FieldError {
            kind: FieldErrorKind::Duplicate,
            field: field.into(),
            value: Some(format!("{value:?}")),
            detail: String::new(),
        }
    }

    pub fn not_supported(field: impl Into<String>, value: impl Debug, supported: &[&str]) -> Self {
        FieldError {
            kind: FieldErrorKind::NotSupported,
            field: field.into(),
            value: Some(format!("{value:?}")),
            detail: format!("supported values: {supported:?}"),
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.kind)?;
        if let Some(value) = &self.value {
            write!(f, ": {value}")?;
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorList(pub Vec<FieldError>);

impl ErrorList {
    pub fn new() -> ErrorList {
        ErrorList(Vec::new())
    }

    pub fn push(&mut self, e: FieldError) {
        self.0.push(e)
    }

    pub fn extend(&mut self, other: ErrorList) {
        self.0.extend(other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldError> {
        self.0.iter()
    }

    /// Turns a non-empty list into an `Error::Invalid` for the named Service.
    pub fn into_result(self, name: &str) -> Result<(), Error> {
        if self.is_empty() {
            return Ok(());
        }
        Err(Error::invalid(name, self))
    }
}

impl From<FieldError> for ErrorList {
    fn from(e: FieldError) -> Self {
        ErrorList(vec![e])
    }
}

impl Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            errors => {
                let joined = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<String>>()
                    .join(", ");
                write!(f, "[{joined}]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest(
        e,
        expected,
        case(
            FieldError::invalid("spec.ipFamilyPolicy", "RequireDualStack", "this cluster is not configured for dual-stack services"),
            r#"spec.ipFamilyPolicy: Invalid value: "RequireDualStack": this cluster is not configured for dual-stack services"#
        ),
        case(FieldError::duplicate("spec.ports[1].nodePort", 30080), "spec.ports[1].nodePort: Duplicate value: 30080"),
        case(FieldError::forbidden("spec.healthCheckNodePort", "field is immutable"), "spec.healthCheckNodePort: Forbidden: field is immutable"),
        case(FieldError::required("spec.externalName", ""), "spec.externalName: Required value")
    )]
    fn works_field_error_display(e: FieldError, expected: &str) {
        assert_eq!(e.to_string(), expected);
    }

    #[rstest(
        e,
        expected,
        case(svcalloc_ipam::error::Error::Full, "range_full"),
        case(svcalloc_ipam::error::Error::AlreadyAllocated("30080".to_string()), "already_allocated"),
        case(svcalloc_ipam::error::Error::OutOfRange { value: "1".to_string(), range: "30000-32767".to_string() }, "invalid"),
        case(svcalloc_ipam::error::Error::FailedToGetLock, "ipam")
    )]
    fn works_allocation_error(e: svcalloc_ipam::error::Error, expected: &str) {
        let err = allocation_error("svc", "spec.ports[0].nodePort".to_string(), 1, e);
        assert_eq!(err.metric_label(), expected);
    }

    #[test]
    fn works_error_list_display() {
        let mut errors = ErrorList::new();
        assert!(errors.clone().into_result("svc").is_ok());
        errors.push(FieldError::required("spec.ports[0].name", ""));
        errors.push(FieldError::duplicate("spec.ports[1].name", "http"));
        let err = errors.into_result("svc").unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Service "svc" is invalid: [spec.ports[0].name: Required value, spec.ports[1].name: Duplicate value: "http"]"#
        );
    }
}
