use std::fmt;

use anyhow::Error;
use serde::Serialize;
use serde_json::Value;

/// Classes of failure that abort a whole build (or a whole CLI invocation).
///
/// Row-local problems never become a `CodedError`; they are downgraded to
/// [`crate::compiler::BuildWarning`]s by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CodedErrorKind {
    /// A template reference that is neither a mapping nor a list headed by one.
    Template,
    /// The base project scaffold is missing or malformed.
    Scaffold,
    /// Bad configuration or command-line input.
    Usage,
}

impl CodedErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Scaffold => "scaffold",
            Self::Usage => "usage",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodedError {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
    pub kind: CodedErrorKind,
}

impl CodedError {
    fn new(kind: CodedErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            kind,
        }
    }

    pub fn template(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CodedErrorKind::Template, code, message)
    }

    pub fn scaffold(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CodedErrorKind::Scaffold, code, message)
    }

    pub fn usage(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CodedErrorKind::Usage, code, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.code.to_owned(),
                kind: self.kind.as_str().to_owned(),
                message: self.message.clone(),
                details: self.details.clone(),
            },
        }
    }
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CodedError {}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn find_coded_error(error: &Error) -> Option<&CodedError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<CodedError>())
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Context};
    use serde_json::json;

    use super::{find_coded_error, CodedError, CodedErrorKind};

    #[test]
    fn coded_error_survives_added_context() {
        let error = Err::<(), _>(anyhow!(CodedError::template(
            "TEMPLATE_SHAPE",
            "template data must be a mapping",
        )))
        .context("while compiling row 3")
        .unwrap_err();

        let coded = find_coded_error(&error).expect("coded error should be found in chain");
        assert_eq!(coded.code, "TEMPLATE_SHAPE");
        assert_eq!(coded.kind, CodedErrorKind::Template);
    }

    #[test]
    fn envelope_carries_kind_and_details() {
        let envelope = CodedError::scaffold("SCAFFOLD_SHAPE", "missing Timelines")
            .with_details(json!({ "path": "scaffold.ymmp" }))
            .envelope();
        let value = serde_json::to_value(&envelope).expect("envelope should serialize");
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["kind"], json!("scaffold"));
        assert_eq!(value["error"]["details"]["path"], json!("scaffold.ymmp"));
    }
}
