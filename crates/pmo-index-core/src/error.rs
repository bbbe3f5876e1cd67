//! Parse-level error types.

use thiserror::Error;

use crate::models::{Diagnostic, DiagnosticKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    /// A front-matter block was opened but is unterminated or not valid YAML.
    #[error("malformed header")]
    MalformedHeader,
    /// The file bytes are not UTF-8.
    #[error("invalid encoding")]
    InvalidEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ParseError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: ParseErrorKind::MalformedHeader,
            message: message.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self {
            kind: ParseErrorKind::InvalidEncoding,
            message: message.into(),
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let kind = match self.kind {
            ParseErrorKind::MalformedHeader => DiagnosticKind::MalformedHeader,
            ParseErrorKind::InvalidEncoding => DiagnosticKind::InvalidEncoding,
        };
        Diagnostic::new(kind, self.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_kind_then_message() {
        let err = ParseError::malformed("unterminated front matter");
        assert_eq!(err.to_string(), "malformed header: unterminated front matter");
        assert_eq!(
            ParseError::encoding("byte 3").to_string(),
            "invalid encoding: byte 3"
        );

        let diagnostic = err.to_diagnostic();
        assert_eq!(diagnostic.kind, DiagnosticKind::MalformedHeader);
        assert_eq!(diagnostic.message, "unterminated front matter");
    }
}
