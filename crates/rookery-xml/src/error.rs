//! Error type for XML parsing and streaming.

use thiserror::Error;

/// Errors raised by the DOM and the stream parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XmlError {
    /// Input was not well-formed XML.
    #[error("malformed XML: {0}")]
    Malformed(String),

    /// A single stanza exceeded the parser's node budget.
    #[error("stanza exceeds maximum size of {max} bytes")]
    NodeTooLarge {
        /// The configured byte budget.
        max: usize,
    },

    /// Element nesting exceeded the parser's depth budget.
    #[error("element nesting exceeds maximum depth of {max}")]
    TooDeep {
        /// The configured depth budget.
        max: usize,
    },

    /// Input bytes were not valid UTF-8.
    #[error("invalid UTF-8 in stream")]
    InvalidUtf8,

    /// A second root element or content after the stream close.
    #[error("unexpected content after stream close")]
    AfterClose,
}

impl XmlError {
    /// Create a malformed-input error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// The matching XMPP stream-error condition for this error.
    pub fn stream_condition(&self) -> &'static str {
        match self {
            XmlError::Malformed(_) => "xml-not-well-formed",
            XmlError::NodeTooLarge { .. } | XmlError::TooDeep { .. } => "invalid-xml",
            XmlError::InvalidUtf8 => "xml-not-well-formed",
            XmlError::AfterClose => "invalid-xml",
        }
    }
}
