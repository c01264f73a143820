//! Engine-level error taxonomy.

/// Failures surfaced by the orchestration layer.
///
/// Tool-level and admission failures never appear here: they are delivered
/// in-band as error tool results so one bad call cannot sink a whole
/// completion. This enum covers the failures that end the completion itself.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("tool already registered: {name}")]
    DuplicateTool { name: String },

    #[error("stream failed: {0}")]
    Stream(String),

    #[error(
        "Unable to process the attached {content_type} document. {message} \
         Try converting it to plain text or markdown and attaching that instead."
    )]
    DocumentProcessing {
        content_type: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn document_processing_message_names_the_format() {
        let err = EngineError::DocumentProcessing {
            content_type: "application/pdf".to_string(),
            message: "The provider rejected the attachment.".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("application/pdf"));
        assert!(text.contains("plain text"));
    }
}
