//! Batching errors.
use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

use crate::graphql::Error as GraphQLError;
use crate::graphql::ErrorExtension;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// Error types for batched execution.
///
/// Note that these are not actually returned to the client, but are instead converted to JSON for
/// [`struct@crate::graphql::Error`].
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum FetchError {
    /// request was malformed: {reason}
    MalformedRequest {
        /// The reason the request could not be batched.
        reason: String,
    },

    /// combined response was malformed: {reason}
    SubrequestMalformedResponse {
        /// The reason the deserialization failed.
        reason: String,
    },

    /// batch processing failed: {reason}
    ///
    /// note that this relates to a transport error and not a GraphQL error
    SubrequestBatchingError {
        /// The reason batch processing failed.
        reason: String,
    },

    /// batched request aborted: {reason}
    BatchAborted {
        /// The abort reason supplied by the cancellation signal.
        reason: String,
    },
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> GraphQLError {
        let value: Value = serde_json_bytes::to_value(self).unwrap_or_default();
        let mut extensions = value.as_object().cloned().unwrap_or_default();
        extensions
            .entry("code")
            .or_insert_with(|| self.extension_code().into());

        GraphQLError::builder()
            .message(self.to_string())
            .and_path(path)
            .extensions(extensions)
            .build()
    }
}

impl ErrorExtension for FetchError {
    fn extension_code(&self) -> String {
        match self {
            FetchError::MalformedRequest { .. } => "MALFORMED_REQUEST",
            FetchError::SubrequestMalformedResponse { .. } => "SUBREQUEST_MALFORMED_RESPONSE",
            FetchError::SubrequestBatchingError { .. } => "SUBREQUEST_BATCHING_ERROR",
            FetchError::BatchAborted { .. } => "BATCH_ABORTED",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_to_graphql_error_carries_code_and_reason() {
        let error = FetchError::SubrequestBatchingError {
            reason: "connection reset".to_string(),
        }
        .to_graphql_error(Some(Path::from("topProducts")));

        assert_eq!(error.message, "batch processing failed: connection reset");
        assert_eq!(
            error.extension_code(),
            Some("SUBREQUEST_BATCHING_ERROR".to_string())
        );
        assert_eq!(error.path, Some(Path::from("topProducts")));
        assert_eq!(
            error.extensions.get("reason").and_then(|v| v.as_str()),
            Some("connection reset")
        );
    }

    #[test]
    fn abort_errors_display_their_reason() {
        let error = FetchError::BatchAborted {
            reason: "client disconnected".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "batched request aborted: client disconnected"
        );
    }
}
