use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;

use crate::error::FetchError;
use crate::graphql::Error;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// A graphql primary response.
/// Used for both combined and constituent results.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Response {
    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(
        data: Option<Value>,
        errors: Vec<Error>,
        extensions: Map<ByteString, Value>,
    ) -> Self {
        Self {
            data,
            errors,
            extensions,
        }
    }

    /// Append errors to this response, draining the given `Vec`.
    pub fn append_errors(&mut self, errors: &mut Vec<Error>) {
        self.errors.append(errors)
    }

    /// Create a [`Response`] from the supplied [`Value`].
    ///
    /// This will return an error if the input is not a valid GraphQL response
    /// document.
    pub fn from_value(value: Value) -> Result<Response, FetchError> {
        let Value::Object(mut object) = value else {
            return Err(FetchError::SubrequestMalformedResponse {
                reason: "response was not an object".to_string(),
            });
        };

        let data = object.remove("data");
        let errors = match object.remove("errors") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values
                .into_iter()
                .map(Error::from_value)
                .collect::<Result<Vec<Error>, FetchError>>()?,
            Some(_) => {
                return Err(FetchError::SubrequestMalformedResponse {
                    reason: "invalid `errors`: not an array".to_string(),
                });
            }
        };
        let extensions = match object.remove("extensions") {
            Some(Value::Object(map)) => map,
            _ => Object::default(),
        };

        // Graphql spec says:
        // If the data entry in the response is not present, the errors entry in the response must not be empty.
        // It must contain at least one error. The errors it contains should indicate why no data was able to be returned.
        if data.is_none() && errors.is_empty() {
            return Err(FetchError::SubrequestMalformedResponse {
                reason: "graphql response without data must contain at least one error".to_string(),
            });
        }

        Ok(Response {
            data,
            errors,
            extensions,
        })
    }
}
