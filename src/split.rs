//! Splitting a combined response back into per-constituent responses.
//!
//! The inverse of [`crate::merge`]: data keys and error paths carry the
//! `_{index}_{name}` aliases the merger wrote, and decoding them is the only
//! bookkeeping needed to route each piece back to its constituent.

use serde_json_bytes::Value;

use crate::alias;
use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;

/// Split one combined response into `count` constituent responses, in
/// constituent order.
///
/// Data keys whose alias does not decode, or decodes to an out-of-range
/// index, are discarded with a debug log. Errors that cannot be attributed
/// to a single constituent are replicated into every constituent's response.
pub fn split_response(combined: graphql::Response, count: usize) -> Vec<graphql::Response> {
    let graphql::Response {
        data,
        errors,
        extensions,
    } = combined;

    let data_present = data.is_some();
    let mut slot_data: Vec<Option<Object>> = vec![None; count];
    match data {
        Some(Value::Object(map)) => {
            for (key, value) in map {
                match alias::decode(key.as_str()) {
                    Some((index, name)) if index < count => {
                        slot_data[index]
                            .get_or_insert_with(Object::new)
                            .insert(name.to_string(), value);
                    }
                    _ => {
                        tracing::debug!(
                            key = key.as_str(),
                            "discarding combined response key with no valid batch alias"
                        );
                    }
                }
            }
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            tracing::debug!("discarding non-object combined response data: {other:?}");
        }
    }

    let mut slot_errors: Vec<Vec<graphql::Error>> = vec![Vec::new(); count];
    for error in errors {
        match attribute_error(&error, count) {
            Some((index, relocated)) => slot_errors[index].push(relocated),
            None => {
                for errors in slot_errors.iter_mut() {
                    errors.push(error.clone());
                }
            }
        }
    }

    slot_data
        .into_iter()
        .zip(slot_errors)
        .map(|(data, errors)| graphql::Response {
            data: match data {
                Some(object) => Some(Value::Object(object)),
                None if data_present => Some(Value::Null),
                None => None,
            },
            errors,
            extensions: extensions.clone(),
        })
        .collect()
}

/// Attribute one combined-response error to a constituent.
///
/// An error is attributable when its path starts with a key that decodes to
/// an in-range constituent index; the returned error carries the path with
/// that first segment rewritten back to the constituent's own response key.
/// Pathless errors, and errors whose leading segment does not decode, return
/// `None`.
pub fn attribute_error(
    error: &graphql::Error,
    count: usize,
) -> Option<(usize, graphql::Error)> {
    let path = error.path.as_ref()?;
    let PathElement::Key(key) = path.0.first()? else {
        return None;
    };
    let (index, name) = alias::decode(key)?;
    if index >= count {
        return None;
    }

    let mut relocated = error.clone();
    let mut elements = Vec::with_capacity(path.len());
    elements.push(PathElement::Key(name.to_string()));
    elements.extend(path.iter().skip(1).cloned());
    relocated.path = Some(Path(elements));
    Some((index, relocated))
}
