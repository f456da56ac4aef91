//! Request validation for the gateway.
//!
//! Turns a raw text frame into a [`ClientEvent`] whose payload passed its
//! constraints, or into a [`QueueError::Validation`] with a flat list of
//! human-readable violations.

use std::borrow::Cow;

use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

use super::messages::ClientEvent;
use crate::QueueError;

/// Queue names must contain at least one non-whitespace character.
pub fn validate_queue_name(value: &str) -> Result<(), ValidationError> {
    // ---
    if value.trim().is_empty() {
        let mut err = ValidationError::new("non_empty");
        err.message = Some(Cow::from(
            "queueName must be a non-empty, non-whitespace string",
        ));
        return Err(err);
    }
    Ok(())
}

/// Flatten nested validator output into one sorted list of messages.
pub fn flatten_errors(errors: &ValidationErrors) -> Vec<String> {
    // ---
    let mut details = Vec::new();
    collect(errors, "", &mut details);
    details.sort();
    details.dedup();
    details
}

fn collect(errors: &ValidationErrors, prefix: &str, out: &mut Vec<String>) {
    // ---
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };

        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for err in field_errors {
                    out.push(match &err.message {
                        Some(message) => message.to_string(),
                        None => format!("{path} is invalid ({})", err.code),
                    });
                }
            }
            ValidationErrorsKind::Struct(nested) => collect(nested, &path, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect(nested, &format!("{path}[{index}]"), out);
                }
            }
        }
    }
}

fn invalid(details: Vec<String>) -> QueueError {
    QueueError::Validation { details }
}

/// Parse and validate one client text frame.
///
/// # Errors
///
/// [`QueueError::Validation`] for malformed JSON, unknown events, wrong
/// shapes and constraint violations.
pub fn parse_client_event(text: &str) -> Result<ClientEvent, QueueError> {
    // ---
    let event: ClientEvent = serde_json::from_str(text)
        .map_err(|e| invalid(vec![format!("malformed request: {e}")]))?;

    let checked = match &event {
        ClientEvent::Subscribe(req) | ClientEvent::Unsubscribe(req) => req.validate(),
        ClientEvent::Publish(req) => req.validate(),
    };

    checked.map_err(|errors| invalid(flatten_errors(&errors)))?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn violations(text: &str) -> Vec<String> {
        match parse_client_event(text) {
            Err(QueueError::Validation { details }) => details,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_queue_name_rejected() {
        // ---
        let details = violations(r#"{"event":"subscribe","data":{"queueName":""}}"#);
        assert_eq!(details.len(), 1);
        assert!(details[0].contains("non-empty"));

        let details = violations(r#"{"event":"unsubscribe","data":{"queueName":"   "}}"#);
        assert!(details[0].contains("non-empty"));
    }

    #[test]
    fn test_nested_body_and_name_reported_together() {
        // ---
        let details = violations(r#"{"event":"publish","data":{"queueName":"","message":{"body":""}}}"#);
        assert_eq!(details.len(), 2);
        assert!(details.iter().any(|d| d.contains("message.body")));
        assert!(details.iter().any(|d| d.contains("queueName")));
    }

    #[test]
    fn test_malformed_shapes() {
        // ---
        assert!(violations("not json")[0].starts_with("malformed request"));
        assert!(violations(r#"{"event":"explode","data":{}}"#)[0].starts_with("malformed request"));
        assert!(violations(r#"{"event":"publish","data":{"queueName":"q"}}"#)[0]
            .starts_with("malformed request"));
        assert!(violations(
            r#"{"event":"publish","data":{"queueName":"q","message":{"body":"x","attributes":{"n":1}}}}"#
        )[0]
        .starts_with("malformed request"));
    }

    #[test]
    fn test_valid_publish_passes() {
        // ---
        let event = parse_client_event(
            r#"{"event":"publish","data":{"queueName":"orders","message":{"body":"hello"}}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::Publish(_)));
    }
}
