//! Human-readable rendering of backend error payloads.

use serde_json::Value;

const UNKNOWN_ERROR: &str = "(unknown error)";

/// Render an `execution_error` payload.
pub fn format_execution_error(error: &Value) -> String {
    if error.is_null() {
        return UNKNOWN_ERROR.to_string();
    }

    let traceback = match error.get("traceback") {
        Some(Value::Array(lines)) => lines.iter().filter_map(Value::as_str).collect::<String>(),
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    };
    let node_type = str_field(error, "node_type");
    let message = str_field(error, "exception_message");

    format!("Error occurred when executing {node_type}:\n\n{message}\n\n{traceback}")
}

/// Render the body of a rejected `/prompt` submission.
///
/// Accepts either a bare string or the backend's
/// `{error: {message, details}, node_errors: {id: {class_type, errors}}}` object.
pub fn format_prompt_error(error: &Value) -> String {
    match error {
        Value::Null => UNKNOWN_ERROR.to_string(),
        Value::String(text) => text.clone(),
        Value::Object(_) => {
            let Some(err) = error.get("error") else {
                return UNKNOWN_ERROR.to_string();
            };

            let mut message = match err {
                Value::String(text) => text.clone(),
                _ => str_field(err, "message").to_string(),
            };
            if let Some(details) = err.get("details").and_then(Value::as_str) {
                if !details.is_empty() {
                    message.push_str(": ");
                    message.push_str(details);
                }
            }

            if let Some(Value::Object(nodes)) = error.get("node_errors") {
                for node in nodes.values() {
                    message.push('\n');
                    message.push_str(str_field(node, "class_type"));
                    message.push(':');
                    let reasons = node.get("errors").and_then(Value::as_array);
                    for reason in reasons.into_iter().flatten() {
                        message.push_str(&format!(
                            "\n    - {}: {}",
                            str_field(reason, "message"),
                            str_field(reason, "details")
                        ));
                    }
                }
            }

            message
        }
        _ => UNKNOWN_ERROR.to_string(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}
