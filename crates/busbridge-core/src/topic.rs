//! MQTT topic rules for mapping targets.

use crate::mapping::ValidationError;

/// Maximum topic length in bytes allowed by MQTT.
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a publish topic.
///
/// Publish topics must be non-empty, must not contain the `#` or `+`
/// wildcards or NUL, and must fit the MQTT length prefix.
///
/// # Errors
///
/// Returns the first rule the topic violates.
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.trim().is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if let Some(wildcard) = topic.chars().find(|c| matches!(c, '#' | '+')) {
        return Err(ValidationError::WildcardInTopic {
            topic: topic.to_string(),
            wildcard,
        });
    }
    if topic.contains('\0') {
        return Err(ValidationError::NulInTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }
    Ok(())
}
