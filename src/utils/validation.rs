use validator::Validate;

use crate::error::{AppError, AppResult};

/// Validate a struct and return AppError on failure
pub fn validate_request<T: Validate>(data: &T) -> AppResult<()> {
    data.validate().map_err(|e| {
        let mut messages: Vec<String> = e
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |error| {
                    format!(
                        "{}: {}",
                        field,
                        error
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| error.code.to_string())
                    )
                })
            })
            .collect();
        messages.sort();
        AppError::Validation(messages.join(", "))
    })
}

/// Trim a display name and strip control characters (tabs and newlines become spaces)
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect()
}

/// Normalize a tag: trimmed and lowercased
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Validate)]
    struct Named {
        #[validate(length(min = 1))]
        name: String,
    }

    #[test]
    fn test_validate_request_reports_field() {
        let err = validate_request(&Named { name: String::new() }).unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.starts_with("name:")));
        assert!(validate_request(&Named { name: "ok".into() }).is_ok());
    }

    #[test]
    fn test_sanitize_name_trims_whitespace() {
        assert_eq!(sanitize_name("  Escalate VIPs  "), "Escalate VIPs");
    }

    #[test]
    fn test_sanitize_name_removes_null_byte() {
        assert_eq!(sanitize_name("Tag\x00 late"), "Tag late");
    }

    #[test]
    fn test_sanitize_name_flattens_newlines() {
        assert_eq!(sanitize_name("Line1\nLine2"), "Line1 Line2");
    }

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("  VIP "), "vip");
    }
}
