use serde::{Deserialize, Deserializer};

/// Three-state field for PATCH bodies: absent (`None`), explicit `null`
/// (`Some(None)`) or a value (`Some(Some(v))`).
///
/// Use with `#[serde(default, deserialize_with = "nullable")]`.
pub fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Trims a required text field, rejecting blank input.
pub fn required_text(field: &str, value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Trims optional free text; blank becomes `None`.
pub fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Patch {
        #[serde(default, deserialize_with = "nullable")]
        departure_date: Option<Option<NaiveDate>>,
    }

    #[test]
    fn distinguishes_missing_null_and_value() {
        let missing: Patch = serde_json::from_str("{}").unwrap();
        assert_eq!(missing.departure_date, None);

        let cleared: Patch = serde_json::from_str(r#"{"departure_date": null}"#).unwrap();
        assert_eq!(cleared.departure_date, Some(None));

        let set: Patch = serde_json::from_str(r#"{"departure_date": "2024-06-30"}"#).unwrap();
        assert_eq!(
            set.departure_date,
            Some(NaiveDate::from_ymd_opt(2024, 6, 30))
        );
    }

    #[test]
    fn text_helpers_trim() {
        assert_eq!(required_text("name", "  Lomé ").unwrap(), "Lomé");
        assert!(required_text("name", "   ").is_err());
        assert_eq!(optional_text(Some("  ")), None);
        assert_eq!(optional_text(Some(" x ")), Some("x".to_string()));
    }
}
