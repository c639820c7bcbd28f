use crate::error::ApiError;
use validator::Validate;

pub fn validate<T: Validate>(value: &T) -> Result<(), ApiError> {
    value
        .validate()
        .map_err(|err| ApiError::Validation(err.to_string()))?;
    Ok(())
}

/// Path identifiers are opaque but must be non-blank and bounded.
pub fn path_id<'a>(name: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > 128 {
        return Err(ApiError::Validation(format!(
            "{name} must be between 1 and 128 characters"
        )));
    }
    Ok(trimmed)
}
