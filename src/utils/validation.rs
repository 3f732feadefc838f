// Input validation for login and registration

use validator::validate_email;

/// Minimum password length accepted at registration
const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

/// Validate an email address, returning the normalized (lowercased, trimmed)
/// form on success.
pub fn normalize_and_validate_email(email: &str) -> Result<String, String> {
    let normalized = email.trim().to_lowercase();
    if normalized.is_empty() {
        return Err("Email is required".to_string());
    }
    if !validate_email(&normalized) {
        return Err("Invalid email format".to_string());
    }
    Ok(normalized)
}

/// Validate a password against the registration policy: length bounds plus
/// at least one letter and one digit.
pub fn validate_password_policy(password: &str) -> Result<(), String> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(format!(
            "Password must be at most {} characters",
            MAX_PASSWORD_LEN
        ));
    }
    if !password.chars().any(|c| c.is_ascii_alphabetic()) {
        return Err("Password must contain at least one letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one digit".to_string());
    }
    Ok(())
}

/// Validate a display name for registration.
pub fn validate_display_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Name is required".to_string());
    }
    if trimmed.len() > 255 {
        return Err("Name must be at most 255 characters".to_string());
    }
    Ok(())
}
