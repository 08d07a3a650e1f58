use crate::errors::{AppError, FieldError};

pub const MAX_EMAIL_LEN: usize = 255;
pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 100;
pub const MAX_NAME_LEN: usize = 100;

/// Collects field errors so a request reports all of them at once.
#[derive(Debug, Default)]
pub struct Checks {
    errors: Vec<FieldError>,
}

impl Checks {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn email(&mut self, field: &'static str, value: &str) -> &mut Self {
        let value = value.trim();
        if value.is_empty() {
            self.fail(field, "Email is required");
        } else if value.len() > MAX_EMAIL_LEN {
            self.fail(field, "Email must not exceed 255 characters");
        } else if !looks_like_email(value) {
            self.fail(field, "Invalid email format");
        }
        self
    }

    /// Presence and length only; used where the stored policy must not leak.
    pub fn password_present(&mut self, field: &'static str, value: &str) -> &mut Self {
        if value.is_empty() {
            self.fail(field, "Password is required");
        } else if value.chars().count() > MAX_PASSWORD_LEN {
            self.fail(field, "Password must not exceed 100 characters");
        }
        self
    }

    pub fn new_password(&mut self, field: &'static str, value: &str) -> &mut Self {
        let len = value.chars().count();
        if value.is_empty() {
            self.fail(field, "Password is required");
            return self;
        }
        if len < MIN_PASSWORD_LEN {
            self.fail(field, "Password must be at least 8 characters");
        }
        if len > MAX_PASSWORD_LEN {
            self.fail(field, "Password must not exceed 100 characters");
        }
        if !value.chars().any(|c| c.is_uppercase()) {
            self.fail(field, "Password must contain at least one uppercase letter");
        }
        if !value.chars().any(|c| c.is_lowercase()) {
            self.fail(field, "Password must contain at least one lowercase letter");
        }
        if !value.chars().any(|c| c.is_ascii_digit()) {
            self.fail(field, "Password must contain at least one digit");
        }
        self
    }

    pub fn name(&mut self, field: &'static str, label: &str, value: &str) -> &mut Self {
        let value = value.trim();
        if value.is_empty() {
            self.fail(field, format!("{} is required", label));
        } else if value.chars().count() > MAX_NAME_LEN {
            self.fail(field, format!("{} must not exceed 100 characters", label));
        }
        self
    }

    pub fn two_factor_code(&mut self, field: &'static str, value: &str) -> &mut Self {
        if value.is_empty() {
            self.fail(field, "2FA code is required");
        } else if !is_six_digits(value) {
            self.fail(field, "2FA code must be 6 digits");
        }
        self
    }

    pub fn required(&mut self, field: &'static str, message: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.fail(field, message);
        }
        self
    }

    pub fn finish(&mut self) -> Result<(), AppError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(std::mem::take(&mut self.errors)))
        }
    }
}

fn is_six_digits(value: &str) -> bool {
    value.len() == 6 && value.chars().all(|c| c.is_ascii_digit())
}

fn looks_like_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(result: Result<(), AppError>) -> Vec<(&'static str, String)> {
        match result {
            Ok(()) => vec![],
            Err(AppError::Validation(errors)) => {
                errors.into_iter().map(|e| (e.field, e.message)).collect()
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn accepts_ordinary_emails() {
        for email in ["a@b.io", "first.last+tag@sub.example.com", " padded@example.org "] {
            assert!(Checks::new().email("email", email).finish().is_ok(), "{email}");
        }
    }

    #[test]
    fn rejects_malformed_emails() {
        for email in ["", "plain", "@example.com", "a@b", "a@.com", "a@b..com", "a b@c.com", "a@b@c.com"] {
            assert!(Checks::new().email("email", email).finish().is_err(), "{email}");
        }
        let long = format!("{}@example.com", "x".repeat(250));
        let errors = fields(Checks::new().email("email", &long).finish());
        assert_eq!(errors[0].1, "Email must not exceed 255 characters");
    }

    #[test]
    fn password_policy_reports_every_gap() {
        let errors = fields(Checks::new().new_password("password", "abc").finish());
        let messages: Vec<_> = errors.iter().map(|(_, m)| m.as_str()).collect();
        assert!(messages.contains(&"Password must be at least 8 characters"));
        assert!(messages.contains(&"Password must contain at least one uppercase letter"));
        assert!(messages.contains(&"Password must contain at least one digit"));
        assert!(!messages.contains(&"Password must contain at least one lowercase letter"));

        assert!(Checks::new().new_password("password", "Passw0rd").finish().is_ok());
        assert!(Checks::new()
            .new_password("password", &format!("Aa1{}", "x".repeat(98)))
            .finish()
            .is_err());
    }

    #[test]
    fn two_factor_code_must_be_six_digits() {
        assert!(Checks::new().two_factor_code("code", "123456").finish().is_ok());
        assert!(Checks::new().two_factor_code("code", "12345").finish().is_err());
        assert!(Checks::new().two_factor_code("code", "12345a").finish().is_err());
        assert!(Checks::new().two_factor_code("code", "").finish().is_err());
    }

    #[test]
    fn collects_errors_across_fields() {
        let errors = fields(
            Checks::new()
                .email("email", "nope")
                .name("firstName", "First name", " ")
                .required("token", "Token is required", "")
                .finish(),
        );
        let names: Vec<_> = errors.iter().map(|(f, _)| *f).collect();
        assert_eq!(names, vec!["email", "firstName", "token"]);
    }
}
