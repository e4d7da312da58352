use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Maximum accepted input length, in characters
pub const MAX_INPUT_LENGTH: usize = 1000;

pub const INJECTION_MESSAGE: &str = "Possible XSS attack detected";
pub const TOO_LONG_MESSAGE: &str = "Text is too long (maximum 1000 characters)";
pub const VALID_MESSAGE: &str = "Validation passed";

pub const EMAIL_MESSAGE: &str = "Enter a valid email address";
pub const PHONE_MESSAGE: &str = "Enter a valid phone number";
pub const PASSWORD_MESSAGE: &str =
    "Password must be at least 8 characters and include an uppercase letter, a lowercase letter and a digit";
pub const TEXT_MESSAGE: &str = "Text contains forbidden characters";

/// Characters removed by [`sanitize`]
pub const DANGEROUS_CHARS: [char; 5] = ['<', '>', '"', '\'', '&'];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("Valid regex pattern for input validation"))
        .collect()
}

lazy_static! {
    // Script tags, javascript: URIs, inline handlers and embedding tags
    static ref INJECTION_PATTERNS: Vec<Regex> = compile(&[
        r"(?i)<script[^>]*>",
        r"(?i)javascript:",
        r"(?i)on\w+\s*=",
        r"(?i)<iframe[^>]*>",
        r"(?i)<object[^>]*>",
        r"(?i)<embed[^>]*>",
    ]);

    static ref EMAIL_PATTERNS: Vec<Regex> =
        compile(&[r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$"]);

    static ref PHONE_PATTERNS: Vec<Regex> = compile(&[
        r"^(\+7|8)?[\s\-]?\(?[489][0-9]{2}\)?[\s\-]?[0-9]{3}[\s\-]?[0-9]{2}[\s\-]?[0-9]{2}$",
    ]);

    // charset and length, then one of each required class
    static ref PASSWORD_PATTERNS: Vec<Regex> = compile(&[
        r"^[a-zA-Z0-9@$!%*?&]{8,}$",
        r"[a-z]",
        r"[A-Z]",
        r"[0-9]",
    ]);

    static ref TEXT_PATTERNS: Vec<Regex> = compile(&[r#"^[^<>"'&]*$"#]);

    static ref DEFAULT_GUARD: InputGuard = InputGuard::new();
}

/// Kind of user input being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Email,
    Phone,
    Password,
    Text,
}

impl InputKind {
    pub const ALL: [InputKind; 4] = [
        InputKind::Email,
        InputKind::Phone,
        InputKind::Password,
        InputKind::Text,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Email => "email",
            InputKind::Phone => "phone",
            InputKind::Password => "password",
            InputKind::Text => "text",
        }
    }

    /// Map an HTML `<input type>` to the kind used for validation
    pub fn from_input_type(input_type: &str) -> Self {
        match input_type.to_ascii_lowercase().as_str() {
            "email" => InputKind::Email,
            "password" => InputKind::Password,
            "tel" => InputKind::Phone,
            _ => InputKind::Text,
        }
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(InputKind::Email),
            "phone" | "tel" => Ok(InputKind::Phone),
            "password" => Ok(InputKind::Password),
            "text" => Ok(InputKind::Text),
            other => Err(format!("unknown input kind: {other}")),
        }
    }
}

/// Kind-specific acceptance rule; every pattern must match
#[derive(Debug, Clone)]
pub struct ValidationRule {
    kind: InputKind,
    patterns: Vec<Regex>,
    message: &'static str,
}

impl ValidationRule {
    fn new(kind: InputKind, patterns: &[Regex], message: &'static str) -> Self {
        Self {
            kind,
            patterns: patterns.to_vec(),
            message,
        }
    }

    pub fn kind(&self) -> InputKind {
        self.kind
    }

    pub fn message(&self) -> &'static str {
        self.message
    }

    pub fn matches(&self, input: &str) -> bool {
        self.patterns.iter().all(|p| p.is_match(input))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Matched the injection denylist
    Injection,
    /// Did not match the kind-specific rule
    Format,
    TooLong,
}

/// Outcome of a single validation; rejections are values, never errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            message: VALID_MESSAGE.to_string(),
            reason: None,
        }
    }

    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            message: message.into(),
            reason: Some(reason),
        }
    }

    pub fn is_injection(&self) -> bool {
        self.reason == Some(RejectReason::Injection)
    }
}

/// Stateless input validator and sanitizer.
///
/// Validation order is fixed: injection denylist on the raw input, then the
/// kind rule, then the length bound.
#[derive(Debug, Clone)]
pub struct InputGuard {
    email: ValidationRule,
    phone: ValidationRule,
    password: ValidationRule,
    text: ValidationRule,
    injection_patterns: Vec<Regex>,
    max_length: usize,
}

impl Default for InputGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl InputGuard {
    pub fn new() -> Self {
        Self::with_max_length(MAX_INPUT_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            email: ValidationRule::new(InputKind::Email, &EMAIL_PATTERNS, EMAIL_MESSAGE),
            phone: ValidationRule::new(InputKind::Phone, &PHONE_PATTERNS, PHONE_MESSAGE),
            password: ValidationRule::new(
                InputKind::Password,
                &PASSWORD_PATTERNS,
                PASSWORD_MESSAGE,
            ),
            text: ValidationRule::new(InputKind::Text, &TEXT_PATTERNS, TEXT_MESSAGE),
            injection_patterns: INJECTION_PATTERNS.clone(),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn rule(&self, kind: InputKind) -> &ValidationRule {
        match kind {
            InputKind::Email => &self.email,
            InputKind::Phone => &self.phone,
            InputKind::Password => &self.password,
            InputKind::Text => &self.text,
        }
    }

    /// First denylist match in the raw input, if any
    pub fn detect_injection<'a>(&self, input: &'a str) -> Option<&'a str> {
        self.injection_patterns
            .iter()
            .find_map(|p| p.find(input))
            .map(|m| m.as_str())
    }

    pub fn validate(&self, input: &str, kind: InputKind) -> ValidationResult {
        if let Some(matched) = self.detect_injection(input) {
            // never log the raw input, it may be a password
            warn!(kind = %kind, pattern_len = matched.len(), "Injection attempt detected in input");
            return ValidationResult::rejected(RejectReason::Injection, INJECTION_MESSAGE);
        }

        let rule = self.rule(kind);
        if !rule.matches(input) {
            return ValidationResult::rejected(RejectReason::Format, rule.message());
        }

        if input.chars().count() > self.max_length {
            return ValidationResult::rejected(
                RejectReason::TooLong,
                format!("Text is too long (maximum {} characters)", self.max_length),
            );
        }

        ValidationResult::valid()
    }

    pub fn sanitize(&self, input: &str) -> String {
        sanitize_with_limit(input, self.max_length)
    }
}

/// Validate with the default guard
pub fn validate(input: &str, kind: InputKind) -> ValidationResult {
    DEFAULT_GUARD.validate(input, kind)
}

/// Strip `< > " ' &`, trim and bound to [`MAX_INPUT_LENGTH`] characters
pub fn sanitize(input: &str) -> String {
    sanitize_with_limit(input, MAX_INPUT_LENGTH)
}

/// [`sanitize`] with an explicit length bound.
///
/// Idempotent: the result never starts or ends with whitespace, so a second
/// pass changes nothing.
pub fn sanitize_with_limit(input: &str, max_length: usize) -> String {
    let stripped: String = input
        .chars()
        .filter(|c| !DANGEROUS_CHARS.contains(c))
        .collect();

    let truncated: String = stripped.trim().chars().take(max_length).collect();
    truncated.trim_end().to_string()
}
