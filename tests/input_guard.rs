use dinoguard::security::validation::{
    EMAIL_MESSAGE, INJECTION_MESSAGE, MAX_INPUT_LENGTH, PASSWORD_MESSAGE, PHONE_MESSAGE,
};
use dinoguard::security::{RejectReason, sanitize, validate};
use dinoguard::{InputGuard, InputKind};

const PAYLOADS: &[&str] = &[
    "<script>alert(1)</script>",
    "<SCRIPT SRC=//evil.example/x.js></SCRIPT>",
    "hello<script type=\"text/javascript\">steal()</script>",
    "<a href=\"javascript:alert(1)\">x</a>",
    "<img src=x onerror=alert(1)>",
    "<div onclick = 'go()'>",
    "<iframe src=\"//evil.example\"></iframe>",
    "<object data=x></object>",
    "<embed src=x>",
];

#[test]
fn test_injection_rejected_for_every_kind() {
    for payload in PAYLOADS {
        for kind in InputKind::ALL {
            let result = validate(payload, kind);
            assert!(!result.is_valid, "{kind}: {payload}");
            assert_eq!(result.message, INJECTION_MESSAGE, "{kind}: {payload}");
            assert_eq!(result.reason, Some(RejectReason::Injection));
        }
    }
}

#[test]
fn test_sanitize_is_idempotent() {
    let inputs = [
        "  plain text  ",
        "<a href=\"x\">hi</a>",
        "Tom & Jerry's \"show\"",
        " < > ",
        "\t\n",
        "",
        "ünïcödé <b>bold</b>",
    ];

    for input in inputs {
        let once = sanitize(input);
        assert_eq!(sanitize(&once), once, "{input:?}");
    }

    let long = format!("{}   {}", "a".repeat(MAX_INPUT_LENGTH - 2), "b".repeat(10));
    let once = sanitize(&long);
    assert_eq!(sanitize(&once), once);
    assert!(once.chars().count() <= MAX_INPUT_LENGTH);
}

#[test]
fn test_sanitize_strips_markup_characters() {
    let out = sanitize("<a href=\"x\">hi</a>");
    assert!(!out.contains(['<', '>', '"', '\'', '&']));
    assert_eq!(out, out.trim());
    assert_eq!(out, "a href=xhi/a");
}

#[test]
fn test_kind_rules() {
    assert!(validate("user@example.com", InputKind::Email).is_valid);

    let bad_email = validate("not-an-email", InputKind::Email);
    assert!(!bad_email.is_valid);
    assert_eq!(bad_email.message, EMAIL_MESSAGE);
    assert_eq!(bad_email.reason, Some(RejectReason::Format));

    assert!(validate("+7 (912) 345-67-89", InputKind::Phone).is_valid);
    assert_eq!(validate("12345", InputKind::Phone).message, PHONE_MESSAGE);

    assert!(validate("Secret123", InputKind::Password).is_valid);
    assert_eq!(validate("secret123", InputKind::Password).message, PASSWORD_MESSAGE);
    assert_eq!(validate("Sh0rt", InputKind::Password).message, PASSWORD_MESSAGE);
}

#[test]
fn test_length_checked_after_format() {
    let long_text = "a".repeat(MAX_INPUT_LENGTH + 1);
    let result = validate(&long_text, InputKind::Text);
    assert_eq!(result.reason, Some(RejectReason::TooLong));

    let at_limit = "a".repeat(MAX_INPUT_LENGTH);
    assert!(validate(&at_limit, InputKind::Text).is_valid);

    // a long malformed value reports the format problem first
    let long_bad = format!("{}<", "a".repeat(MAX_INPUT_LENGTH + 1));
    assert_eq!(
        validate(&long_bad, InputKind::Text).reason,
        Some(RejectReason::Format)
    );
}

#[test]
fn test_custom_length_bound() {
    let guard = InputGuard::with_max_length(10);
    assert!(guard.validate("short", InputKind::Text).is_valid);
    assert_eq!(
        guard.validate("definitely too long", InputKind::Text).reason,
        Some(RejectReason::TooLong)
    );
    assert_eq!(guard.sanitize("  abcdefghijklmnop  "), "abcdefghij");
}
