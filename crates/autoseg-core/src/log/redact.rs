//! Secret redaction for log output.
//!
//! The job token must never reach the supervisor's log in full, and the
//! worker's captured output is echoed as diagnostics on failure, so both go
//! through this module before being emitted.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// The replacement text for redacted secrets.
const REDACTED: &str = "[REDACTED]";

/// Characters revealed at each end of a masked token.
const MASK_REVEAL: usize = 4;

/// Patterns that match credentials storage tools and HTTP clients tend to
/// print.
static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Authorization headers
        r"(?i)bearer\s+[a-zA-Z0-9_.=-]+",
        // Google OAuth access tokens
        r"ya29\.[0-9A-Za-z_-]{20,}",
        // JSON web tokens
        r"eyJ[a-zA-Z0-9_-]{8,}\.[a-zA-Z0-9_-]{8,}\.[a-zA-Z0-9_-]+",
        // AWS access keys
        r"AKIA[A-Z0-9]{16}",
        // token=..., api_key: ..., password=...
        r#"(?i)(access[_-]?token|auth[_-]?token|api[_-]?key|secret|password)['"]?\s*[:=]\s*['"]?[^\s'"]{8,}['"]?"#,
        // PEM private key headers
        r"-----BEGIN\s+(RSA\s+)?PRIVATE\s+KEY-----",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid secret pattern"))
    .collect()
});

/// Scrubs credentials out of text bound for logs or error diagnostics.
///
/// # Example
///
/// ```
/// use autoseg_core::log::SecretRedactor;
///
/// let redactor = SecretRedactor::new().with_literal("s3cr3t-job-token");
/// let output = redactor.redact("fetching with s3cr3t-job-token");
/// assert_eq!(output, "fetching with [REDACTED]");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SecretRedactor {
    /// Exact secrets known for this job.
    literals: Vec<Regex>,
}

impl SecretRedactor {
    /// Redactor with only the built-in credential patterns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also redact every occurrence of `secret` verbatim. Empty secrets are
    /// ignored.
    #[must_use]
    pub fn with_literal(mut self, secret: &str) -> Self {
        if !secret.is_empty() {
            // An escaped literal is always a valid pattern.
            if let Ok(regex) = Regex::new(&regex::escape(secret)) {
                self.literals.push(regex);
            }
        }
        self
    }

    /// Replace every job literal and pattern match with `[REDACTED]`.
    ///
    /// Borrows `input` unchanged when nothing matches.
    #[must_use]
    pub fn redact<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut result = Cow::Borrowed(input);

        for regex in self.literals.iter().chain(SECRET_PATTERNS.iter()) {
            if regex.is_match(&result) {
                result = Cow::Owned(regex.replace_all(&result, REDACTED).into_owned());
            }
        }

        result
    }
}

/// Mask a token for display, keeping a short prefix and suffix.
///
/// Tokens too short to hide anything after revealing both ends are masked
/// entirely.
#[must_use]
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= MASK_REVEAL * 2 {
        return "****".to_string();
    }
    let head: String = chars[..MASK_REVEAL].iter().collect();
    let tail: String = chars[chars.len() - MASK_REVEAL..].iter().collect();
    format!("{head}…{tail}")
}
