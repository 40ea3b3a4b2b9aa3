//! Environment sanitization for upstream child processes.
//!
//! The child inherits the parent environment minus a blocklist of
//! credential-bearing variable names. Variables the operator explicitly set
//! in the server's config are merged in afterwards, unfiltered.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

/// Name patterns that never reach a child process.
const BLOCKLIST_PATTERNS: &[&str] = &[
    // Vendor API credentials.
    r"(?i)^AWS_(SECRET_ACCESS_KEY|SESSION_TOKEN|ACCESS_KEY_ID)$",
    r"(?i)^(GITHUB|GH|GITLAB|CI_JOB)_TOKEN$",
    r"(?i)^(OPENAI|ANTHROPIC|GOOGLE|GEMINI|COHERE|MISTRAL)_API_KEY$",
    r"(?i)^STRIPE_(SECRET|API|RESTRICTED)_KEY$",
    r"(?i)^SLACK_(BOT_|APP_|USER_)?TOKEN$",
    r"(?i)^(NPM|PYPI|CARGO_REGISTRY)_TOKEN$",
    r"(?i)^(TWILIO_AUTH_TOKEN|SENDGRID_API_KEY|MAILCHIMP_API_KEY|HEROKU_API_KEY|FIREBASE_TOKEN|DIGITALOCEAN_(ACCESS_)?TOKEN)$",
    // Database URLs carry embedded credentials.
    r"(?i)^(DATABASE|POSTGRES(QL)?|MYSQL|MONGO(DB)?|REDIS|AMQP)_(URL|URI|DSN|CONNECTION_STRING|PASSWORD)$",
    // Web session and signing material.
    r"(?i)^(JWT|SESSION|AUTH|COOKIE|CSRF|SIGNING)_(SECRET|KEY|TOKEN)$",
    // Generic suffixes.
    r"(?i)_(SECRET|PASSWORD|PRIVATE_KEY|API_KEY|ACCESS_TOKEN|REFRESH_TOKEN)$",
    // Generic prefixes.
    r"(?i)^(SECRET|PASSWORD|CREDENTIAL|PRIVATE)_",
];

fn blocklist() -> &'static Vec<Regex> {
    static COMPILED: OnceLock<Vec<Regex>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        BLOCKLIST_PATTERNS
            .iter()
            .map(|p| {
                Regex::new(p).unwrap_or_else(|e| panic!("invalid env blocklist regex '{p}': {e}"))
            })
            .collect()
    })
}

/// Whether a variable name is on the blocklist.
pub fn is_blocked(name: &str) -> bool {
    blocklist().iter().any(|r| r.is_match(name))
}

/// Filter a base environment through the blocklist, then merge operator
/// overrides unfiltered. Operator intent wins over the blocklist.
pub fn sanitize_env<I>(base: I, overrides: &HashMap<String, String>) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: HashMap<String, String> = base
        .into_iter()
        .filter(|(name, _)| {
            let blocked = is_blocked(name);
            if blocked {
                debug!(var = %name, "dropping credential-bearing variable from child env");
            }
            !blocked
        })
        .collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// The process environment, sanitized, with overrides merged in.
pub fn inherited_environment(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    sanitize_env(std::env::vars(), overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(vars: &[(&str, &str)]) -> Vec<(String, String)> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_vendor_credentials_blocked() {
        for name in [
            "AWS_SECRET_ACCESS_KEY",
            "AWS_SESSION_TOKEN",
            "GITHUB_TOKEN",
            "GITLAB_TOKEN",
            "OPENAI_API_KEY",
            "ANTHROPIC_API_KEY",
            "STRIPE_SECRET_KEY",
            "SLACK_BOT_TOKEN",
            "NPM_TOKEN",
            "TWILIO_AUTH_TOKEN",
            "SENDGRID_API_KEY",
            "HEROKU_API_KEY",
        ] {
            assert!(is_blocked(name), "{name} should be blocked");
        }
    }

    #[test]
    fn test_database_urls_blocked() {
        for name in [
            "DATABASE_URL",
            "POSTGRES_URL",
            "POSTGRESQL_DSN",
            "MYSQL_URI",
            "MONGODB_CONNECTION_STRING",
            "REDIS_PASSWORD",
        ] {
            assert!(is_blocked(name), "{name} should be blocked");
        }
    }

    #[test]
    fn test_generic_suffixes_and_prefixes_blocked() {
        for name in [
            "MYAPP_SECRET",
            "DB_PASSWORD",
            "SSH_PRIVATE_KEY",
            "SERVICE_API_KEY",
            "OAUTH_ACCESS_TOKEN",
            "OAUTH_REFRESH_TOKEN",
            "SECRET_SAUCE",
            "PASSWORD_FILE",
            "CREDENTIAL_PATH",
            "PRIVATE_CONFIG",
            "JWT_SECRET",
            "SESSION_KEY",
        ] {
            assert!(is_blocked(name), "{name} should be blocked");
        }
    }

    #[test]
    fn test_benign_variables_pass() {
        for name in ["PATH", "HOME", "LANG", "TERM", "LOG_LEVEL", "RUST_LOG", "PORT"] {
            assert!(!is_blocked(name), "{name} should pass");
        }
    }

    #[test]
    fn test_sanitize_filters_and_keeps() {
        let env = sanitize_env(
            base(&[
                ("PATH", "/usr/bin"),
                ("AWS_SECRET_ACCESS_KEY", "shh"),
                ("LOG_LEVEL", "debug"),
                ("MYAPP_SECRET", "shh"),
            ]),
            &HashMap::new(),
        );
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!env.contains_key("MYAPP_SECRET"));
    }

    #[test]
    fn test_operator_overrides_bypass_blocklist() {
        let mut overrides = HashMap::new();
        overrides.insert("MYAPP_SECRET".to_string(), "intended".to_string());
        overrides.insert("EXTRA".to_string(), "1".to_string());

        let env = sanitize_env(base(&[("MYAPP_SECRET", "inherited")]), &overrides);
        // The inherited copy is dropped; the operator's copy is merged in.
        assert_eq!(env.get("MYAPP_SECRET").map(String::as_str), Some("intended"));
        assert_eq!(env.get("EXTRA").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_overrides_replace_inherited_values() {
        let mut overrides = HashMap::new();
        overrides.insert("LOG_LEVEL".to_string(), "trace".to_string());
        let env = sanitize_env(base(&[("LOG_LEVEL", "info")]), &overrides);
        assert_eq!(env.get("LOG_LEVEL").map(String::as_str), Some("trace"));
    }
}
