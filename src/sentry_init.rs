use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;
use tracing::info;

// Pre-compiled scrubbing patterns (compiled once, used many times)
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b")
        .expect("Invalid email regex pattern")
});
// Label images travel as base64; anything this long is payload, not prose
static PAYLOAD_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(data:[a-z]+/[a-z0-9.+-]+;base64,)?[A-Za-z0-9+/]{64,}={0,2}")
        .expect("Invalid payload regex pattern")
});
static HOME_PATH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(/home/|/Users/|C:\\Users\\)[^/\\\s]+")
        .expect("Invalid home path regex pattern")
});

/// Initialize Sentry crash reporting
///
/// # Environment Variables
/// - `SENTRY_DSN`: Sentry Data Source Name (required)
/// - `SENTRY_ENVIRONMENT`: Environment name (default: "development")
/// - `SENTRY_RELEASE`: Release version (default: from Cargo.toml)
/// - `SENTRY_TRACES_SAMPLE_RATE`: Performance monitoring sample rate (default: 0.1)
///
/// The returned guard must be kept alive for the lifetime of the process.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("Sentry DSN not configured - crash reporting disabled");
            return None;
        }
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });
    let traces_sample_rate = env::var("SENTRY_TRACES_SAMPLE_RATE")
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .unwrap_or(0.1);

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            traces_sample_rate,
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    info!(
        "Sentry crash reporting initialized (environment: {})",
        guard.options().environment.as_deref().unwrap_or("unknown")
    );

    Some(guard)
}

/// Scrub label contents and local identifiers before an event leaves the machine.
fn before_send_filter(mut event: sentry::protocol::Event<'static>) -> Option<sentry::protocol::Event<'static>> {
    if let Some(message) = event.message.as_mut() {
        *message = scrub_message(message);
    }

    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = scrub_message(value);
        }
    }

    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = scrub_message(message);
        }
    }

    event.tags.insert("spooler_version".into(), env!("CARGO_PKG_VERSION").into());
    event.tags.insert("platform".into(), std::env::consts::OS.into());
    event.tags.insert("arch".into(), std::env::consts::ARCH.into());

    Some(event)
}

fn scrub_message(message: &str) -> String {
    let mut cleaned = PAYLOAD_REGEX.replace_all(message, "[PAYLOAD_REDACTED]").to_string();
    cleaned = EMAIL_REGEX.replace_all(&cleaned, "[EMAIL_REDACTED]").to_string();
    cleaned = HOME_PATH_REGEX.replace_all(&cleaned, "${1}[USER]").to_string();
    cleaned
}

/// Report a job that ended in `Error`.
pub fn capture_job_failure(job_id: u64, error: &str) {
    sentry::with_scope(
        |scope| {
            scope.set_tag("event_type", "print_job_failure");
            scope.set_tag("job_id", job_id.to_string());
        },
        || {
            sentry::capture_message(
                &format!("Print job failed: {}", scrub_message(error)),
                sentry::Level::Error,
            );
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_base64_payload() {
        let payload = "iVBORw0KGgo".repeat(10);
        let message = format!("Failed to decode image: {}", payload);
        let cleaned = scrub_message(&message);
        assert!(!cleaned.contains("iVBORw0KGgo"));
        assert!(cleaned.contains("[PAYLOAD_REDACTED]"));
        assert!(cleaned.starts_with("Failed to decode image: "));
    }

    #[test]
    fn test_scrub_data_url() {
        let message = format!("bad frame data:image/png;base64,{}==", "A".repeat(80));
        let cleaned = scrub_message(&message);
        assert_eq!(cleaned, "bad frame [PAYLOAD_REDACTED]");
    }

    #[test]
    fn test_short_tokens_survive() {
        let message = "lp exited with exit status: 1: lp: The printer or class does not exist.";
        assert_eq!(scrub_message(message), message);
    }

    #[test]
    fn test_scrub_email_and_home_path() {
        let cleaned = scrub_message("owner jane@example.com, config /home/jane/.config/label-spooler");
        assert!(cleaned.contains("[EMAIL_REDACTED]"));
        assert!(cleaned.contains("/home/[USER]/.config"));
        assert!(!cleaned.contains("jane"));
    }

    #[test]
    fn test_capture_without_client_is_noop() {
        capture_job_failure(7, "Render failed: corrupt image");
    }
}
