/// Security primitives for the Overwatch proxy.
///
/// - **Redaction** (`redact`): credential/PII scrubbing for strings and
///   structured values
/// - **Audit** (`audit`): append-only sinks with filtered query, stats, and
///   JSON/CSV/CEF export
/// - **Shadowing** (`shadowing`): tool fingerprinting, collision and mutation
///   detection, and the description scanner
pub mod audit;
pub mod redact;
pub mod shadowing;

pub use audit::{
    export_cef, export_csv, export_json, log_best_effort, InMemoryAuditSink, SqliteAuditStore,
};
pub use redact::Redactor;
pub use shadowing::{DetectorConfig, ShadowingDetector};
