/// Policy evaluation and session grants for the Overwatch proxy.
///
/// - **Engine** (`engine`): validate → compile → evaluate declarative rule
///   sets, with glob pattern caching and name-based risk inference
/// - **Reload** (`reload`): debounced file watching with atomic set swap
/// - **Sessions** (`session`, `session_store`): scoped, expiring, revocable
///   approval grants with usage tracking and SQLite persistence
pub mod engine;
pub mod reload;
pub mod session;
pub mod session_store;

pub use engine::{validate_config, Decision, DecisionAction, PolicyEngine};
pub use reload::{watch_policy_file, PolicyWatcher, ReloadEvent};
pub use session::{
    start_cleanup_task, CreateGrantOptions, GrantDuration, GrantScope, SessionCache, SessionGrant,
};
pub use session_store::SqliteSessionStore;
