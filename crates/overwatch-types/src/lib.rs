/// Shared types, traits, and errors for the Overwatch security proxy.
///
/// This crate is the foundation that the other Overwatch crates depend on.
/// It contains:
/// - **Trait contracts** (`traits`) that define the subsystem seams
/// - **Shared data records** (`records`) used across all subsystems
/// - **JSON-RPC message model** (`rpc`) and the proxy error codes
/// - **Configuration document types** (`config`)
/// - **Error types** (`errors`) for unified error handling
pub mod config;
pub mod errors;
pub mod records;
pub mod rpc;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use errors::OverwatchError;
pub use records::*;
pub use rpc::{JsonRpcError, JsonRpcMessage};
pub use traits::*;
