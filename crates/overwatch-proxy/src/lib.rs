/// The Overwatch proxy runtime.
///
/// - **Transport** (`transport`): framed JSON-RPC over byte streams with
///   size limits and resynchronization
/// - **Circuit breaker** (`circuit_breaker`): closed/open/half-open gating of
///   the upstream
/// - **Environment** (`env`): credential blocklist for child processes
/// - **Approval** (`approval`): webhook client, request signing, channel
///   handler
/// - **Proxy core** (`proxy`): the per-server relay and security pipeline
/// - **Orchestrator** (`orchestrator`): N cores from one configuration
pub mod approval;
pub mod circuit_breaker;
pub mod env;
pub mod orchestrator;
pub mod proxy;
pub mod transport;

pub use approval::{ChannelApprovalHandler, WebhookApprovalHandler, WebhookConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use orchestrator::{ClientTransportFactory, Orchestrator, OrchestratorStats};
pub use proxy::{ProxyCommand, ProxyCore, ProxyCoreConfig, ProxyDeps, ProxyEvent};
pub use transport::{FrameDecoder, FramedTransport, TransportLimits};
