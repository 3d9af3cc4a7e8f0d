pub mod admission;
pub mod janitor;
pub mod lifecycle;
pub mod pool;
pub mod session;

pub use admission::{AdmissionController, AdmissionSettings};
pub use janitor::Janitor;
pub use lifecycle::{
    ClientContext, CommandContext, CommandError, CommandHandler, Effect, Gateway,
    GatewaySettings, GatewayStats, Outcome, RequestError,
};
pub use pool::{ExhaustedCause, PoolError, PoolSettings, PoolStats, PooledHandle, ResourcePool};
pub use session::{Login, Session, SessionError, SessionRegistry, SessionSettings};
