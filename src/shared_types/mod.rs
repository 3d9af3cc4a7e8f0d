pub mod auth_stage;
pub mod ids;
pub mod role;

pub use auth_stage::AuthStage;
pub use ids::{HandleId, SessionId, SessionToken};
pub use role::Role;
