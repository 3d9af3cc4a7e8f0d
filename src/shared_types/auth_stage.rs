/// Authentication state of a session.
///
/// A session starts out `Anonymous` and may move to `Authenticated` exactly
/// once. There is no way back: a session that should lose its identity is
/// removed from the registry instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    /// Created on first contact, no identity attached yet.
    Anonymous,

    /// A login (or an out-of-band token flow) attached a user to the session.
    Authenticated,
}

impl AuthStage {
    pub fn is_authenticated(self) -> bool {
        matches!(self, AuthStage::Authenticated)
    }
}
