//! Identity and session lifecycle for almsgate: the provider seam, the
//! per-client session store, and the adapter that turns provider events into
//! store updates. Keep the public surface thin and split implementation
//! across sub-modules.

mod adapter;
mod cache;
mod classify;
mod hosted;
mod local;
mod provider;
mod session;
mod store;

pub use adapter::SessionAdapter;
pub use cache::TokenCache;
pub use classify::{is_session_expiry_error, SESSION_EXPIRY_KEYWORDS};
pub use hosted::HostedIdentityProvider;
pub use local::LocalIdentityProvider;
pub use provider::{AuthChange, AuthEvent, ClientChannels, IdentityProvider, ProviderError};
pub use session::{gen_token, AuthSession};
pub use store::{AuthState, AuthStore};
