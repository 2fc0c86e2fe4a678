//! Local key and session stores layered over a [`CredentialStore`].
//!
//! [`CredentialStore`]: tinderbox_crypto::CredentialStore

mod long_term;
mod one_time;
mod session;

pub use long_term::LongTermKeyStore;
pub use one_time::{OneTimeKeyScope, OneTimeKeyStore};
pub(crate) use session::SessionBinding;
pub use session::{SessionStore, DEFAULT_SESSION_NAME};
