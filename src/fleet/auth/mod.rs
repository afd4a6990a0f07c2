//! Authentication of freshly dialed device transports.
//!
//! Anything implementing [`AuthStrategy`] can log a user in; resolved
//! [`Credential`](super::secrets::Credential)s are the strategies used in
//! practice. An [`AuthChain`] offers several of them in order.

mod chain;
mod traits;

pub use chain::AuthChain;
pub use traits::AuthStrategy;
