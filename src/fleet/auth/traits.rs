//! Authentication strategy trait.

use async_trait::async_trait;
use russh::client;

use crate::fleet::session::SwitchClientHandler;

/// One way of authenticating a freshly dialed transport.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate `username`.
    ///
    /// `Ok(false)` means the server rejected the credential; `Err` means the
    /// attempt itself failed (unreadable key, transport error).
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SwitchClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
