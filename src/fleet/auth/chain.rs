//! Ordered chain of authentication strategies.

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::fleet::session::SwitchClientHandler;

use super::traits::AuthStrategy;

/// Tries each strategy in insertion order; the first success wins.
#[derive(Default)]
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `strategy` after the ones already in the chain.
    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SwitchClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let Some(last) = self.strategies.len().checked_sub(1) else {
            return Err("no credential to offer".to_string());
        };

        let mut tried = Vec::with_capacity(self.strategies.len());
        for (position, strategy) in self.strategies.iter().enumerate() {
            debug!("Offering {} credential for {}", strategy.name(), username);
            tried.push(strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => return Ok(true),
                Ok(false) if last == 0 => return Ok(false),
                Ok(false) => {}
                Err(e) if position == last => return Err(e),
                Err(e) => debug!("{} credential unusable: {}", strategy.name(), e),
            }
        }

        Err(format!("device rejected {}", tried.join(", then ")))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
