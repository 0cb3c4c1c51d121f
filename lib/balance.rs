//! Single-address balance lookups at a historical height

use std::sync::Arc;

use crate::{
    types::{Balance, StacksAddress, Token},
    upstream::{BalanceIndexer, Error},
};

#[derive(Clone)]
pub struct BalanceFetcher {
    indexer: Arc<dyn BalanceIndexer>,
    token: Token,
}

impl BalanceFetcher {
    pub fn new(indexer: Arc<dyn BalanceIndexer>, token: Token) -> Self {
        Self { indexer, token }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub async fn try_fetch(
        &self,
        address: &StacksAddress,
        height: Option<u64>,
    ) -> Result<Balance, Error> {
        let raw = self.indexer.balance(address, &self.token, height).await?;
        Ok(Balance::from_base_units(
            raw.balance,
            raw.locked,
            self.token.decimals(),
        ))
    }

    /// Balance-unknown is treated as balance-zero: a voter whose balance
    /// cannot be determined contributes no weight rather than failing the
    /// tally.
    pub async fn fetch(
        &self,
        address: &StacksAddress,
        height: Option<u64>,
    ) -> Balance {
        match self.try_fetch(address, height).await {
            Ok(balance) => balance,
            Err(err) => {
                tracing::warn!(
                    %address,
                    ?height,
                    error = %err,
                    "balance lookup failed, counting as zero"
                );
                Balance::default()
            }
        }
    }
}
