use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chain::{ChainClient, Wallet};
use crate::ethereum::EthereumManager;
use crate::lightning::LightningClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyType {
    BitcoinLike,
    Liquid,
    Ether,
    Erc20,
}

impl CurrencyType {
    pub fn is_utxo_based(&self) -> bool {
        matches!(self, Self::BitcoinLike | Self::Liquid)
    }

    pub fn is_evm_based(&self) -> bool {
        matches!(self, Self::Ether | Self::Erc20)
    }
}

/// Everything the nursery can reach for one symbol. UTXO symbols carry a
/// chain client and wallet; EVM symbols an ethereum manager; Lightning
/// candidates are present where the symbol has nodes.
#[derive(Clone)]
pub struct Currency {
    pub symbol: String,
    pub currency_type: CurrencyType,
    pub chain_client: Option<Arc<dyn ChainClient>>,
    pub wallet: Option<Arc<dyn Wallet>>,
    pub ethereum: Option<EthereumManager>,
    pub lightning: Vec<Arc<dyn LightningClient>>,
}

impl Currency {
    pub fn utxo(
        symbol: impl Into<String>,
        currency_type: CurrencyType,
        chain_client: Arc<dyn ChainClient>,
        wallet: Arc<dyn Wallet>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            currency_type,
            chain_client: Some(chain_client),
            wallet: Some(wallet),
            ethereum: None,
            lightning: Vec::new(),
        }
    }

    pub fn evm(
        symbol: impl Into<String>,
        currency_type: CurrencyType,
        ethereum: EthereumManager,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            currency_type,
            chain_client: None,
            wallet: None,
            ethereum: Some(ethereum),
            lightning: Vec::new(),
        }
    }

    pub fn with_lightning(mut self, client: Arc<dyn LightningClient>) -> Self {
        self.lightning.push(client);
        self
    }
}

/// Immutable after `init`; readers need no lock.
#[derive(Clone, Default)]
pub struct CurrencyMap {
    currencies: HashMap<String, Currency>,
}

impl CurrencyMap {
    pub fn new(currencies: impl IntoIterator<Item = Currency>) -> Self {
        Self {
            currencies: currencies
                .into_iter()
                .map(|c| (c.symbol.clone(), c))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Currency> {
        self.currencies.get(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Currency> {
        self.currencies.values()
    }
}
