use std::collections::HashMap;

use relay_core::{
    chain::{ChainConfig, ChainService, RpcChain},
    error::EngineError,
};

/// Chains known at startup, one HTTP provider each.
pub struct ConfiguredChainService {
    chains: HashMap<u64, RpcChain>,
}

impl ConfiguredChainService {
    pub fn from_configs(configs: &[ChainConfig]) -> Result<Self, EngineError> {
        let chains = configs
            .iter()
            .map(|config| Ok((config.chain_id, config.to_chain()?)))
            .collect::<Result<HashMap<_, _>, EngineError>>()?;
        Ok(Self { chains })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[allow(refining_impl_trait)]
impl ChainService for ConfiguredChainService {
    fn get_chain(&self, chain_id: u64) -> Result<RpcChain, EngineError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| EngineError::RpcConfigError {
                message: format!("Chain {chain_id} is not configured"),
            })
    }
}
