use std::collections::HashMap;
use std::str::FromStr;

use alloy::{
    consensus::TypedTransaction,
    eips::eip2718::Encodable2718,
    network::{Ethereum, EthereumWallet, NetworkWallet},
    primitives::{Address, B256, Bytes},
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;

use crate::error::EngineError;

/// A signed, EIP-2718 encoded transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: B256,
    pub raw: Bytes,
}

/// Signs transactions on behalf of managed wallets.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign_transaction(
        &self,
        from: Address,
        tx: TypedTransaction,
    ) -> Result<SignedTransaction, EngineError>;
}

/// Signs with private keys held in process memory.
#[derive(Clone, Default)]
pub struct LocalSigner {
    wallets: HashMap<Address, EthereumWallet>,
}

impl LocalSigner {
    pub fn from_private_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, EngineError> {
        let mut wallets = HashMap::new();
        for key in keys {
            let signer =
                PrivateKeySigner::from_str(key.as_ref()).map_err(|e| EngineError::SigningError {
                    message: format!("Invalid private key: {e}"),
                })?;
            wallets.insert(signer.address(), EthereumWallet::from(signer));
        }
        Ok(Self { wallets })
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.wallets.keys()
    }
}

#[async_trait]
impl TransactionSigner for LocalSigner {
    async fn sign_transaction(
        &self,
        from: Address,
        tx: TypedTransaction,
    ) -> Result<SignedTransaction, EngineError> {
        let wallet = self
            .wallets
            .get(&from)
            .ok_or_else(|| EngineError::SigningError {
                message: format!("No signing key for {from}"),
            })?;

        let envelope = NetworkWallet::<Ethereum>::sign_transaction_from(wallet, from, tx)
            .await
            .map_err(|e| {
                tracing::error!(from = %from, error = ?e, "Error signing transaction");
                EngineError::SigningError {
                    message: e.to_string(),
                }
            })?;

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::TxEip1559;
    use alloy::primitives::{TxKind, U256};

    const KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn tx(nonce: u64) -> TypedTransaction {
        TypedTransaction::Eip1559(TxEip1559 {
            chain_id: 31337,
            nonce,
            gas_limit: 21_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Call(Address::repeat_byte(0x22)),
            value: U256::from(1),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn signs_for_known_wallets_only() {
        let signer = LocalSigner::from_private_keys(&[KEY]).unwrap();
        let from = *signer.addresses().next().unwrap();

        let signed = signer.sign_transaction(from, tx(0)).await.unwrap();
        assert!(!signed.raw.is_empty());
        assert_eq!(signed.hash, alloy::primitives::keccak256(&signed.raw));

        let err = signer
            .sign_transaction(Address::repeat_byte(0x99), tx(0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SigningError { .. }));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(LocalSigner::from_private_keys(&["0x1234"]).is_err());
    }
}
