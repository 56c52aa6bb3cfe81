pub mod cancel;
pub mod config;
pub mod error_classifier;
pub mod fees;
pub mod jobs;
pub mod mine;
pub mod nonce_ledger;
pub mod send;
pub mod store;
pub mod terminal;
pub mod usage;
pub mod webhook;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;

use relay_core::signer::TransactionSigner;

use crate::{
    config::RelayConfigProvider, jobs::JobProducer, nonce_ledger::NonceLedger,
    store::TransactionStore, usage::UsageReporter, webhook::TransactionNotifier,
};

/// The shared collaborators every pipeline stage works against.
#[derive(Clone)]
pub struct RelayServices {
    pub store: Arc<dyn TransactionStore>,
    pub ledger: Arc<dyn NonceLedger>,
    pub jobs: Arc<dyn JobProducer>,
    pub signer: Arc<dyn TransactionSigner>,
    pub notifier: Arc<dyn TransactionNotifier>,
    pub usage: Arc<dyn UsageReporter>,
    pub config: Arc<dyn RelayConfigProvider>,
}
