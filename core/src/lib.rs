pub mod chain;
pub mod error;
pub mod rpc_clients;
pub mod signer;
pub mod transaction;
