use std::time::Duration;

use relay_core::error::EngineError;
use serde::{Deserialize, Serialize};

/// Why a node refused `eth_sendRawTransaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastErrorKind {
    /// The nonce is already used on chain.
    NonceTooLow,
    /// The ledger is ahead of the chain.
    NonceTooHigh,
    /// The node already has this exact transaction.
    AlreadyKnown,
    /// Another transaction at this nonce pays more.
    ReplacementUnderpriced,
    InsufficientFunds,
    GasError,
    PoolLimitExceeded,
    /// Any other error response from the node.
    Rejected,
    /// No response: timeouts, connection failures, HTTP errors.
    Transport,
}

/// What the send stage does after a failed broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryStrategy {
    /// The transaction reached, or may have reached, the mempool.
    pub treat_as_sent: bool,
    /// First send only: put the nonce back into circulation (recycle and drop from in-flight).
    pub release_nonce: bool,
    /// First send only: drop the nonce from in-flight without recycling it.
    pub discard_nonce: bool,
    /// Re-read the chain's transaction count into the ledger.
    pub needs_resync: bool,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ClassifiedBroadcastError {
    pub kind: BroadcastErrorKind,
    pub message: String,
}

/// Maps RPC errors from broadcasts to actionable kinds.
pub struct BroadcastErrorClassifier;

impl BroadcastErrorClassifier {
    pub fn classify(error: &EngineError) -> ClassifiedBroadcastError {
        if let Some(resp) = error.rpc_error_response() {
            return ClassifiedBroadcastError {
                kind: Self::classify_message(&resp.message),
                message: resp.message.clone(),
            };
        }

        let kind = match error {
            EngineError::RpcError { .. } | EngineError::BundlerError { .. } => {
                BroadcastErrorKind::Transport
            }
            _ => BroadcastErrorKind::Rejected,
        };
        ClassifiedBroadcastError {
            kind,
            message: error.to_string(),
        }
    }

    /// Clients disagree on error codes, so classification is by message.
    fn classify_message(message: &str) -> BroadcastErrorKind {
        let msg = message.to_lowercase();

        if msg.contains("nonce too low") || msg.contains("nonce has already been used") {
            BroadcastErrorKind::NonceTooLow
        } else if msg.contains("nonce too high") {
            BroadcastErrorKind::NonceTooHigh
        } else if msg.contains("already known") || msg.contains("already imported") {
            BroadcastErrorKind::AlreadyKnown
        } else if msg.contains("underpriced") {
            BroadcastErrorKind::ReplacementUnderpriced
        } else if msg.contains("insufficient funds") {
            BroadcastErrorKind::InsufficientFunds
        } else if msg.contains("gas") {
            BroadcastErrorKind::GasError
        } else if msg.contains("txpool") || msg.contains("pool limit") || msg.contains("pool is full") {
            BroadcastErrorKind::PoolLimitExceeded
        } else {
            BroadcastErrorKind::Rejected
        }
    }

    pub fn recovery_strategy(kind: BroadcastErrorKind) -> RecoveryStrategy {
        let retry = |release_nonce: bool, secs: u64| RecoveryStrategy {
            treat_as_sent: false,
            release_nonce,
            discard_nonce: false,
            needs_resync: false,
            retry_delay: Duration::from_secs(secs),
        };

        match kind {
            BroadcastErrorKind::AlreadyKnown => RecoveryStrategy {
                treat_as_sent: true,
                ..retry(false, 0)
            },
            BroadcastErrorKind::NonceTooLow => RecoveryStrategy {
                discard_nonce: true,
                needs_resync: true,
                ..retry(false, 1)
            },
            BroadcastErrorKind::NonceTooHigh => RecoveryStrategy {
                needs_resync: true,
                ..retry(true, 10)
            },
            // something unknown already occupies this nonce; keep it out of circulation
            BroadcastErrorKind::ReplacementUnderpriced => RecoveryStrategy {
                discard_nonce: true,
                ..retry(false, 10)
            },
            BroadcastErrorKind::InsufficientFunds => retry(true, 60),
            BroadcastErrorKind::GasError => retry(true, 30),
            BroadcastErrorKind::PoolLimitExceeded => retry(true, 30),
            BroadcastErrorKind::Rejected => retry(true, 10),
            // the node may have accepted it; the mine stage finds it or resends at this nonce
            BroadcastErrorKind::Transport => RecoveryStrategy {
                treat_as_sent: true,
                ..retry(false, 0)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::error::{RpcErrorKind, RpcErrorResponse};

    fn node_error(message: &str) -> EngineError {
        EngineError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            message: message.to_string(),
            kind: RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: -32000,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    #[test]
    fn nonce_too_low_discards_and_resyncs() {
        let classified = BroadcastErrorClassifier::classify(&node_error("nonce too low: next nonce 5"));
        assert_eq!(classified.kind, BroadcastErrorKind::NonceTooLow);

        let strategy = BroadcastErrorClassifier::recovery_strategy(classified.kind);
        assert!(strategy.discard_nonce);
        assert!(!strategy.release_nonce);
        assert!(strategy.needs_resync);
    }

    #[test]
    fn already_known_counts_as_sent() {
        let classified = BroadcastErrorClassifier::classify(&node_error("already known"));
        assert_eq!(classified.kind, BroadcastErrorKind::AlreadyKnown);
        assert!(BroadcastErrorClassifier::recovery_strategy(classified.kind).treat_as_sent);
    }

    #[test]
    fn funding_problems_release_the_nonce() {
        let classified = BroadcastErrorClassifier::classify(&node_error(
            "insufficient funds for gas * price + value",
        ));
        assert_eq!(classified.kind, BroadcastErrorKind::InsufficientFunds);

        let strategy = BroadcastErrorClassifier::recovery_strategy(classified.kind);
        assert!(strategy.release_nonce);
        assert_eq!(strategy.retry_delay, Duration::from_secs(60));
    }

    #[test]
    fn underpriced_replacement_is_recognised() {
        let classified =
            BroadcastErrorClassifier::classify(&node_error("replacement transaction underpriced"));
        assert_eq!(classified.kind, BroadcastErrorKind::ReplacementUnderpriced);
    }

    #[test]
    fn transport_failures_are_assumed_broadcast() {
        let err = EngineError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            message: "connection refused".to_string(),
            kind: RpcErrorKind::OtherTransportError {
                message: "connection refused".to_string(),
            },
        };
        let classified = BroadcastErrorClassifier::classify(&err);
        assert_eq!(classified.kind, BroadcastErrorKind::Transport);

        let strategy = BroadcastErrorClassifier::recovery_strategy(classified.kind);
        assert!(strategy.treat_as_sent);
        assert!(!strategy.release_nonce);
    }
}
