//! Fee selection for first sends, resends and cancellation replacements.
//!
//! A replacement at the same nonce must pay more than the transaction it replaces, otherwise
//! nodes reject it as underpriced. Every replacement here is floored at `previous * 1.1 + 1`.

use relay_core::{
    chain::NetworkFees,
    transaction::{GasParams, TransactionRecord},
};

const MAX_RESEND_MULTIPLIER: u128 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeChoice {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl From<NetworkFees> for FeeChoice {
    fn from(fees: NetworkFees) -> Self {
        Self {
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        }
    }
}

impl From<GasParams> for FeeChoice {
    fn from(gas: GasParams) -> Self {
        Self {
            max_fee_per_gas: gas.max_fee_per_gas,
            max_priority_fee_per_gas: gas.max_priority_fee_per_gas,
        }
    }
}

impl FeeChoice {
    fn scaled(self, factor: u128) -> Self {
        Self {
            max_fee_per_gas: self.max_fee_per_gas.saturating_mul(factor),
            max_priority_fee_per_gas: self.max_priority_fee_per_gas.saturating_mul(factor),
        }
    }

    fn at_least(self, floor: FeeChoice) -> Self {
        let max_fee_per_gas = self.max_fee_per_gas.max(floor.max_fee_per_gas);
        Self {
            max_fee_per_gas,
            max_priority_fee_per_gas: self
                .max_priority_fee_per_gas
                .max(floor.max_priority_fee_per_gas)
                .min(max_fee_per_gas),
        }
    }
}

/// Minimum fee a node accepts for replacing a transaction paying `previous`.
pub fn replacement_floor(previous: u128) -> u128 {
    previous.saturating_add(previous / 10).saturating_add(1)
}

fn replacement_floor_for(record: &TransactionRecord) -> Option<FeeChoice> {
    record.sent_gas.map(|gas| FeeChoice {
        max_fee_per_gas: replacement_floor(gas.max_fee_per_gas),
        max_priority_fee_per_gas: replacement_floor(gas.max_priority_fee_per_gas),
    })
}

/// First send: caller overrides win, network fees fill the gaps.
pub fn first_send_fees(record: &TransactionRecord, network: NetworkFees) -> FeeChoice {
    let max_fee_per_gas = record.max_fee_per_gas.unwrap_or(network.max_fee_per_gas);
    FeeChoice {
        max_fee_per_gas,
        max_priority_fee_per_gas: record
            .max_priority_fee_per_gas
            .unwrap_or(network.max_priority_fee_per_gas)
            .min(max_fee_per_gas),
    }
}

/// Resend `resend_count` (>= 1): network fees scaled by `min(2k, 10)`, never below the
/// replacement floor of the previous broadcast.
pub fn resend_fees(record: &TransactionRecord, network: NetworkFees, resend_count: u32) -> FeeChoice {
    let factor = (2 * u128::from(resend_count)).clamp(1, MAX_RESEND_MULTIPLIER);
    let escalated = FeeChoice::from(network).scaled(factor);
    match replacement_floor_for(record) {
        Some(floor) => escalated.at_least(floor),
        None => escalated,
    }
}

/// Cancellation replacement: double the network fees, never below the replacement floor.
pub fn cancellation_fees(record: &TransactionRecord, network: NetworkFees) -> FeeChoice {
    let doubled = FeeChoice::from(network).scaled(2);
    match replacement_floor_for(record) {
        Some(floor) => doubled.at_least(floor),
        None => doubled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;
    use chrono::Utc;
    use relay_core::transaction::{GasParams, SubmitTransactionRequest};

    fn record() -> TransactionRecord {
        TransactionRecord::queued(
            "q".to_string(),
            SubmitTransactionRequest {
                chain_id: 1,
                from: Address::repeat_byte(1),
                to: Some(Address::repeat_byte(2)),
                data: Default::default(),
                value: Default::default(),
                gas: None,
                max_fee_per_gas: None,
                max_priority_fee_per_gas: None,
                user_operation: None,
                idempotency_key: None,
            },
            Utc::now(),
        )
    }

    fn network(max: u128, prio: u128) -> NetworkFees {
        NetworkFees {
            max_fee_per_gas: max,
            max_priority_fee_per_gas: prio,
        }
    }

    #[test]
    fn overrides_win_on_first_send() {
        let mut r = record();
        r.max_fee_per_gas = Some(500);
        let fees = first_send_fees(&r, network(100, 10));
        assert_eq!(fees.max_fee_per_gas, 500);
        assert_eq!(fees.max_priority_fee_per_gas, 10);
    }

    #[test]
    fn resend_multiplier_is_capped() {
        let r = record();
        assert_eq!(resend_fees(&r, network(100, 10), 1).max_fee_per_gas, 200);
        assert_eq!(resend_fees(&r, network(100, 10), 3).max_fee_per_gas, 600);
        assert_eq!(resend_fees(&r, network(100, 10), 9).max_fee_per_gas, 1000);
    }

    #[test]
    fn resend_never_drops_below_replacement_floor() {
        let mut r = record();
        r.sent_gas = Some(GasParams {
            gas_limit: 21_000,
            max_fee_per_gas: 1_000,
            max_priority_fee_per_gas: 100,
        });
        // network fell sharply since the last broadcast
        let fees = resend_fees(&r, network(10, 1), 1);
        assert_eq!(fees.max_fee_per_gas, 1_101);
        assert_eq!(fees.max_priority_fee_per_gas, 111);
    }

    #[test]
    fn successive_resends_are_monotonic() {
        let mut r = record();
        let mut previous = first_send_fees(&r, network(100, 10));
        for k in 1..=6 {
            r.sent_gas = Some(GasParams {
                gas_limit: 21_000,
                max_fee_per_gas: previous.max_fee_per_gas,
                max_priority_fee_per_gas: previous.max_priority_fee_per_gas,
            });
            let next = resend_fees(&r, network(100, 10), k);
            assert!(next.max_fee_per_gas > previous.max_fee_per_gas);
            assert!(next.max_priority_fee_per_gas > previous.max_priority_fee_per_gas);
            previous = next;
        }
    }

    #[test]
    fn cancellation_outbids_previous_broadcast() {
        let mut r = record();
        r.sent_gas = Some(GasParams {
            gas_limit: 21_000,
            max_fee_per_gas: 300,
            max_priority_fee_per_gas: 30,
        });
        let fees = cancellation_fees(&r, network(100, 10));
        assert_eq!(fees.max_fee_per_gas, 331);
        assert_eq!(fees.max_priority_fee_per_gas, 34);
    }
}
