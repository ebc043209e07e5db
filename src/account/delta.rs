//! Serialized difference between the temp and base account stores.

use crate::account::AccountStoreError;
use crate::account::account::Account;
use crate::account::base::AccountStoreBase;
use crate::account::temp::AccountStoreTemp;
use crate::contract::storage::ContractStorage;
use crate::types::address::Address;
use shardchain_derive::BinaryCodec;

/// One touched account plus its contract-state writes and tombstones.
#[derive(BinaryCodec, Clone, Debug, PartialEq, Eq)]
pub struct AccountDelta {
    pub addr: Address,
    pub account: Account,
    /// Flat contract-state writes captured from the temp tier.
    pub states: Vec<(String, Vec<u8>)>,
    /// Tombstoned storage keys captured from the temp tier.
    pub deleted: Vec<String>,
}

/// The difference between the temp store and the base store.
#[derive(BinaryCodec, Clone, Debug, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub entries: Vec<AccountDelta>,
}

impl StateDelta {
    /// Captures `(temp − base)`: every account whose temp state differs from
    /// base, with contract accounts carrying their temp-tier storage writes.
    ///
    /// Entries are sorted by address for a deterministic encoding.
    pub fn build(
        temp: &AccountStoreTemp,
        base: &AccountStoreBase,
        contract_storage: &ContractStorage,
    ) -> Result<Self, AccountStoreError> {
        let mut touched: Vec<(Address, Account)> = Vec::new();
        for (addr, account) in temp.accounts() {
            let unchanged = matches!(base.peek_account(addr)?, Some(prior) if prior == *account);
            if !unchanged {
                touched.push((*addr, account.clone()));
            }
        }
        touched.sort_by_key(|(addr, _)| *addr);

        let mut entries = Vec::with_capacity(touched.len());
        for (addr, account) in touched {
            let (states, deleted) = if account.is_contract() {
                let (states, deleted) =
                    contract_storage.fetch_updated_state_values_for_address(&addr, true)?;
                (states.into_iter().collect(), deleted)
            } else {
                (Vec::new(), Vec::new())
            };
            entries.push(AccountDelta {
                addr,
                account,
                states,
                deleted,
            });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
