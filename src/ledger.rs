// 📒 Settlement Ledger - Net payer → payee → amount table
//
// Every transfer folded into the ledger is netted against the opposite
// direction right away, so at no point do A → B and B → A coexist.

use crate::error::SettleError;
use crate::model::{Cents, Transfer};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

/// Nested document form of a ledger: payer → payee → cents
pub type SettlementDocument = BTreeMap<String, BTreeMap<String, Cents>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementLedger<K: Ord> {
    entries: BTreeMap<K, BTreeMap<K, Cents>>,
    /// Directed pairs currently present in `entries`
    seen: BTreeSet<(K, K)>,
}

impl<K: Ord + Clone> Default for SettlementLedger<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> SettlementLedger<K> {
    pub fn new() -> Self {
        SettlementLedger {
            entries: BTreeMap::new(),
            seen: BTreeSet::new(),
        }
    }

    /// Build a ledger by folding transfers in order
    pub fn from_transfers<I>(transfers: I) -> Result<Self, SettleError>
    where
        I: IntoIterator<Item = Transfer<K>>,
    {
        let mut ledger = SettlementLedger::new();
        ledger.fold_all(transfers)?;
        Ok(ledger)
    }

    /// Fold one transfer into the ledger, netting it against any debt that
    /// runs in the opposite direction.
    ///
    /// Self-transfers and non-positive amounts carry no debt and are ignored.
    /// A debt that would exceed the cents range fails with
    /// `SettleError::AmountOverflow` and leaves the ledger untouched.
    pub fn fold(&mut self, transfer: Transfer<K>) -> Result<(), SettleError> {
        let Transfer {
            payer,
            payee,
            amount_cents,
        } = transfer;
        if payer == payee || amount_cents <= 0 {
            return Ok(());
        }

        let reverse = (payee.clone(), payer.clone());
        if !self.seen.contains(&reverse) {
            return self.accumulate(payer, payee, amount_cents);
        }

        let existing = self.amount(&payee, &payer);
        if existing >= amount_cents {
            // absorbed by the opposite debt
            self.set(&payee, &payer, existing - amount_cents);
            Ok(())
        } else {
            self.set(&payee, &payer, 0);
            self.accumulate(payer, payee, amount_cents - existing)
        }
    }

    /// Fold transfers in order, stopping at the first overflow
    pub fn fold_all<I>(&mut self, transfers: I) -> Result<(), SettleError>
    where
        I: IntoIterator<Item = Transfer<K>>,
    {
        transfers.into_iter().try_for_each(|t| self.fold(t))
    }

    /// Amount `payer` owes `payee`, zero when absent
    pub fn amount(&self, payer: &K, payee: &K) -> Cents {
        self.entries
            .get(payer)
            .and_then(|payees| payees.get(payee))
            .copied()
            .unwrap_or(0)
    }

    /// Whether the directed pair `payer → payee` has an entry
    pub fn contains(&self, payer: &K, payee: &K) -> bool {
        self.seen.contains(&(payer.clone(), payee.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of directed debts in the ledger
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Number of distinct payers
    pub fn payer_count(&self) -> usize {
        self.entries.len()
    }

    /// Payees of one payer with the amounts owed
    pub fn payees(&self, payer: &K) -> Option<&BTreeMap<K, Cents>> {
        self.entries.get(payer)
    }

    /// All debts as transfers, ordered by payer then payee
    pub fn transfers(&self) -> impl Iterator<Item = Transfer<K>> + '_ {
        self.entries.iter().flat_map(|(payer, payees)| {
            payees.iter().map(move |(payee, amount)| Transfer {
                payer: payer.clone(),
                payee: payee.clone(),
                amount_cents: *amount,
            })
        })
    }

    /// Sum of all debts in the ledger, `None` on overflow
    pub fn total_cents(&self) -> Option<Cents> {
        self.entries
            .values()
            .flat_map(|p| p.values())
            .try_fold(0 as Cents, |acc, amount| acc.checked_add(*amount))
    }

    /// Render the ledger as a nested document, naming identities with `name`
    pub fn to_document<F>(&self, mut name: F) -> SettlementDocument
    where
        F: FnMut(&K) -> String,
    {
        let mut doc = SettlementDocument::new();
        for t in self.transfers() {
            doc.entry(name(&t.payer))
                .or_default()
                .insert(name(&t.payee), t.amount_cents);
        }
        doc
    }

    fn accumulate(&mut self, payer: K, payee: K, amount: Cents) -> Result<(), SettleError> {
        let total = self
            .amount(&payer, &payee)
            .checked_add(amount)
            .ok_or(SettleError::AmountOverflow)?;
        self.entries
            .entry(payer.clone())
            .or_default()
            .insert(payee.clone(), total);
        self.seen.insert((payer, payee));
        Ok(())
    }

    /// Overwrite a directed entry; zero removes it together with its marker
    fn set(&mut self, payer: &K, payee: &K, amount: Cents) {
        if amount > 0 {
            if let Some(slot) = self.entries.get_mut(payer).and_then(|p| p.get_mut(payee)) {
                *slot = amount;
            }
            return;
        }

        if let Some(payees) = self.entries.get_mut(payer) {
            payees.remove(payee);
            if payees.is_empty() {
                self.entries.remove(payer);
            }
        }
        self.seen.remove(&(payer.clone(), payee.clone()));
    }
}

impl<K: Ord + Serialize> Serialize for SettlementLedger<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(payer: &'static str, payee: &'static str, amount: Cents) -> Transfer<&'static str> {
        Transfer {
            payer,
            payee,
            amount_cents: amount,
        }
    }

    fn netted(transfers: Vec<Transfer<&'static str>>) -> SettlementLedger<&'static str> {
        SettlementLedger::from_transfers(transfers).unwrap()
    }

    fn assert_netting_invariant(ledger: &SettlementLedger<&'static str>) {
        for transfer in ledger.transfers() {
            assert!(transfer.amount_cents > 0);
            assert_ne!(transfer.payer, transfer.payee);
            assert!(!ledger.contains(&transfer.payee, &transfer.payer));
        }
        assert_eq!(ledger.len(), ledger.transfers().count());
    }

    #[test]
    fn test_accumulates_same_direction() {
        let ledger = netted(vec![t("C", "A", 2000), t("C", "A", 1500), t("B", "A", 2000)]);

        assert_eq!(ledger.amount(&"C", &"A"), 3500);
        assert_eq!(ledger.amount(&"B", &"A"), 2000);
        assert_eq!(ledger.len(), 2);
        assert_netting_invariant(&ledger);
    }

    #[test]
    fn test_reverse_partially_absorbs() {
        let ledger = netted(vec![t("A", "B", 1000), t("B", "A", 700)]);

        assert_eq!(ledger.amount(&"A", &"B"), 300);
        assert!(!ledger.contains(&"B", &"A"));
        assert_netting_invariant(&ledger);
    }

    #[test]
    fn test_reverse_exceeds_existing_flips_direction() {
        let ledger = netted(vec![t("A", "B", 700), t("B", "A", 1000)]);

        assert_eq!(ledger.amount(&"B", &"A"), 300);
        assert!(!ledger.contains(&"A", &"B"));
        assert_eq!(ledger.payees(&"A"), None);
        assert_netting_invariant(&ledger);
    }

    #[test]
    fn test_exact_cancellation_leaves_no_entry() {
        let ledger = netted(vec![t("A", "B", 500), t("B", "A", 500)]);

        assert!(ledger.is_empty());
        assert_eq!(ledger.len(), 0);
        assert!(!ledger.contains(&"A", &"B"));
        assert!(!ledger.contains(&"B", &"A"));
    }

    #[test]
    fn test_pair_reappears_after_cancellation() {
        let ledger = netted(vec![t("A", "B", 500), t("B", "A", 500), t("B", "A", 200)]);

        assert_eq!(ledger.amount(&"B", &"A"), 200);
        assert_eq!(ledger.len(), 1);
        assert_netting_invariant(&ledger);
    }

    #[test]
    fn test_invariant_holds_after_every_fold() {
        let transfers = vec![
            t("A", "B", 400),
            t("B", "C", 250),
            t("B", "A", 100),
            t("C", "B", 250),
            t("B", "A", 900),
            t("A", "C", 10),
            t("C", "A", 10),
            t("A", "B", 600),
        ];

        let mut ledger = SettlementLedger::new();
        for transfer in transfers {
            ledger.fold(transfer).unwrap();
            assert_netting_invariant(&ledger);
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_overflowing_debt_is_rejected() {
        let mut ledger = netted(vec![t("A", "B", Cents::MAX - 10)]);

        assert_eq!(ledger.fold(t("A", "B", 11)), Err(SettleError::AmountOverflow));
        assert_eq!(ledger.amount(&"A", &"B"), Cents::MAX - 10);
        assert_eq!(ledger.len(), 1);

        // netting first keeps the sum in range
        ledger.fold(t("B", "A", 100)).unwrap();
        ledger.fold(t("A", "B", 11)).unwrap();
        assert_eq!(ledger.amount(&"A", &"B"), Cents::MAX - 99);
    }

    #[test]
    fn test_total_cents_overflow() {
        let ledger = netted(vec![t("A", "B", Cents::MAX), t("C", "B", 1)]);
        assert_eq!(ledger.total_cents(), None);
    }

    #[test]
    fn test_ignores_self_and_empty_transfers() {
        let ledger = netted(vec![t("A", "A", 100), t("A", "B", 0)]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_document_and_serialization() {
        let ledger = netted(vec![t("bob", "alice", 2000), t("charlie", "alice", 3500)]);

        let doc = ledger.to_document(|k| k.to_uppercase());
        assert_eq!(doc["BOB"]["ALICE"], 2000);
        assert_eq!(doc["CHARLIE"]["ALICE"], 3500);

        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"bob": {"alice": 2000}, "charlie": {"alice": 3500}})
        );
        assert_eq!(ledger.total_cents(), Some(5500));
    }
}
