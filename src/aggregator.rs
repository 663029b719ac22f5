// 🧮 Trip Aggregator - Fold every event of a trip into one net ledger

use crate::error::SettleError;
use crate::ledger::SettlementLedger;
use crate::model::ExpenseEvent;
use crate::settler::EventSettler;
use std::fmt::Debug;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct TripAggregator {
    settler: EventSettler,
}

impl TripAggregator {
    pub fn new() -> Self {
        TripAggregator {
            settler: EventSettler::new(),
        }
    }

    /// Settle every event in order and net the results into a fresh ledger.
    ///
    /// Fails on the first malformed event, or with `AmountOverflow` when the
    /// debts between two people outgrow the cents range. No ledger is
    /// returned in either case.
    pub fn close<'a, K, I>(&self, events: I) -> Result<SettlementLedger<K>, SettleError>
    where
        K: Ord + Clone + Debug + 'a,
        I: IntoIterator<Item = &'a ExpenseEvent<K>>,
    {
        let mut ledger = SettlementLedger::new();

        for (index, event) in events.into_iter().enumerate() {
            let transfers = self
                .settler
                .settle(event)
                .map_err(|source| SettleError::InvalidEvent {
                    index,
                    source: Box::new(source),
                })?;
            debug!(event = index, transfers = transfers.len(), "folding event into ledger");
            ledger.fold_all(transfers)?;
        }

        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cents;

    fn event(entries: &[(&'static str, Cents)]) -> ExpenseEvent<&'static str> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_single_event_trip() {
        let events = vec![event(&[("A", 6000), ("B", 0), ("C", 0)])];
        let ledger = TripAggregator::new().close(&events).unwrap();

        assert_eq!(ledger.amount(&"B", &"A"), 2000);
        assert_eq!(ledger.amount(&"C", &"A"), 2000);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_debts_to_same_payee_combine() {
        let events = vec![
            event(&[("A", 6000), ("B", 0), ("C", 0)]),
            event(&[("A", 3000), ("C", 0)]),
        ];
        let ledger = TripAggregator::new().close(&events).unwrap();

        assert_eq!(ledger.amount(&"B", &"A"), 2000);
        assert_eq!(ledger.amount(&"C", &"A"), 3500);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_reciprocal_debts_are_netted() {
        // A owes B 1000, then B owes A 700
        let events = vec![event(&[("A", 0), ("B", 2000)]), event(&[("A", 1400), ("B", 0)])];
        let ledger = TripAggregator::new().close(&events).unwrap();

        assert_eq!(ledger.amount(&"A", &"B"), 300);
        assert!(!ledger.contains(&"B", &"A"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_exact_reciprocal_cancellation() {
        let events = vec![event(&[("A", 0), ("B", 1000)]), event(&[("A", 1000), ("B", 0)])];
        let ledger = TripAggregator::new().close(&events).unwrap();

        assert!(ledger.is_empty());
    }

    #[test]
    fn test_seven_person_trip() {
        let lodging = event(&[
            ("alice", 41500),
            ("bob", 0),
            ("charlie", 0),
            ("david", 0),
            ("elise", 0),
            ("fred", 0),
            ("greg", 2500),
        ]);
        let dinner = event(&[("elise", 0), ("david", 10800), ("fred", 0), ("greg", 0)]);
        let lunch_1 = event(&[("alice", 0), ("bob", 0), ("charlie", 5900)]);
        let lunch_2 = event(&[("david", 7000), ("elise", 0), ("fred", 0), ("greg", 0)]);

        let ledger = TripAggregator::new()
            .close(&[lodging, dinner, lunch_1, lunch_2])
            .unwrap();

        assert_eq!(ledger.payer_count(), 6);
        assert_eq!(ledger.amount(&"bob", &"alice"), 6286);
        assert_eq!(ledger.amount(&"bob", &"charlie"), 1967);
        assert_eq!(ledger.amount(&"charlie", &"alice"), 4320);
        assert_eq!(ledger.amount(&"david", &"alice"), 6286);
        assert_eq!(ledger.amount(&"elise", &"alice"), 6286);
        assert_eq!(ledger.amount(&"elise", &"david"), 4450);
        assert_eq!(ledger.amount(&"fred", &"alice"), 6286);
        assert_eq!(ledger.amount(&"fred", &"david"), 4450);
        assert_eq!(ledger.amount(&"greg", &"alice"), 3784);
        assert_eq!(ledger.amount(&"greg", &"david"), 4450);
        assert!(!ledger.contains(&"alice", &"charlie"));
    }

    #[test]
    fn test_net_balances_independent_of_event_order() {
        let events = vec![
            event(&[("A", 0), ("B", 2000)]),
            event(&[("A", 1400), ("B", 0)]),
            event(&[("A", 900), ("B", 0), ("C", 0)]),
            event(&[("C", 5000), ("B", 0)]),
        ];
        let reversed: Vec<_> = events.iter().rev().cloned().collect();

        let aggregator = TripAggregator::new();
        let forward = aggregator.close(&events).unwrap();
        let backward = aggregator.close(&reversed).unwrap();

        assert_eq!(forward.to_document(|k| k.to_string()), backward.to_document(|k| k.to_string()));
    }

    #[test]
    fn test_close_is_deterministic() {
        let events = vec![
            event(&[("A", 1000), ("B", 1000), ("C", 0), ("D", 0)]),
            event(&[("D", 333), ("B", 0), ("C", 0)]),
        ];

        let aggregator = TripAggregator::new();
        assert_eq!(aggregator.close(&events).unwrap(), aggregator.close(&events).unwrap());
    }

    #[test]
    fn test_empty_trip_has_empty_ledger() {
        let events: Vec<ExpenseEvent<&str>> = vec![];
        assert!(TripAggregator::new().close(&events).unwrap().is_empty());
    }

    #[test]
    fn test_accumulated_debt_overflow_is_an_error() {
        // every event is valid on its own, the third pushes B's debt past i64
        let big = event(&[("A", Cents::MAX - 1), ("B", 0)]);

        let err = TripAggregator::new()
            .close(&[big.clone(), big.clone(), big])
            .unwrap_err();
        assert_eq!(err, SettleError::AmountOverflow);
    }

    #[test]
    fn test_malformed_event_rejects_whole_trip() {
        let events = vec![event(&[("A", 6000), ("B", 0)]), ExpenseEvent::new(vec![])];

        let err = TripAggregator::new().close(&events).unwrap_err();
        assert_eq!(
            err,
            SettleError::InvalidEvent {
                index: 1,
                source: Box::new(SettleError::NoParticipants),
            }
        );
    }
}
