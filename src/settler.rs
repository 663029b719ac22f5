// ⚖️ Event Settler - Balance a single expenditure event
//
// Everybody owes the fair share (total / N, rounded half-up). Participants are
// sorted by how much they paid, then the biggest remaining creditor is matched
// against the biggest remaining debtor until the two pointers meet.
//
// This is a greedy heuristic: it is deterministic and O(N log N), and usually
// yields few transfers, but it does not search for the minimum transfer count.
// Changing the matching strategy changes observable output.

use crate::error::SettleError;
use crate::model::{Cents, ExpenseEvent, Transfer};
use std::collections::BTreeSet;
use std::fmt::Debug;
use tracing::trace;

// ============================================================================
// FAIR SHARE
// ============================================================================

/// `floor(total / n + 0.5)` computed exactly in integers.
///
/// `n` must be non-zero and `total` non-negative.
pub fn fair_share(total: Cents, n: usize) -> Cents {
    let total = total as i128;
    let n = n as i128;
    ((2 * total + n) / (2 * n)) as Cents
}

// ============================================================================
// EVENT SETTLER
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct EventSettler;

impl EventSettler {
    pub fn new() -> Self {
        EventSettler
    }

    /// Check the input contract of an event without settling it
    pub fn validate<K: Ord + Debug>(&self, event: &ExpenseEvent<K>) -> Result<Cents, SettleError> {
        if event.is_empty() {
            return Err(SettleError::NoParticipants);
        }

        let mut seen = BTreeSet::new();
        for p in event.participants() {
            if p.paid_cents < 0 {
                return Err(SettleError::NegativeAmount {
                    identity: format!("{:?}", p.identity),
                    paid_cents: p.paid_cents,
                });
            }
            if !seen.insert(&p.identity) {
                return Err(SettleError::DuplicateParticipant {
                    identity: format!("{:?}", p.identity),
                });
            }
        }

        event.total_cents().ok_or(SettleError::AmountOverflow)
    }

    /// Compute the transfers that bring every participant to the fair share.
    ///
    /// Each transfer goes from an under-payer to an over-payer. Ties in the
    /// amount paid are broken by identity so the output is reproducible.
    pub fn settle<K>(&self, event: &ExpenseEvent<K>) -> Result<Vec<Transfer<K>>, SettleError>
    where
        K: Ord + Clone + Debug,
    {
        let total = self.validate(event)?;
        let n = event.len();
        if total == 0 || n == 1 {
            return Ok(Vec::new());
        }

        let avg = fair_share(total, n);

        let mut working: Vec<(&K, Cents)> = event
            .participants()
            .iter()
            .map(|p| (&p.identity, p.paid_cents))
            .collect();
        working.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut transfers = Vec::new();
        let (mut i, mut j) = (0, n - 1);

        while i < j {
            if working[i].1 <= avg {
                // i has no surplus left
                i += 1;
            } else if working[j].1 >= avg {
                // j has no deficit left
                j -= 1;
            } else {
                let amount = (avg - working[j].1).min(working[i].1 - avg);
                transfers.push(Transfer {
                    payer: working[j].0.clone(),
                    payee: working[i].0.clone(),
                    amount_cents: amount,
                });
                working[j].1 += amount;
                working[i].1 -= amount;
            }
        }

        trace!(participants = n, total, avg, transfers = transfers.len(), "settled event");
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Participant;
    use std::collections::BTreeMap;

    fn event(entries: &[(&'static str, Cents)]) -> ExpenseEvent<&'static str> {
        entries.iter().copied().collect()
    }

    /// Net effective contribution of every participant after applying transfers
    fn effective(entries: &[(&'static str, Cents)], transfers: &[Transfer<&'static str>]) -> BTreeMap<&'static str, Cents> {
        let mut paid: BTreeMap<_, _> = entries.iter().copied().collect();
        for t in transfers {
            *paid.get_mut(t.payer).unwrap() += t.amount_cents;
            *paid.get_mut(t.payee).unwrap() -= t.amount_cents;
        }
        paid
    }

    #[test]
    fn test_fair_share_rounds_half_up() {
        assert_eq!(fair_share(6000, 3), 2000);
        assert_eq!(fair_share(5900, 3), 1967); // 1966.67
        assert_eq!(fair_share(44000, 7), 6286); // 6285.71
        assert_eq!(fair_share(5, 2), 3); // 2.5 goes up, not to even
        assert_eq!(fair_share(1, 4), 0); // 0.25
        assert_eq!(fair_share(2, 4), 1); // 0.5
        assert_eq!(fair_share(0, 5), 0);
    }

    #[test]
    fn test_one_payer_three_participants() {
        let transfers = EventSettler::new().settle(&event(&[("A", 6000), ("B", 0), ("C", 0)])).unwrap();

        assert_eq!(transfers.len(), 2);
        assert!(transfers.contains(&Transfer { payer: "B", payee: "A", amount_cents: 2000 }));
        assert!(transfers.contains(&Transfer { payer: "C", payee: "A", amount_cents: 2000 }));
    }

    #[test]
    fn test_zero_total_yields_nothing() {
        let transfers = EventSettler::new().settle(&event(&[("A", 0), ("B", 0), ("C", 0)])).unwrap();
        assert!(transfers.is_empty());
    }

    #[test]
    fn test_single_participant_yields_nothing() {
        let transfers = EventSettler::new().settle(&event(&[("A", 4200)])).unwrap();
        assert!(transfers.is_empty());
    }

    #[test]
    fn test_everyone_paid_their_share() {
        let transfers = EventSettler::new().settle(&event(&[("A", 1500), ("B", 1500)])).unwrap();
        assert!(transfers.is_empty());
    }

    #[test]
    fn test_rounding_remainder_absorbed_by_one_participant() {
        // avg = 1967, the creditor can only hand out 1933 after the first debtor
        let entries = [("charlie", 5900), ("alice", 0), ("bob", 0)];
        let transfers = EventSettler::new().settle(&event(&entries)).unwrap();

        assert_eq!(
            transfers,
            vec![
                Transfer { payer: "bob", payee: "charlie", amount_cents: 1967 },
                Transfer { payer: "alice", payee: "charlie", amount_cents: 1966 },
            ]
        );
    }

    #[test]
    fn test_multiple_creditors_and_debtors() {
        let entries = [("A", 9000), ("B", 3000), ("C", 0), ("D", 0)];
        let settler = EventSettler::new();
        let transfers = settler.settle(&event(&entries)).unwrap();

        for t in &transfers {
            assert_ne!(t.payer, t.payee);
            assert!(t.amount_cents > 0);
        }
        for (_, paid) in effective(&entries, &transfers) {
            assert_eq!(paid, 3000);
        }
    }

    #[test]
    fn test_conservation_within_rounding_tolerance() {
        let cases: Vec<Vec<(&'static str, Cents)>> = vec![
            vec![("A", 41500), ("B", 0), ("C", 0), ("D", 0), ("E", 0), ("F", 0), ("G", 2500)],
            vec![("A", 1), ("B", 1), ("C", 0)],
            vec![("A", 999), ("B", 1), ("C", 333), ("D", 7), ("E", 0)],
            vec![("A", 10), ("B", 10), ("C", 10), ("D", 11)],
        ];

        for entries in cases {
            let n = entries.len() as Cents;
            let total: Cents = entries.iter().map(|(_, p)| p).sum();
            let avg = fair_share(total, entries.len());
            let transfers = EventSettler::new().settle(&event(&entries)).unwrap();

            let discrepancy: Cents = effective(&entries, &transfers)
                .values()
                .map(|paid| (paid - avg).abs())
                .sum();
            assert!(discrepancy <= n - 1, "{:?}: discrepancy {}", entries, discrepancy);
        }
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let a = event(&[("C", 0), ("A", 3000), ("B", 0), ("D", 3000)]);
        let b = event(&[("B", 0), ("D", 3000), ("C", 0), ("A", 3000)]);

        let settler = EventSettler::new();
        let first = settler.settle(&a).unwrap();
        assert_eq!(first, settler.settle(&a).unwrap());
        assert_eq!(first, settler.settle(&b).unwrap());
    }

    #[test]
    fn test_input_is_not_modified() {
        let ev = event(&[("A", 6000), ("B", 0), ("C", 0)]);
        let before = ev.clone();
        EventSettler::new().settle(&ev).unwrap();
        assert_eq!(ev, before);
    }

    #[test]
    fn test_rejects_empty_event() {
        let ev: ExpenseEvent<&str> = ExpenseEvent::new(vec![]);
        assert_eq!(EventSettler::new().settle(&ev), Err(SettleError::NoParticipants));
    }

    #[test]
    fn test_rejects_negative_amount() {
        let ev = ExpenseEvent::new(vec![Participant::new("A", 100), Participant::new("B", -1)]);
        assert!(matches!(
            EventSettler::new().settle(&ev),
            Err(SettleError::NegativeAmount { paid_cents: -1, .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_identity() {
        let ev = event(&[("A", 100), ("B", 0), ("A", 50)]);
        assert!(matches!(
            EventSettler::new().settle(&ev),
            Err(SettleError::DuplicateParticipant { .. })
        ));
    }

    #[test]
    fn test_rejects_overflowing_total() {
        let ev = event(&[("A", i64::MAX), ("B", 1)]);
        assert_eq!(EventSettler::new().settle(&ev), Err(SettleError::AmountOverflow));
    }
}
