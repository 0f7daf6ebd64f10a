use crate::core::Transaction;
use std::collections::HashMap;

/// Pending transactions keyed by id, with arrival order retained so that
/// block assembly is deterministic: candidates are taken by descending fee,
/// ties broken by arrival.
///
/// Unlike the chain store this is process-local state. It carries no lock
/// of its own: the pool is owned by the ledger and only touched under the
/// ledger's write path.
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<String, (u64, Transaction)>,
    next_arrival: u64,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Mempool {
        Mempool {
            entries: HashMap::new(),
            next_arrival: 0,
        }
    }

    /// Insert a transaction. Returns false when the id is already present
    /// (re-adding is a no-op).
    pub fn insert(&mut self, tx: Transaction) -> bool {
        if self.entries.contains_key(tx.get_id()) {
            return false;
        }
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.entries.insert(tx.get_id().to_string(), (arrival, tx));
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.entries.get(id).map(|(_, tx)| tx)
    }

    pub fn remove(&mut self, id: &str) -> Option<Transaction> {
        self.entries.remove(id).map(|(_, tx)| tx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all(&self) -> Vec<Transaction> {
        let mut pending: Vec<&(u64, Transaction)> = self.entries.values().collect();
        pending.sort_by_key(|(arrival, _)| *arrival);
        pending.iter().map(|(_, tx)| tx.clone()).collect()
    }

    /// Up to `max` transactions by descending fee, arrival order on ties
    pub fn select_by_fee(&self, max: usize) -> Vec<Transaction> {
        let mut pending: Vec<&(u64, Transaction)> = self.entries.values().collect();
        pending.sort_by(|(arrival_a, a), (arrival_b, b)| {
            b.get_fee().cmp(&a.get_fee()).then(arrival_a.cmp(arrival_b))
        });
        pending
            .into_iter()
            .take(max)
            .map(|(_, tx)| tx.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_with_fee(fee: u64) -> Transaction {
        Transaction::new(
            "sender".to_string(),
            "recipient".to_string(),
            10,
            fee,
            None,
            0,
        )
        .unwrap()
    }

    #[test]
    fn insert_is_idempotent_by_id() {
        let mut pool = Mempool::new();
        let tx = tx_with_fee(1);

        assert!(pool.insert(tx.clone()));
        assert!(!pool.insert(tx));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn selection_orders_by_fee_then_arrival() {
        let mut pool = Mempool::new();
        let low = tx_with_fee(1);
        let high = tx_with_fee(9);
        let mid_first = tx_with_fee(5);
        let mid_second = tx_with_fee(5);

        pool.insert(low.clone());
        pool.insert(mid_first.clone());
        pool.insert(high.clone());
        pool.insert(mid_second.clone());

        let selected = pool.select_by_fee(3);
        let ids: Vec<&str> = selected.iter().map(|tx| tx.get_id()).collect();
        assert_eq!(
            ids,
            vec![high.get_id(), mid_first.get_id(), mid_second.get_id()]
        );
    }

    #[test]
    fn selection_respects_cap() {
        let mut pool = Mempool::new();
        for fee in 0..10 {
            pool.insert(tx_with_fee(fee));
        }
        assert_eq!(pool.select_by_fee(4).len(), 4);
        assert_eq!(pool.len(), 10);
    }

    #[test]
    fn remove_evicts_by_id() {
        let mut pool = Mempool::new();
        let tx = tx_with_fee(1);
        let id = tx.get_id().to_string();
        pool.insert(tx);

        assert!(pool.remove(&id).is_some());
        assert!(pool.remove(&id).is_none());
        assert!(pool.is_empty());
    }
}
