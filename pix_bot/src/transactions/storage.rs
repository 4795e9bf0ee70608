use pix_core::error::CoreError;
use sled::{Db, IVec};

use super::dto::{SubjectRef, Transaction, TransactionStatus};

const TREE_NAME: &str = "transactions";

/// Sled-backed transaction store keyed by txid. All status changes go
/// through [`TransactionStorage::transition`], which is a conditional
/// compare-and-swap: the expected pre-state is re-checked atomically
/// against the stored record, so a racing writer makes the loser abort
/// instead of clobbering.
#[derive(Clone)]
pub struct TransactionStorage {
    tree: sled::Tree,
}

impl TransactionStorage {
    pub fn new(db: &Db) -> sled::Result<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { tree })
    }

    pub fn put(&self, tx: &Transaction) -> sled::Result<()> {
        let encoded = serde_json::to_vec(tx).expect("transaction serializes");
        self.tree.insert(tx.txid.as_bytes(), encoded)?;
        Ok(())
    }

    pub fn get(&self, txid: &str) -> Option<Transaction> {
        self.tree
            .get(txid.as_bytes())
            .ok()
            .flatten()
            .and_then(|ivec: IVec| serde_json::from_slice(&ivec).ok())
    }

    /// Atomically moves `txid` from one of `expected` into `to`,
    /// applying `mutate` to the record before writing. Fails with
    /// `ConcurrencyConflict` when another writer got there first; the
    /// caller is expected to let the other writer's outcome stand.
    pub fn transition(
        &self,
        txid: &str,
        expected: &[TransactionStatus],
        to: TransactionStatus,
        mutate: impl Fn(&mut Transaction),
    ) -> Result<Transaction, CoreError> {
        loop {
            let old = self
                .tree
                .get(txid.as_bytes())
                .map_err(|e| CoreError::ExternalService(format!("sled read: {}", e)))?
                .ok_or_else(|| CoreError::Validation(format!("unknown txid {}", txid)))?;

            let mut tx: Transaction = serde_json::from_slice(&old)
                .map_err(|e| CoreError::Validation(format!("corrupt record {}: {}", txid, e)))?;

            if !expected.contains(&tx.status) {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "txid {} is {:?}, expected one of {:?}",
                    txid, tx.status, expected
                )));
            }

            tx.status = to;
            mutate(&mut tx);
            let new = serde_json::to_vec(&tx).expect("transaction serializes");

            match self
                .tree
                .compare_and_swap(txid.as_bytes(), Some(old), Some(new))
            {
                Ok(Ok(())) => return Ok(tx),
                // Some other field changed underneath us; re-read and
                // re-check the pre-state.
                Ok(Err(_)) => continue,
                Err(e) => {
                    return Err(CoreError::ExternalService(format!("sled cas: {}", e)));
                }
            }
        }
    }

    /// Updates non-status fields in place, keeping the same CAS loop.
    pub fn update(
        &self,
        txid: &str,
        mutate: impl Fn(&mut Transaction),
    ) -> Result<Transaction, CoreError> {
        loop {
            let old = self
                .tree
                .get(txid.as_bytes())
                .map_err(|e| CoreError::ExternalService(format!("sled read: {}", e)))?
                .ok_or_else(|| CoreError::Validation(format!("unknown txid {}", txid)))?;

            let mut tx: Transaction = serde_json::from_slice(&old)
                .map_err(|e| CoreError::Validation(format!("corrupt record {}: {}", txid, e)))?;
            mutate(&mut tx);
            let new = serde_json::to_vec(&tx).expect("transaction serializes");

            match self
                .tree
                .compare_and_swap(txid.as_bytes(), Some(old), Some(new))
            {
                Ok(Ok(())) => return Ok(tx),
                Ok(Err(_)) => continue,
                Err(e) => {
                    return Err(CoreError::ExternalService(format!("sled cas: {}", e)));
                }
            }
        }
    }

    fn scan(&self) -> impl Iterator<Item = Transaction> + '_ {
        self.tree.iter().filter_map(|kv| {
            let (_, ivec) = kv.ok()?;
            serde_json::from_slice(&ivec).ok()
        })
    }

    pub fn list_with_status(&self, status: TransactionStatus) -> Vec<Transaction> {
        self.scan().filter(|tx| tx.status == status).collect()
    }

    pub fn list_open(&self) -> Vec<Transaction> {
        self.scan().filter(|tx| tx.status.is_open()).collect()
    }

    /// Newest open transaction for a user regardless of subject; this
    /// is what an uploaded proof attaches to.
    pub fn find_newest_open_for_user(&self, telegram_id: i64) -> Option<Transaction> {
        self.scan()
            .filter(|tx| tx.telegram_id == telegram_id && tx.status.is_open())
            .max_by_key(|tx| tx.created_at)
    }

    /// Newest open transaction for one (user, subject) pair. At most
    /// one should exist; if duplicates slipped in, the newest wins and
    /// is reused.
    pub fn find_active(&self, telegram_id: i64, subject: &SubjectRef) -> Option<Transaction> {
        self.scan()
            .filter(|tx| {
                tx.telegram_id == telegram_id && tx.subject == *subject && tx.status.is_open()
            })
            .max_by_key(|tx| tx.created_at)
    }

    /// Renewal lookup for the expiry sweep: an open renewal always
    /// counts; an approved one (validated or delivered, or stuck in
    /// delivery retry) counts only when it was validated after
    /// `approved_since`, so approvals from past cycles don't mask a
    /// genuinely lapsed membership.
    pub fn find_renewal(
        &self,
        telegram_id: i64,
        group_id: i64,
        approved_since: i64,
    ) -> Option<Transaction> {
        self.scan()
            .filter(|tx| {
                tx.telegram_id == telegram_id && tx.subject == SubjectRef::Group(group_id)
            })
            .filter(|tx| match tx.status {
                TransactionStatus::Pending | TransactionStatus::ProofSent => true,
                TransactionStatus::Validated
                | TransactionStatus::Delivered
                | TransactionStatus::DeliveryFailed => {
                    tx.validated_at.is_some_and(|at| at >= approved_since)
                }
                _ => false,
            })
            .max_by_key(|tx| tx.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pix_core::pix::payload::create_charge;

    fn storage() -> TransactionStorage {
        let db = sled::Config::new().temporary(true).open().unwrap();
        TransactionStorage::new(&db).unwrap()
    }

    fn make_tx(storage: &TransactionStorage, txid: &str, user: i64, subject: SubjectRef) -> Transaction {
        let charge = create_charge(
            "teste@pix.com",
            "Loja",
            "SP",
            "21.90".parse().unwrap(),
            Some(txid.to_string()),
        )
        .unwrap();
        let tx = Transaction::new(&charge, user, user, subject);
        storage.put(&tx).unwrap();
        tx
    }

    #[test]
    fn test_round_trip_preserves_payload_exactly() {
        let s = storage();
        let tx = make_tx(&s, "TX1", 7, SubjectRef::Product("p1".into()));
        let loaded = s.get("TX1").unwrap();
        assert_eq!(loaded.pix_payload, tx.pix_payload);
        assert_eq!(loaded.txid, tx.txid);
        assert_eq!(loaded.amount, tx.amount);
    }

    #[test]
    fn test_transition_happy_path() {
        let s = storage();
        make_tx(&s, "TX1", 7, SubjectRef::Product("p1".into()));
        let tx = s
            .transition(
                "TX1",
                &[TransactionStatus::Pending],
                TransactionStatus::ProofSent,
                |tx| tx.proof_received_at = Some(123),
            )
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::ProofSent);
        assert_eq!(s.get("TX1").unwrap().proof_received_at, Some(123));
    }

    #[test]
    fn test_transition_conflict_on_unexpected_state() {
        let s = storage();
        make_tx(&s, "TX1", 7, SubjectRef::Product("p1".into()));
        s.transition(
            "TX1",
            &[TransactionStatus::Pending],
            TransactionStatus::Expired,
            |_| {},
        )
        .unwrap();

        // an approval racing the expiry loses and aborts
        let err = s
            .transition(
                "TX1",
                &[TransactionStatus::Pending, TransactionStatus::ProofSent],
                TransactionStatus::Validated,
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::ConcurrencyConflict(_)));
        assert_eq!(s.get("TX1").unwrap().status, TransactionStatus::Expired);
    }

    #[test]
    fn test_find_active_picks_newest_duplicate() {
        let s = storage();
        let subject = SubjectRef::Group(42);
        let mut a = make_tx(&s, "TXA", 7, subject.clone());
        a.created_at = 100;
        s.put(&a).unwrap();
        let mut b = make_tx(&s, "TXB", 7, subject.clone());
        b.created_at = 200;
        s.put(&b).unwrap();

        let active = s.find_active(7, &subject).unwrap();
        assert_eq!(active.txid, "TXB");
    }

    #[test]
    fn test_find_renewal_ignores_stale_approvals() {
        let s = storage();
        let mut old = make_tx(&s, "TXOLD", 7, SubjectRef::Group(42));
        old.status = TransactionStatus::Delivered;
        old.validated_at = Some(1_000);
        s.put(&old).unwrap();

        // approved long before the cutoff: not a renewal
        assert!(s.find_renewal(7, 42, 2_000).is_none());
        // approved after the cutoff: counts
        assert!(s.find_renewal(7, 42, 500).is_some());
    }

    #[test]
    fn test_find_renewal_open_always_counts() {
        let s = storage();
        make_tx(&s, "TXP", 7, SubjectRef::Group(42));
        assert!(s.find_renewal(7, 42, i64::MAX).is_some());
    }
}
