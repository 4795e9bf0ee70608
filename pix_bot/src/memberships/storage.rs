use chrono::Utc;
use sled::{Db, IVec};

use super::dto::{GroupMembership, MembershipStatus};

const TREE_NAME: &str = "group_memberships";

/// Memberships keyed by the (telegram_id, group_id) pair, big-endian
/// so the key is fixed-width and order-stable.
#[derive(Clone)]
pub struct MembershipStorage {
    tree: sled::Tree,
}

impl MembershipStorage {
    pub fn new(db: &Db) -> sled::Result<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { tree })
    }

    fn key_bytes(telegram_id: i64, group_id: i64) -> Vec<u8> {
        let mut v = Vec::with_capacity(16);
        v.extend_from_slice(&telegram_id.to_be_bytes());
        v.extend_from_slice(&group_id.to_be_bytes());
        v
    }

    pub fn get(&self, telegram_id: i64, group_id: i64) -> Option<GroupMembership> {
        self.tree
            .get(Self::key_bytes(telegram_id, group_id))
            .ok()
            .flatten()
            .and_then(|ivec: IVec| serde_json::from_slice(&ivec).ok())
    }

    pub fn put(&self, membership: &GroupMembership) -> sled::Result<()> {
        let key = Self::key_bytes(membership.telegram_id, membership.group_id);
        let encoded = serde_json::to_vec(membership).expect("membership serializes");
        self.tree.insert(key, encoded)?;
        Ok(())
    }

    /// Grants or renews access. Renewal only ever extends: the new
    /// expiry is `max(now, current expiry) + duration`, so paying
    /// early never shortens the remaining time. Reminder flags reset
    /// so the next cycle reminds again.
    ///
    /// Idempotent per payment: if `txid` already produced the current
    /// expiry, the stored record is returned untouched, so a delivery
    /// retry for the same transaction cannot stack extensions.
    pub fn upsert_extend(
        &self,
        telegram_id: i64,
        group_id: i64,
        duration_secs: i64,
        txid: &str,
    ) -> sled::Result<GroupMembership> {
        let key = Self::key_bytes(telegram_id, group_id);
        loop {
            let old = self.tree.get(&key)?;
            let now = Utc::now().timestamp();
            let prior = old
                .as_ref()
                .and_then(|ivec| serde_json::from_slice::<GroupMembership>(ivec).ok());

            if let Some(existing) = prior
                .as_ref()
                .filter(|m| m.extended_by.as_deref() == Some(txid))
            {
                return Ok(existing.clone());
            }

            let base = prior
                .filter(|m| m.is_active())
                .map(|m| m.expires_at.max(now))
                .unwrap_or(now);

            let membership = GroupMembership {
                telegram_id,
                group_id,
                expires_at: base + duration_secs,
                reminded_at: None,
                urgent_reminded_at: None,
                extended_by: Some(txid.to_string()),
                status: MembershipStatus::Active,
            };
            let new = serde_json::to_vec(&membership).expect("membership serializes");
            match self.tree.compare_and_swap(&key, old, Some(new))? {
                Ok(()) => return Ok(membership),
                Err(_) => continue,
            }
        }
    }

    /// The destructive half of the expiry sweep, as one atomic
    /// conditional update: the membership flips to expired only if the
    /// stored record still matches `expected` exactly. A concurrent
    /// renewal extension changes `expires_at` and makes this fail,
    /// which is precisely the race the sweep must lose.
    pub fn mark_expired_if_unchanged(&self, expected: &GroupMembership) -> sled::Result<bool> {
        let key = Self::key_bytes(expected.telegram_id, expected.group_id);
        let old = serde_json::to_vec(expected).expect("membership serializes");
        let mut updated = expected.clone();
        updated.status = MembershipStatus::Expired;
        let new = serde_json::to_vec(&updated).expect("membership serializes");
        Ok(self
            .tree
            .compare_and_swap(&key, Some(old), Some(new))?
            .is_ok())
    }

    pub fn set_reminded(&self, telegram_id: i64, group_id: i64, urgent: bool) -> sled::Result<()> {
        if let Some(mut m) = self.get(telegram_id, group_id) {
            let now = Utc::now().timestamp();
            if urgent {
                m.urgent_reminded_at = Some(now);
            } else {
                m.reminded_at = Some(now);
            }
            self.put(&m)?;
        }
        Ok(())
    }

    pub fn list_active(&self) -> Vec<GroupMembership> {
        self.tree
            .iter()
            .filter_map(|kv| {
                let (_, ivec) = kv.ok()?;
                serde_json::from_slice::<GroupMembership>(&ivec).ok()
            })
            .filter(|m| m.is_active())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> MembershipStorage {
        let db = sled::Config::new().temporary(true).open().unwrap();
        MembershipStorage::new(&db).unwrap()
    }

    #[test]
    fn test_extend_only_moves_forward() {
        let s = storage();
        let first = s.upsert_extend(7, 42, 30 * 24 * 3600, "TX1").unwrap();
        let renewed = s.upsert_extend(7, 42, 30 * 24 * 3600, "TX2").unwrap();
        // renewing mid-term adds to the existing expiry, never resets it
        assert!(renewed.expires_at >= first.expires_at + 30 * 24 * 3600);
    }

    #[test]
    fn test_same_payment_never_extends_twice() {
        let s = storage();
        let first = s.upsert_extend(7, 42, 30 * 24 * 3600, "TX1").unwrap();
        // a delivery retry re-runs the grant with the same txid
        let retried = s.upsert_extend(7, 42, 30 * 24 * 3600, "TX1").unwrap();
        assert_eq!(retried.expires_at, first.expires_at);
        assert_eq!(s.get(7, 42).unwrap().expires_at, first.expires_at);
    }

    #[test]
    fn test_lapsed_membership_extends_from_now() {
        let s = storage();
        let mut lapsed = s.upsert_extend(7, 42, 1000, "TX1").unwrap();
        lapsed.expires_at = 1; // long past
        s.put(&lapsed).unwrap();

        let now = Utc::now().timestamp();
        let renewed = s.upsert_extend(7, 42, 1000, "TX2").unwrap();
        assert!(renewed.expires_at >= now + 1000);
    }

    #[test]
    fn test_mark_expired_loses_race_with_renewal() {
        let s = storage();
        let snapshot = s.upsert_extend(7, 42, 1000, "TX1").unwrap();

        // a renewal lands between the sweep's read and its write
        s.upsert_extend(7, 42, 1000, "TX2").unwrap();

        assert!(!s.mark_expired_if_unchanged(&snapshot).unwrap());
        assert!(s.get(7, 42).unwrap().is_active());
    }

    #[test]
    fn test_mark_expired_when_unchanged() {
        let s = storage();
        let snapshot = s.upsert_extend(7, 42, 1000, "TX1").unwrap();
        assert!(s.mark_expired_if_unchanged(&snapshot).unwrap());
        assert_eq!(s.get(7, 42).unwrap().status, MembershipStatus::Expired);
    }

    #[test]
    fn test_reminder_flags_reset_on_renewal() {
        let s = storage();
        s.upsert_extend(7, 42, 1000, "TX1").unwrap();
        s.set_reminded(7, 42, false).unwrap();
        assert!(s.get(7, 42).unwrap().reminded_at.is_some());
        let renewed = s.upsert_extend(7, 42, 1000, "TX2").unwrap();
        assert!(renewed.reminded_at.is_none());
    }
}
