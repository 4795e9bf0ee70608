use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Expired,
}

/// A time-boxed grant of access to one group for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub telegram_id: i64,
    pub group_id: i64,
    pub expires_at: i64,
    /// Set once the early (~3 days out) reminder went out.
    pub reminded_at: Option<i64>,
    /// Set once the final-day reminder went out.
    pub urgent_reminded_at: Option<i64>,
    /// Txid of the payment that produced the current expiry. A
    /// delivery retry for the same payment must not extend again.
    #[serde(default)]
    pub extended_by: Option<String>,
    pub status: MembershipStatus,
}

impl GroupMembership {
    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }
}
