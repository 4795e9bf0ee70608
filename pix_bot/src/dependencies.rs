use std::sync::Arc;

use crate::config::Settings;
use crate::memberships::storage::MembershipStorage;
use crate::products::storage::CatalogStorage;
use crate::proof::pipeline::ProofPipeline;
use crate::transactions::storage::TransactionStorage;

#[derive(Clone)]
pub struct BotDependencies {
    pub db: sled::Db,
    pub settings: Settings,
    pub transactions: TransactionStorage,
    pub memberships: MembershipStorage,
    pub catalog: CatalogStorage,
    pub pipeline: Arc<ProofPipeline>,
}

impl BotDependencies {
    pub fn new(db: sled::Db, settings: Settings) -> sled::Result<Self> {
        let transactions = TransactionStorage::new(&db)?;
        let memberships = MembershipStorage::new(&db)?;
        let catalog = CatalogStorage::new(&db)?;
        let pipeline = Arc::new(ProofPipeline::from_settings(&settings));
        Ok(Self {
            db,
            settings,
            transactions,
            memberships,
            catalog,
            pipeline,
        })
    }
}
