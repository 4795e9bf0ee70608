use anyhow::{Context, Result};
use sled::{Db, IVec};

use super::dto::{CatalogItem, Fulfillment};

const TREE_NAME: &str = "catalog";

/// Catalog of purchasable items. Admin CRUD lives outside this
/// process; items are seeded from a JSON file at startup and read-only
/// afterwards.
#[derive(Clone)]
pub struct CatalogStorage {
    tree: sled::Tree,
}

impl CatalogStorage {
    pub fn new(db: &Db) -> sled::Result<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { tree })
    }

    pub fn put_item(&self, item: &CatalogItem) -> sled::Result<()> {
        let encoded = serde_json::to_vec(item).expect("catalog item serializes");
        self.tree.insert(item.id.as_bytes(), encoded)?;
        Ok(())
    }

    pub fn get_item(&self, id: &str) -> Option<CatalogItem> {
        self.tree
            .get(id.as_bytes())
            .ok()
            .flatten()
            .and_then(|ivec: IVec| serde_json::from_slice(&ivec).ok())
    }

    pub fn list_items(&self) -> Vec<CatalogItem> {
        self.tree
            .iter()
            .filter_map(|kv| {
                let (_, ivec) = kv.ok()?;
                serde_json::from_slice(&ivec).ok()
            })
            .collect()
    }

    /// Finds the item that sells access to a given group, used by the
    /// renewal path where only the group id is known.
    pub fn find_group_item(&self, group_id: i64) -> Option<CatalogItem> {
        self.list_items().into_iter().find(|item| {
            matches!(item.fulfillment, Fulfillment::GroupAccess { group_id: gid, .. } if gid == group_id)
        })
    }

    /// Loads (or reloads) the catalog from a JSON array on disk.
    pub async fn seed_from_file(&self, path: &str) -> Result<usize> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading catalog file {}", path))?;
        let items: Vec<CatalogItem> =
            serde_json::from_str(&raw).with_context(|| format!("parsing catalog file {}", path))?;
        for item in &items {
            self.put_item(item)?;
        }
        Ok(items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> CatalogStorage {
        let db = sled::Config::new().temporary(true).open().unwrap();
        CatalogStorage::new(&db).unwrap()
    }

    #[test]
    fn test_find_group_item() {
        let s = storage();
        s.put_item(&CatalogItem {
            id: "vip".into(),
            name: "VIP group".into(),
            price: "21.90".parse().unwrap(),
            fulfillment: Fulfillment::GroupAccess {
                group_id: -100123,
                duration_days: 30,
            },
        })
        .unwrap();
        s.put_item(&CatalogItem {
            id: "ebook".into(),
            name: "E-book".into(),
            price: "9.90".parse().unwrap(),
            fulfillment: Fulfillment::Text {
                content: "https://example.com/ebook".into(),
            },
        })
        .unwrap();

        assert_eq!(s.find_group_item(-100123).unwrap().id, "vip");
        assert!(s.find_group_item(-100999).is_none());
    }
}
