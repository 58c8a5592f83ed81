//! Record store over sled: one tree per logical table, CBOR-encoded rows.
//!
//! The contract is deliberately thin: append, read-all, find-by-key and
//! update-by-key, with no transactions and no row locking. Callers that need
//! stronger guarantees (the workflow engine) layer read-then-check-then-write
//! ordering on top.
use std::path::Path;
use std::sync::Arc;

pub const TABLE_ITEMS: &str = "items";
pub const TABLE_PENDING: &str = "pending";
pub const TABLE_LEDGER: &str = "ledger";
pub const TABLE_USERS: &str = "users";
const TABLE_COUNTERS: &str = "counters";

pub const COUNTER_SKU: &str = "sku";
pub const COUNTER_TRX: &str = "trx";
pub const COUNTER_USER: &str = "user";

pub struct RecordStore {
    db: Arc<sled::Db>,
}

impl RecordStore {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self::new(Arc::new(db)))
    }

    fn table(&self, name: &str) -> anyhow::Result<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }

    /// Insert a full record under its key. Overwrites silently; last write
    /// wins, as with every mutation in this store.
    pub fn append_record<T>(&self, table: &str, key: &str, record: &T) -> anyhow::Result<()>
    where
        T: minicbor::Encode<()>,
    {
        let tree = self.table(table)?;
        tree.insert(key.as_bytes(), minicbor::to_vec(record)?)?;
        Ok(())
    }

    /// Materialize every record in the table, in key order.
    pub fn read_all_records<T>(&self, table: &str) -> anyhow::Result<Vec<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let tree = self.table(table)?;
        let mut records = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            records.push(minicbor::decode(value.as_ref())?);
        }
        Ok(records)
    }

    pub fn find_record_by_key<T>(&self, table: &str, key: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let tree = self.table(table)?;
        match tree.get(key.as_bytes())? {
            Some(value) => Ok(Some(minicbor::decode(value.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write of a single record. Returns false when the key is
    /// absent. Not atomic: a concurrent writer between the read and the
    /// write is lost (last write wins).
    pub fn update_record_by_key<T>(
        &self,
        table: &str,
        key: &str,
        patch: impl FnOnce(&mut T),
    ) -> anyhow::Result<bool>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
    {
        let tree = self.table(table)?;
        let Some(value) = tree.get(key.as_bytes())? else {
            return Ok(false);
        };
        let mut record: T = minicbor::decode(value.as_ref())?;
        patch(&mut record);
        tree.insert(key.as_bytes(), minicbor::to_vec(&record)?)?;
        Ok(true)
    }

    /// Monotonic persisted counter, advanced with a CAS loop so concurrent
    /// mints never observe the same value.
    pub fn next_counter(&self, name: &str) -> anyhow::Result<u64> {
        let tree = self.table(TABLE_COUNTERS)?;
        let bytes = tree.update_and_fetch(name, |old| {
            let current = old
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            Some(current.wrapping_add(1).to_be_bytes().to_vec())
        })?;
        let bytes = bytes.ok_or_else(|| anyhow::anyhow!("counter {name} vanished mid-update"))?;
        let raw = <[u8; 8]>::try_from(bytes.as_ref())
            .map_err(|_| anyhow::anyhow!("counter {name} holds a malformed value"))?;
        Ok(u64::from_be_bytes(raw))
    }

    pub fn next_sku_id(&self) -> anyhow::Result<String> {
        Ok(format!("SKU-{:04}", self.next_counter(COUNTER_SKU)?))
    }

    /// Transaction id shared by a ledger entry and its pending requests.
    pub fn next_trx_id(&self) -> anyhow::Result<String> {
        Ok(format!("TRX-{:06}", self.next_counter(COUNTER_TRX)?))
    }

    pub fn next_user_id(&self) -> anyhow::Result<String> {
        Ok(format!("USR-{:05}", self.next_counter(COUNTER_USER)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq)]
    struct Row {
        #[n(0)]
        key: String,
        #[n(1)]
        qty: i64,
    }

    fn open_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn append_and_find_roundtrip() {
        let (_dir, store) = open_store();
        let row = Row {
            key: "a".into(),
            qty: 7,
        };

        store.append_record("rows", "a", &row).unwrap();
        let found: Option<Row> = store.find_record_by_key("rows", "a").unwrap();

        assert_eq!(found, Some(row));
    }

    #[test]
    fn update_missing_key_reports_false() {
        let (_dir, store) = open_store();
        let updated = store
            .update_record_by_key("rows", "nope", |r: &mut Row| r.qty += 1)
            .unwrap();
        assert!(!updated);
    }

    #[test]
    fn update_patches_in_place() {
        let (_dir, store) = open_store();
        let row = Row {
            key: "a".into(),
            qty: 1,
        };
        store.append_record("rows", "a", &row).unwrap();

        let updated = store
            .update_record_by_key("rows", "a", |r: &mut Row| r.qty = 5)
            .unwrap();
        assert!(updated);

        let found: Row = store.find_record_by_key("rows", "a").unwrap().unwrap();
        assert_eq!(found.qty, 5);
    }

    #[test]
    fn counters_are_monotonic_and_independent() {
        let (_dir, store) = open_store();

        assert_eq!(store.next_counter(COUNTER_TRX).unwrap(), 1);
        assert_eq!(store.next_counter(COUNTER_TRX).unwrap(), 2);
        assert_eq!(store.next_counter(COUNTER_SKU).unwrap(), 1);

        assert_eq!(store.next_trx_id().unwrap(), "TRX-000003");
        assert_eq!(store.next_sku_id().unwrap(), "SKU-0002");
    }
}
