//! Secondary index from hints to the coins that carry them.
//!
//! Hints route wallet subscriptions. The index is conservative: reorgs do
//! not delete rows, so a superset of truthful hints is expected and
//! subscribers re-verify against coin state.

use std::sync::Arc;

use rusqlite::params;

use crate::error::ChainStorageError;
use crate::transactional::{TransactionalStore, WriteTx};
use crate::types::Bytes32;

pub struct HintStore {
    db: Arc<TransactionalStore>,
}

impl HintStore {
    pub async fn create(db: Arc<TransactionalStore>) -> Result<Self, ChainStorageError> {
        {
            let tx = db.writer().await?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS hints(
                     coin_id blob,
                     hint blob,
                     UNIQUE (coin_id, hint));
                 CREATE INDEX IF NOT EXISTS hint_index ON hints(hint);",
            )?;
            tx.commit()?;
        }
        Ok(HintStore { db })
    }

    /// Bulk insert. Duplicate pairs are tolerated and collapse silently;
    /// callers commonly emit them.
    pub fn add_hints(
        &self,
        tx: &WriteTx<'_>,
        coin_hint_list: &[(Bytes32, Vec<u8>)],
    ) -> Result<(), ChainStorageError> {
        let mut stmt =
            tx.prepare_cached("INSERT INTO hints VALUES(?, ?) ON CONFLICT DO NOTHING")?;
        for (coin_id, hint) in coin_hint_list {
            stmt.execute(params![coin_id, hint])?;
        }
        Ok(())
    }

    pub async fn get_coin_ids(&self, hint: &[u8]) -> Result<Vec<Bytes32>, ChainStorageError> {
        let reader = self.db.reader().await?;
        let mut stmt = reader.prepare("SELECT coin_id FROM hints WHERE hint=?")?;
        let rows = stmt.query_map(params![hint], |row| row.get::<_, Bytes32>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn count_hints(&self) -> Result<u64, ChainStorageError> {
        let reader = self.db.reader().await?;
        let count: i64 = reader.query_row("SELECT count(*) FROM hints", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_hash, temp_pool};

    #[tokio::test]
    async fn test_add_and_get_hints() {
        let (pool, _dir) = temp_pool().await;
        let store = HintStore::create(pool.clone()).await.unwrap();

        let hint_a = vec![1u8; 32];
        let hint_b = vec![2u8; 3];
        let pairs = vec![
            (make_hash(1), hint_a.clone()),
            (make_hash(2), hint_a.clone()),
            (make_hash(3), hint_b.clone()),
        ];
        {
            let tx = pool.writer().await.unwrap();
            store.add_hints(&tx, &pairs).unwrap();
            tx.commit().unwrap();
        }

        let mut for_a = store.get_coin_ids(&hint_a).await.unwrap();
        for_a.sort();
        let mut expected = vec![make_hash(1), make_hash(2)];
        expected.sort();
        assert_eq!(for_a, expected);
        assert_eq!(store.get_coin_ids(&hint_b).await.unwrap(), vec![make_hash(3)]);
        assert!(store.get_coin_ids(&[9u8; 4]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_pairs_collapse() {
        let (pool, _dir) = temp_pool().await;
        let store = HintStore::create(pool.clone()).await.unwrap();
        let hint = vec![7u8; 16];
        let pairs = vec![
            (make_hash(1), hint.clone()),
            (make_hash(1), hint.clone()),
            (make_hash(1), hint.clone()),
        ];
        {
            let tx = pool.writer().await.unwrap();
            store.add_hints(&tx, &pairs).unwrap();
            // a second call with the same pairs is also fine
            store.add_hints(&tx, &pairs).unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(store.count_hints().await.unwrap(), 1);
        // same coin with a different hint is a new row
        {
            let tx = pool.writer().await.unwrap();
            store
                .add_hints(&tx, &[(make_hash(1), vec![8u8; 16])])
                .unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(store.count_hints().await.unwrap(), 2);
    }
}
