//! Core value types: hashes, coins and their on-disk records.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 32-byte opaque identifier. Block hashes, coin ids, puzzle hashes and
/// parent ids are all carried as this type; the store never interprets the
/// contents beyond using them as keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bytes32(pub [u8; 32]);

impl Bytes32 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Bytes32(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Bytes32(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Bytes32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl ToSql for Bytes32 {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(&self.0[..]))
    }
}

impl FromSql for Bytes32 {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let blob = value.as_blob()?;
        Bytes32::from_slice(blob).ok_or(FromSqlError::InvalidBlobSize {
            expected_size: 32,
            blob_size: blob.len(),
        })
    }
}

/// A UTXO. Identity is derived, not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub parent_coin_id: Bytes32,
    pub puzzle_hash: Bytes32,
    pub amount: u64,
}

impl Coin {
    pub fn new(parent_coin_id: Bytes32, puzzle_hash: Bytes32, amount: u64) -> Self {
        Coin {
            parent_coin_id,
            puzzle_hash,
            amount,
        }
    }

    /// coin_id = sha256(parent ‖ puzzle_hash ‖ amount_be)
    pub fn coin_id(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(self.parent_coin_id.as_bytes());
        hasher.update(self.puzzle_hash.as_bytes());
        hasher.update(self.amount.to_be_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Bytes32(out)
    }

    /// The 8-byte big-endian encoding stored in the `amount` column. This
    /// encoding is load-bearing for the v1 migration and index compatibility.
    pub fn amount_blob(&self) -> [u8; 8] {
        self.amount.to_be_bytes()
    }
}

/// On-disk record for a coin. `spent_block_index == 0` means unspent; any
/// positive value >= `confirmed_block_index` means spent at that height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinRecord {
    pub coin: Coin,
    pub confirmed_block_index: u32,
    pub spent_block_index: u32,
    pub coinbase: bool,
    pub timestamp: u64,
}

impl CoinRecord {
    pub fn name(&self) -> Bytes32 {
        self.coin.coin_id()
    }

    pub fn is_spent(&self) -> bool {
        self.spent_block_index > 0
    }
}

/// Subscription-facing projection of a coin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoinState {
    pub coin: Coin,
    pub spent_height: Option<u32>,
    pub created_height: u32,
}

impl From<&CoinRecord> for CoinState {
    fn from(record: &CoinRecord) -> Self {
        CoinState {
            coin: record.coin,
            spent_height: if record.spent_block_index > 0 {
                Some(record.spent_block_index)
            } else {
                None
            },
            created_height: record.confirmed_block_index,
        }
    }
}

/// The unique unspent-coin lineage used for singleton-style identity
/// tracking: the coin, its (spent) parent and the grandparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnspentLineageInfo {
    pub coin_id: Bytes32,
    pub parent_id: Bytes32,
    pub parent_parent_id: Bytes32,
}
