use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;

use crate::core::types::Hash256;
use crate::error::StoreError;
use crate::pow::EpochDataset;

/// Key prefix for datasets in sled
const PREFIX_DATASET: &[u8] = b"ds:";

/// On-disk cache of generated verification datasets, keyed by epoch
pub struct EpochStore {
    db: Db,
}

#[derive(Serialize, Deserialize)]
struct StoredDataset {
    epoch: u64,
    seed: Hash256,
    data: Vec<u8>,
}

impl From<&EpochDataset> for StoredDataset {
    fn from(ds: &EpochDataset) -> Self {
        StoredDataset {
            epoch: ds.epoch,
            seed: ds.seed,
            data: ds.data.clone(),
        }
    }
}

impl StoredDataset {
    fn into_dataset(self) -> EpochDataset {
        EpochDataset {
            epoch: self.epoch,
            seed: self.seed,
            data: self.data,
        }
    }
}

impl EpochStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(EpochStore { db })
    }

    /// Throwaway store, removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(EpochStore { db })
    }

    pub fn put(&self, dataset: &EpochDataset) -> Result<(), StoreError> {
        let value = bincode::serialize(&StoredDataset::from(dataset))?;
        self.db.insert(dataset_key(dataset.epoch), value)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get(&self, epoch: u64) -> Result<Option<EpochDataset>, StoreError> {
        match self.db.get(dataset_key(epoch))? {
            Some(bytes) => {
                let stored: StoredDataset = bincode::deserialize(&bytes)?;
                Ok(Some(stored.into_dataset()))
            }
            None => Ok(None),
        }
    }

    /// Stored epochs in ascending order
    pub fn epochs(&self) -> Result<Vec<u64>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(PREFIX_DATASET) {
            let (key, _) = item?;
            if let Some(epoch) = epoch_from_key(&key) {
                out.push(epoch);
            }
        }
        Ok(out)
    }

    /// Delete every dataset below `epoch`. Returns how many were removed.
    pub fn prune_below(&self, epoch: u64) -> Result<usize, StoreError> {
        let mut removed = 0;
        for e in self.epochs()? {
            if e < epoch {
                self.db.remove(dataset_key(e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn dataset_key(epoch: u64) -> Vec<u8> {
    // ds:<epoch be(8)> so scans come back in epoch order
    let mut key = Vec::with_capacity(PREFIX_DATASET.len() + 8);
    key.extend_from_slice(PREFIX_DATASET);
    key.extend_from_slice(&epoch.to_be_bytes());
    key
}

fn epoch_from_key(key: &[u8]) -> Option<u64> {
    let data = key.strip_prefix(PREFIX_DATASET)?;
    let bytes: [u8; 8] = data.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
