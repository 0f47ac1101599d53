//! Known-entity attribution from BIP-329 label files.
//!
//! A directory tree of `.jsonl` files is loaded once at startup. The path
//! of each file relative to the root names the entity source
//! (`exchanges/kraken`) and its top-level folder gives the [`EntityKind`].
//! `addr` and `tx` records become lookups; other record types are ignored.
//! The registry is read-only after loading.

mod jsonl;
mod types;

use std::collections::HashMap;
use std::path::Path;

use bitcoin::Txid;
use tracing::{debug, info, warn};

use crate::error::CoreError;

use jsonl::parse_label_lines;
pub use types::{Entity, EntityKind, LabelRecord, LabelTarget};

#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    addresses: HashMap<String, Entity>,
    transactions: HashMap<Txid, Entity>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recursively load every `.jsonl` file under `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, CoreError> {
        let mut registry = Self::new();
        registry.walk(dir, dir)?;
        info!(
            dir = %dir.display(),
            addresses = registry.addresses.len(),
            transactions = registry.transactions.len(),
            "entity labels loaded"
        );
        Ok(registry)
    }

    fn walk(&mut self, base: &Path, current: &Path) -> Result<(), CoreError> {
        // Sorted for a deterministic winner when two files label the same ref.
        let mut entries: Vec<_> = std::fs::read_dir(current)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                self.walk(base, &path)?;
            } else if path.extension().is_some_and(|ext| ext == "jsonl") {
                let source = path
                    .strip_prefix(base)
                    .unwrap_or(&path)
                    .with_extension("")
                    .to_string_lossy()
                    .replace('\\', "/");
                let content = std::fs::read_to_string(&path)?;
                self.load_records(&source, &content)?;
            }
        }
        Ok(())
    }

    /// Add the records of one label file. `source` is its relative id, e.g.
    /// `exchanges/kraken`.
    pub fn load_records(&mut self, source: &str, content: &str) -> Result<(), CoreError> {
        let kind = match source.split_once('/') {
            Some((folder, _)) => EntityKind::from_folder(folder),
            None => EntityKind::Other,
        };
        let records = parse_label_lines(source, content)?;
        debug!(source, records = records.len(), "parsing entity label file");

        for record in records {
            let entity = Entity {
                name: record.label.clone(),
                kind,
                source: source.to_owned(),
            };
            match record.target {
                LabelTarget::Addr => self.insert_address(record.reference, entity),
                LabelTarget::Tx => match record.reference.parse::<Txid>() {
                    Ok(txid) => {
                        self.transactions.insert(txid, entity);
                    }
                    Err(e) => warn!(source, reference = %record.reference, error = %e, "skipping tx label with bad txid"),
                },
                _ => {}
            }
        }
        Ok(())
    }

    pub fn insert_address(&mut self, address: String, entity: Entity) {
        if let Some(previous) = self.addresses.get(&address) {
            if previous.name != entity.name {
                warn!(
                    %address,
                    previous = %previous.name,
                    replacement = %entity.name,
                    "address labelled by two entities; keeping the later one"
                );
            }
        }
        self.addresses.insert(address, entity);
    }

    pub fn lookup_address(&self, address: &str) -> Option<&Entity> {
        self.addresses.get(address)
    }

    pub fn lookup_tx(&self, txid: &Txid) -> Option<&Entity> {
        self.transactions.get(txid)
    }

    pub fn len(&self) -> usize {
        self.addresses.len() + self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.transactions.is_empty()
    }
}
