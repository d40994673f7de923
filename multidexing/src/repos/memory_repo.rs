use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Repo, RepoError};
use crate::chain_reorg::{RollbackPlan, RollbackScope};
use crate::contract_registry::ContractRegistration;
use crate::sources::BlockRef;
use crate::storage_writer::WriteUnit;
use crate::{
    ChainCheckpoint, ChainId, Entity, EntityHistoryRecord, EntityKey, EntityMutation, Event,
    HistoryIdentity,
};

#[derive(Default)]
struct Tables {
    entities: BTreeMap<EntityKey, serde_json::Value>,
    history: Vec<EntityHistoryRecord>,
    last_serial: u64,
    raw_events: Vec<Event>,
    registrations: BTreeMap<(ChainId, String), ContractRegistration>,
    checkpoints: BTreeMap<ChainId, ChainCheckpoint>,
    blocks: BTreeMap<(ChainId, u64), BlockRef>,
    reset_count: u64,
}

impl Tables {
    fn apply_entity_changes(&mut self, changes: &[EntityMutation]) {
        for change in changes {
            match change {
                EntityMutation::Set(entity) => {
                    self.entities.insert(entity.key(), entity.fields.clone());
                }
                EntityMutation::Delete(key) => {
                    self.entities.remove(key);
                }
            }
        }
    }

    fn upsert_checkpoints(&mut self, checkpoints: &[ChainCheckpoint]) {
        for checkpoint in checkpoints {
            self.checkpoints.insert(checkpoint.chain_id, checkpoint.clone());
        }
    }
}

/// In-process repo. All tables sit behind one lock, so every write is atomic.
///
/// Clones share the same tables, which lets tests inspect what an indexer wrote.
#[derive(Clone, Default)]
pub struct MemoryRepo {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entity(&self, kind: &str, id: &str) -> Option<Entity> {
        self.tables()
            .entities
            .get(&EntityKey::new(kind, id))
            .map(|fields| Entity {
                kind: kind.to_string(),
                id: id.to_string(),
                fields: fields.clone(),
            })
    }

    pub fn entities(&self, kind: &str) -> Vec<Entity> {
        self.tables()
            .entities
            .iter()
            .filter(|(key, _fields)| key.kind == kind)
            .map(|(key, fields)| Entity {
                kind: key.kind.clone(),
                id: key.id.clone(),
                fields: fields.clone(),
            })
            .collect()
    }

    pub fn history(&self) -> Vec<EntityHistoryRecord> {
        self.tables().history.clone()
    }

    pub fn raw_events(&self) -> Vec<Event> {
        self.tables().raw_events.clone()
    }

    pub fn registrations(&self) -> Vec<ContractRegistration> {
        self.tables().registrations.values().cloned().collect()
    }

    pub fn checkpoint(&self, chain_id: ChainId) -> Option<ChainCheckpoint> {
        self.tables().checkpoints.get(&chain_id).cloned()
    }

    pub fn checkpoints(&self) -> Vec<ChainCheckpoint> {
        self.tables().checkpoints.values().cloned().collect()
    }

    pub fn recorded_blocks(&self, chain_id: ChainId) -> Vec<BlockRef> {
        self.tables()
            .blocks
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .map(|(_key, block)| block.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl Repo for MemoryRepo {
    async fn migrate(&self) -> Result<(), RepoError> {
        Ok(())
    }

    async fn reset(&self) -> Result<(), RepoError> {
        let mut tables = self.tables();
        let reset_count = tables.reset_count;

        *tables = Tables {
            reset_count,
            ..Default::default()
        };

        Ok(())
    }

    async fn get_last_reset_count(&self) -> Result<u64, RepoError> {
        Ok(self.tables().reset_count)
    }

    async fn create_reset_count(&self) -> Result<(), RepoError> {
        self.tables().reset_count += 1;

        Ok(())
    }

    async fn commit(&self, unit: &WriteUnit) -> Result<(), RepoError> {
        let mut tables = self.tables();

        let mut identities: HashSet<(EntityKey, HistoryIdentity)> = tables
            .history
            .iter()
            .map(|record| (record.key(), record.identity))
            .collect();
        for record in &unit.history {
            if !identities.insert((record.key(), record.identity)) {
                return Err(RepoError::Conflict(format!(
                    "{} {} already has a history record at {}",
                    record.entity_kind, record.entity_id, record.identity
                )));
            }
        }

        tables.raw_events.extend(unit.raw_events.iter().cloned());
        tables.apply_entity_changes(&unit.entity_changes);

        for record in &unit.history {
            tables.last_serial += 1;
            let serial = tables.last_serial;
            tables.history.push(EntityHistoryRecord::from_unsaved(serial, record));
        }

        for registration in &unit.contract_registrations {
            tables
                .registrations
                .entry((registration.chain_id, registration.address.clone()))
                .or_insert_with(|| registration.clone());
        }

        tables.upsert_checkpoints(&unit.checkpoints);

        for recorded in &unit.block_refs {
            tables
                .blocks
                .insert((recorded.chain_id, recorded.block.number), recorded.block.clone());
        }

        Ok(())
    }

    async fn read_entity(&self, kind: &str, id: &str) -> Result<Option<Entity>, RepoError> {
        Ok(self.entity(kind, id))
    }

    async fn read_chain_checkpoints(&self) -> Result<Vec<ChainCheckpoint>, RepoError> {
        Ok(self.checkpoints())
    }

    async fn load_contract_registrations(&self) -> Result<Vec<ContractRegistration>, RepoError> {
        Ok(self.registrations())
    }

    async fn load_recent_blocks(
        &self,
        chain_id: ChainId,
        limit: usize,
    ) -> Result<Vec<BlockRef>, RepoError> {
        Ok(self
            .tables()
            .blocks
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .rev()
            .take(limit)
            .map(|(_key, block)| block.clone())
            .collect())
    }

    async fn load_latest_history_identities(
        &self,
        keys: &[EntityKey],
    ) -> Result<HashMap<EntityKey, HistoryIdentity>, RepoError> {
        let wanted: HashSet<&EntityKey> = keys.iter().collect();
        let mut identities = HashMap::new();

        for record in self.tables().history.iter().rev() {
            let key = record.key();
            if wanted.contains(&key) {
                identities.entry(key).or_insert(record.identity);
            }
        }

        Ok(identities)
    }

    async fn load_history_records_in_scope(
        &self,
        scope: &RollbackScope,
    ) -> Result<Vec<EntityHistoryRecord>, RepoError> {
        Ok(self
            .tables()
            .history
            .iter()
            .filter(|record| invalidates_identity(scope, &record.identity))
            .cloned()
            .collect())
    }

    async fn load_history_record_at(
        &self,
        key: &EntityKey,
        identity: &HistoryIdentity,
    ) -> Result<Option<EntityHistoryRecord>, RepoError> {
        Ok(self
            .tables()
            .history
            .iter()
            .rev()
            .find(|record| &record.identity == identity && &record.key() == key)
            .cloned())
    }

    async fn load_first_invalidated_event_blocks(
        &self,
        scope: &RollbackScope,
    ) -> Result<HashMap<ChainId, u64>, RepoError> {
        let mut first_blocks: HashMap<ChainId, u64> = HashMap::new();

        for event in self.tables().raw_events.iter() {
            if scope.invalidates(event.chain_id, event.block_number, event.block_timestamp) {
                first_blocks
                    .entry(event.chain_id)
                    .and_modify(|block_number| *block_number = (*block_number).min(event.block_number))
                    .or_insert(event.block_number);
            }
        }

        Ok(first_blocks)
    }

    async fn apply_rollback(&self, plan: &RollbackPlan) -> Result<(), RepoError> {
        let mut tables = self.tables();
        let scope = &plan.scope;

        tables
            .history
            .retain(|record| !invalidates_identity(scope, &record.identity));
        tables.raw_events.retain(|event| {
            !scope.invalidates(event.chain_id, event.block_number, event.block_timestamp)
        });
        tables.registrations.retain(|_key, registration| {
            !scope.invalidates(
                registration.chain_id,
                registration.block_number,
                registration.block_timestamp,
            )
        });

        tables.apply_entity_changes(&plan.restores);
        tables.upsert_checkpoints(&plan.checkpoints);

        for rewind in &plan.rewinds {
            tables.blocks.retain(|(chain_id, block_number), _block| {
                *chain_id != rewind.chain_id
                    || rewind.block_number.is_some_and(|rewound_to| *block_number <= rewound_to)
            });
        }

        Ok(())
    }

    async fn prune(&self, chain_id: ChainId, min_block_number: u64) -> Result<(), RepoError> {
        let mut tables = self.tables();
        let is_prunable = |identity: &HistoryIdentity| {
            identity.chain_id == chain_id && identity.block_number < min_block_number
        };

        let mut latest_prunable: HashMap<EntityKey, u64> = HashMap::new();
        for record in tables.history.iter().filter(|record| is_prunable(&record.identity)) {
            latest_prunable.insert(record.key(), record.serial);
        }

        tables.history.retain(|record| {
            !is_prunable(&record.identity)
                || latest_prunable.get(&record.key()) == Some(&record.serial)
        });
        tables
            .raw_events
            .retain(|event| event.chain_id != chain_id || event.block_number >= min_block_number);
        tables.blocks.retain(|(block_chain_id, block_number), _block| {
            *block_chain_id != chain_id || *block_number >= min_block_number
        });

        Ok(())
    }
}

fn invalidates_identity(scope: &RollbackScope, identity: &HistoryIdentity) -> bool {
    scope.invalidates(identity.chain_id, identity.block_number, identity.block_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deposit, transfer_unit};

    #[tokio::test]
    async fn assigns_increasing_serials_in_commit_order() {
        let repo = MemoryRepo::new();
        let first = deposit(1, 3, 0, "alice", 1);

        repo.commit(&transfer_unit(&first, None, 3)).await.unwrap();
        repo.commit(&transfer_unit(&deposit(2, 1, 0, "bob", 1), None, 1))
            .await
            .unwrap();

        let serials: Vec<_> = repo.history().iter().map(|record| record.serial).collect();
        assert_eq!(serials, vec![1, 2]);
    }

    #[tokio::test]
    async fn rejects_a_unit_with_a_duplicate_history_identity_as_a_whole() {
        let repo = MemoryRepo::new();
        let event = deposit(1, 3, 0, "alice", 1);
        repo.commit(&transfer_unit(&event, None, 3)).await.unwrap();

        let mut duplicate = transfer_unit(&event, None, 4);
        duplicate.raw_events.push(deposit(1, 4, 0, "carol", 1));

        assert!(matches!(
            repo.commit(&duplicate).await,
            Err(RepoError::Conflict(_))
        ));
        assert_eq!(repo.raw_events().len(), 1);
        assert_eq!(repo.checkpoint(1).unwrap().latest_processed_block_number, Some(3));
    }

    #[tokio::test]
    async fn keeps_the_latest_prunable_history_record_per_entity() {
        let repo = MemoryRepo::new();
        let first = deposit(1, 3, 0, "alice", 1);
        let second = deposit(1, 5, 0, "alice", 1);
        let third = deposit(1, 9, 0, "alice", 1);
        repo.commit(&transfer_unit(&first, None, 3)).await.unwrap();
        repo.commit(&transfer_unit(&second, Some((&first, 1)), 5)).await.unwrap();
        repo.commit(&transfer_unit(&third, Some((&second, 2)), 9)).await.unwrap();

        repo.prune(1, 8).await.unwrap();

        let remaining: Vec<_> = repo
            .history()
            .iter()
            .map(|record| record.identity.block_number)
            .collect();
        assert_eq!(remaining, vec![5, 9]);
        assert_eq!(repo.raw_events().len(), 1);
    }

    #[tokio::test]
    async fn reset_keeps_the_reset_count() {
        let repo = MemoryRepo::new();
        repo.commit(&transfer_unit(&deposit(1, 3, 0, "alice", 1), None, 3))
            .await
            .unwrap();
        repo.create_reset_count().await.unwrap();

        repo.reset().await.unwrap();

        assert_eq!(repo.get_last_reset_count().await.unwrap(), 1);
        assert!(repo.history().is_empty());
        assert!(repo.checkpoints().is_empty());
    }
}
