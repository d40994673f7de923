//! Fixtures shared by unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::chain_reorg::{RollbackPlan, RollbackScope};
use crate::sources::{BlockRef, ChainDataSource, EventsPage, SourceError, WatchedAddress};
use crate::{
    Chain, ChainCheckpoint, ChainId, Contract, ContractRegistration, Entity, EntityHistoryRecord,
    EntityKey, EntityMutation, EntityRecord, Event, Handler, HandlerContext, HandlerError,
    HistoryIdentity, LoaderContext, MemoryRepo, Repo, RepoError, UnsavedHistoryRecord, WriteUnit,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, EntityRecord)]
pub struct Account {
    pub id: String,
    pub balance: u64,
}

pub fn account(id: &str, balance: u64) -> Account {
    Account {
        id: id.to_string(),
        balance,
    }
}

/// Canonical block of the scripted chains: timestamps are ten times the block number
pub fn block(chain_id: ChainId, number: u64) -> BlockRef {
    scripted_block(chain_id, number, None)
}

fn scripted_block(chain_id: ChainId, number: u64, reorged_from: Option<u64>) -> BlockRef {
    let hash = |number: u64| {
        let fork = u8::from(reorged_from.is_some_and(|reorged_from| number >= reorged_from));
        format!("0x{chain_id}-{number}-{fork}")
    };

    BlockRef {
        number,
        hash: hash(number),
        parent_hash: match number.checked_sub(1) {
            Some(parent_number) => hash(parent_number),
            None => format!("0x{chain_id}-genesis"),
        },
        timestamp: number * 10,
    }
}

pub fn deposit(chain_id: ChainId, block_number: u64, log_index: u64, account: &str, amount: u64) -> Event {
    Event {
        chain_id,
        contract_address: "0xtoken".to_string(),
        contract_name: "Token".to_string(),
        event_name: "Deposit".to_string(),
        params: json!({ "account": account, "amount": amount }),
        block_hash: block(chain_id, block_number).hash,
        block_number,
        block_timestamp: block_number * 10,
        transaction_hash: format!("0x{chain_id}{block_number}{log_index}"),
        transaction_index: log_index,
        log_index,
    }
}

struct DepositHandler;

#[async_trait::async_trait]
impl Handler for DepositHandler {
    fn event_name(&self) -> &'static str {
        "Deposit"
    }

    async fn load(&self, context: &LoaderContext<'_>) -> Result<(), HandlerError> {
        let account_id = context.get_event_params().get_string("account")?;
        context.load::<Account>(&account_id).await?;

        Ok(())
    }

    fn handle(&self, context: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        let params = context.get_event_params();
        let account_id = params.get_string("account")?;
        let amount = params.get_u64("amount")?;

        let balance = context.get::<Account>(&account_id)?.map_or(0, |account| account.balance);

        context.set(&account(&account_id, balance + amount))
    }
}

struct TokenListedHandler;

#[async_trait::async_trait]
impl Handler for TokenListedHandler {
    fn event_name(&self) -> &'static str {
        "TokenListed"
    }

    fn handle(&self, context: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        let token = context.get_event_params().get_string("token")?;
        context.register_contract("ListedToken", &token);

        Ok(())
    }
}

pub fn token_contracts() -> Vec<Contract> {
    vec![
        Contract::new("Token")
            .add_address("0xtoken", &1, 0)
            .add_address("0xtoken", &2, 0)
            .add_address("0xtoken", &3, 0)
            .add_handler(DepositHandler)
            .add_handler(TokenListedHandler),
        Contract::new("ListedToken"),
    ]
}

/// Commits one deposit of `balance` and returns the identity of its history record
pub async fn seed_account(
    repo: &MemoryRepo,
    id: &str,
    balance: u64,
    chain_id: ChainId,
    block_number: u64,
) -> HistoryIdentity {
    let event = deposit(chain_id, block_number, 0, id, balance);
    repo.commit(&transfer_unit(&event, None, block_number))
        .await
        .unwrap();

    HistoryIdentity::of(&event)
}

/// What committing a deposit produces: the raw event, the new balance and its history record.
/// `previous` is the account's prior deposit and the balance it left behind.
pub fn transfer_unit(event: &Event, previous: Option<(&Event, u64)>, processed_block_number: u64) -> WriteUnit {
    let params = event.get_params();
    let account_id = params.get_string("account").unwrap();
    let amount = params.get_u64("amount").unwrap();
    let prior_balance = previous.map_or(0, |(_event, balance)| balance);

    let mutation =
        EntityMutation::Set(Entity::from_record(&account(&account_id, prior_balance + amount)).unwrap());
    let previous_identity =
        previous.map_or(HistoryIdentity::genesis(), |(event, _balance)| HistoryIdentity::of(event));

    let mut checkpoint = ChainCheckpoint::new(&silent_chain(event.chain_id));
    checkpoint.latest_fetched_block_number = Some(processed_block_number);
    checkpoint.latest_processed_block_number = Some(processed_block_number);
    checkpoint.processed_position = Some(event.position());
    checkpoint.events_processed = 1;
    checkpoint.first_event_block_number = Some(event.block_number);

    WriteUnit {
        raw_events: vec![event.clone()],
        history: vec![UnsavedHistoryRecord::new(
            &mutation,
            HistoryIdentity::of(event),
            previous_identity,
        )],
        entity_changes: vec![mutation],
        checkpoints: vec![checkpoint],
        ..Default::default()
    }
}

pub fn silent_chain(chain_id: ChainId) -> Chain {
    Chain::new(chain_id, ScriptedSource::new(chain_id, 0, vec![]))
}

struct ScriptedState {
    head_block_number: u64,
    events: Vec<Event>,
    reorged_from: Option<u64>,
    failures_left: u32,
}

/// In-memory chain whose head, events and forks tests control
#[derive(Clone)]
pub struct ScriptedSource {
    chain_id: ChainId,
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedSource {
    pub fn new(chain_id: ChainId, head_block_number: u64, events: Vec<Event>) -> Self {
        Self {
            chain_id,
            state: Arc::new(Mutex::new(ScriptedState {
                head_block_number,
                events,
                reorged_from: None,
                failures_left: 0,
            })),
        }
    }

    /// Makes the next `count` event requests fail transiently
    pub fn fail_next_requests(&self, count: u32) {
        self.state.lock().unwrap().failures_left = count;
    }

    /// Replaces every block from `block_number` on with a block of another hash
    pub fn reorg_from(&self, block_number: u64) {
        self.state.lock().unwrap().reorged_from = Some(block_number);
    }

    fn block(&self, number: u64) -> BlockRef {
        scripted_block(self.chain_id, number, self.state.lock().unwrap().reorged_from)
    }
}

#[async_trait::async_trait]
impl ChainDataSource for ScriptedSource {
    async fn get_head_block(&self, _chain_id: ChainId) -> Result<BlockRef, SourceError> {
        let head_block_number = self.state.lock().unwrap().head_block_number;

        Ok(self.block(head_block_number))
    }

    async fn get_block(&self, _chain_id: ChainId, block_number: u64) -> Result<BlockRef, SourceError> {
        Ok(self.block(block_number))
    }

    async fn get_events(
        &self,
        _chain_id: ChainId,
        from_block_number: u64,
        to_block_number: u64,
        _watched_addresses: &[WatchedAddress],
    ) -> Result<EventsPage, SourceError> {
        let (events, to_block_number) = {
            let mut state = self.state.lock().unwrap();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(SourceError::Transient("rate limited".to_string()));
            }

            let to_block_number = to_block_number.min(state.head_block_number);
            let events = state
                .events
                .iter()
                .filter(|event| (from_block_number..=to_block_number).contains(&event.block_number))
                .cloned()
                .collect();

            (events, to_block_number)
        };

        Ok(EventsPage {
            events,
            first_block: self.block(from_block_number),
            last_block: self.block(to_block_number),
            blocks: (from_block_number..=to_block_number).map(|number| self.block(number)).collect(),
        })
    }
}

/// Fails the first `failures` commits and rollbacks, then behaves like the wrapped repo
#[derive(Clone)]
pub struct FlakyRepo {
    repo: MemoryRepo,
    failures: u32,
    attempts: Arc<AtomicU32>,
}

impl FlakyRepo {
    pub fn new(repo: MemoryRepo, failures: u32) -> Self {
        Self {
            repo,
            failures,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn attempt(&self) -> Result<(), RepoError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if attempt < self.failures {
            Err(RepoError::Query("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Repo for FlakyRepo {
    async fn migrate(&self) -> Result<(), RepoError> {
        self.repo.migrate().await
    }

    async fn reset(&self) -> Result<(), RepoError> {
        self.repo.reset().await
    }

    async fn get_last_reset_count(&self) -> Result<u64, RepoError> {
        self.repo.get_last_reset_count().await
    }

    async fn create_reset_count(&self) -> Result<(), RepoError> {
        self.repo.create_reset_count().await
    }

    async fn commit(&self, unit: &WriteUnit) -> Result<(), RepoError> {
        self.attempt()?;
        self.repo.commit(unit).await
    }

    async fn read_entity(&self, kind: &str, id: &str) -> Result<Option<Entity>, RepoError> {
        self.repo.read_entity(kind, id).await
    }

    async fn read_chain_checkpoints(&self) -> Result<Vec<ChainCheckpoint>, RepoError> {
        self.repo.read_chain_checkpoints().await
    }

    async fn load_contract_registrations(&self) -> Result<Vec<ContractRegistration>, RepoError> {
        self.repo.load_contract_registrations().await
    }

    async fn load_recent_blocks(&self, chain_id: ChainId, limit: usize) -> Result<Vec<BlockRef>, RepoError> {
        self.repo.load_recent_blocks(chain_id, limit).await
    }

    async fn load_latest_history_identities(
        &self,
        keys: &[EntityKey],
    ) -> Result<HashMap<EntityKey, HistoryIdentity>, RepoError> {
        self.repo.load_latest_history_identities(keys).await
    }

    async fn load_history_records_in_scope(
        &self,
        scope: &RollbackScope,
    ) -> Result<Vec<EntityHistoryRecord>, RepoError> {
        self.repo.load_history_records_in_scope(scope).await
    }

    async fn load_history_record_at(
        &self,
        key: &EntityKey,
        identity: &HistoryIdentity,
    ) -> Result<Option<EntityHistoryRecord>, RepoError> {
        self.repo.load_history_record_at(key, identity).await
    }

    async fn load_first_invalidated_event_blocks(
        &self,
        scope: &RollbackScope,
    ) -> Result<HashMap<ChainId, u64>, RepoError> {
        self.repo.load_first_invalidated_event_blocks(scope).await
    }

    async fn apply_rollback(&self, plan: &RollbackPlan) -> Result<(), RepoError> {
        self.attempt()?;
        self.repo.apply_rollback(plan).await
    }

    async fn prune(&self, chain_id: ChainId, min_block_number: u64) -> Result<(), RepoError> {
        self.repo.prune(chain_id, min_block_number).await
    }
}
