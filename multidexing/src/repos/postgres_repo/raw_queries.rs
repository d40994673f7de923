use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};

use crate::chain_reorg::{ChainRewind, RollbackScope};
use crate::contract_registry::ContractRegistration;
use crate::storage_writer::RecordedBlock;
use crate::{
    ChainCheckpoint, ChainId, EntityHistoryRecord, EntityKey, EntityMutation, Event,
    EventPosition, HistoryIdentity, RepoError, UnsavedHistoryRecord,
};

const ROWS_PER_INSERT: usize = 500;

/// Positional parameters of one statement
#[derive(Default)]
struct Params {
    values: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl Params {
    /// Adds a value and returns its placeholder
    fn push(&mut self, value: impl ToSql + Sync + Send + 'static) -> String {
        self.values.push(Box::new(value));

        format!("${}", self.values.len())
    }

    fn as_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values.iter().map(|value| value.as_ref() as &(dyn ToSql + Sync)).collect()
    }
}

pub fn scope_condition(scope: &RollbackScope) -> String {
    match scope {
        RollbackScope::Chain {
            chain_id,
            safe_block_number,
        } => format!("chain_id = {chain_id} AND block_number > {safe_block_number}"),
        RollbackScope::Global {
            chain_id,
            safe_block_number,
            safe_block_timestamp,
        } => format!(
            "(block_timestamp, chain_id, block_number) > ({safe_block_timestamp}, {chain_id}, {safe_block_number})"
        ),
    }
}

pub async fn insert_raw_events(txn: &Transaction<'_>, events: &[Event]) -> Result<(), RepoError> {
    for chunk in events.chunks(ROWS_PER_INSERT) {
        let mut params = Params::default();
        let rows: Vec<_> = chunk
            .iter()
            .map(|event| {
                format!(
                    "({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
                    params.push(event.chain_id as i64),
                    params.push(event.contract_address.clone()),
                    params.push(event.contract_name.clone()),
                    params.push(event.event_name.clone()),
                    params.push(event.params.clone()),
                    params.push(event.block_hash.clone()),
                    params.push(event.block_number as i64),
                    params.push(event.block_timestamp as i64),
                    params.push(event.transaction_hash.clone()),
                    params.push(event.transaction_index as i64),
                    params.push(event.log_index as i64),
                )
            })
            .collect();

        let query = format!(
            "INSERT INTO multidexing_raw_events (chain_id, contract_address, contract_name, event_name,
            params, block_hash, block_number, block_timestamp, transaction_hash, transaction_index, log_index)
            VALUES {}",
            rows.join(", ")
        );
        txn.execute(query.as_str(), &params.as_refs()).await?;
    }

    Ok(())
}

pub async fn apply_entity_changes(
    txn: &Transaction<'_>,
    changes: &[EntityMutation],
) -> Result<(), RepoError> {
    let mut sets = vec![];
    let mut deleted_ids_by_kind: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    for change in changes {
        match change {
            EntityMutation::Set(entity) => sets.push(entity),
            EntityMutation::Delete(key) => {
                deleted_ids_by_kind.entry(key.kind.as_str()).or_default().push(key.id.clone())
            }
        }
    }

    for chunk in sets.chunks(ROWS_PER_INSERT) {
        let mut params = Params::default();
        let rows: Vec<_> = chunk
            .iter()
            .map(|entity| {
                format!(
                    "({}, {}, {})",
                    params.push(entity.kind.clone()),
                    params.push(entity.id.clone()),
                    params.push(entity.fields.clone()),
                )
            })
            .collect();

        let query = format!(
            "INSERT INTO multidexing_entities (kind, id, fields) VALUES {}
            ON CONFLICT (kind, id) DO UPDATE
            SET fields = EXCLUDED.fields, updated_at = EXTRACT(EPOCH FROM CURRENT_TIMESTAMP)::BIGINT",
            rows.join(", ")
        );
        txn.execute(query.as_str(), &params.as_refs()).await?;
    }

    for (kind, ids) in deleted_ids_by_kind {
        txn.execute(
            "DELETE FROM multidexing_entities WHERE kind = $1 AND id = ANY($2)",
            &[&kind, &ids],
        )
        .await?;
    }

    Ok(())
}

/// One statement per record keeps serials in append order
pub async fn insert_history(
    txn: &Transaction<'_>,
    records: &[UnsavedHistoryRecord],
) -> Result<(), RepoError> {
    for record in records {
        let mut params = Params::default();
        let values = [
            params.push(record.entity_kind.clone()),
            params.push(record.entity_id.clone()),
            params.push(record.action.to_string()),
            params.push(record.snapshot.clone()),
            params.push(record.identity.chain_id as i64),
            params.push(record.identity.block_number as i64),
            params.push(record.identity.block_timestamp as i64),
            params.push(record.identity.log_index as i64),
            params.push(record.previous.chain_id as i64),
            params.push(record.previous.block_number as i64),
            params.push(record.previous.block_timestamp as i64),
            params.push(record.previous.log_index as i64),
        ];

        let query = format!(
            "INSERT INTO multidexing_entity_history (entity_kind, entity_id, action, snapshot,
            chain_id, block_number, block_timestamp, log_index,
            previous_chain_id, previous_block_number, previous_block_timestamp, previous_log_index)
            VALUES ({})",
            values.join(", ")
        );
        txn.execute(query.as_str(), &params.as_refs()).await?;
    }

    Ok(())
}

pub async fn insert_contract_registrations(
    txn: &Transaction<'_>,
    registrations: &[ContractRegistration],
) -> Result<(), RepoError> {
    for registration in registrations {
        txn.execute(
            "INSERT INTO multidexing_contract_registrations (chain_id, address, contract_name,
            block_number, log_index, block_timestamp, registering_contract_address,
            registering_contract_name, registering_event_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (chain_id, address) DO NOTHING",
            &[
                &(registration.chain_id as i64),
                &registration.address,
                &registration.contract_name,
                &(registration.block_number as i64),
                &(registration.log_index as i64),
                &(registration.block_timestamp as i64),
                &registration.registering_contract_address,
                &registration.registering_contract_name,
                &registration.registering_event_name,
            ],
        )
        .await?;
    }

    Ok(())
}

pub async fn upsert_checkpoints(
    txn: &Transaction<'_>,
    checkpoints: &[ChainCheckpoint],
) -> Result<(), RepoError> {
    for checkpoint in checkpoints {
        let to_i64 = |value: Option<u64>| value.map(|value| value as i64);

        txn.execute(
            "INSERT INTO multidexing_chain_checkpoints (chain_id, start_block_number, end_block_number,
            latest_fetched_block_number, latest_processed_block_number, processed_block_number,
            processed_log_index, events_processed, batches_fetched, first_event_block_number,
            caught_up_at, is_live, is_finished)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (chain_id) DO UPDATE SET
            start_block_number = EXCLUDED.start_block_number,
            end_block_number = EXCLUDED.end_block_number,
            latest_fetched_block_number = EXCLUDED.latest_fetched_block_number,
            latest_processed_block_number = EXCLUDED.latest_processed_block_number,
            processed_block_number = EXCLUDED.processed_block_number,
            processed_log_index = EXCLUDED.processed_log_index,
            events_processed = EXCLUDED.events_processed,
            batches_fetched = EXCLUDED.batches_fetched,
            first_event_block_number = EXCLUDED.first_event_block_number,
            caught_up_at = EXCLUDED.caught_up_at,
            is_live = EXCLUDED.is_live,
            is_finished = EXCLUDED.is_finished",
            &[
                &(checkpoint.chain_id as i64),
                &(checkpoint.start_block_number as i64),
                &to_i64(checkpoint.end_block_number),
                &to_i64(checkpoint.latest_fetched_block_number),
                &to_i64(checkpoint.latest_processed_block_number),
                &to_i64(checkpoint.processed_position.map(|position| position.block_number)),
                &to_i64(checkpoint.processed_position.map(|position| position.log_index)),
                &(checkpoint.events_processed as i64),
                &(checkpoint.batches_fetched as i64),
                &to_i64(checkpoint.first_event_block_number),
                &checkpoint.caught_up_at,
                &checkpoint.is_live,
                &checkpoint.is_finished,
            ],
        )
        .await?;
    }

    Ok(())
}

pub async fn upsert_blocks(txn: &Transaction<'_>, blocks: &[RecordedBlock]) -> Result<(), RepoError> {
    for RecordedBlock { chain_id, block } in blocks {
        txn.execute(
            "INSERT INTO multidexing_chain_blocks (chain_id, block_number, block_hash, parent_hash, block_timestamp)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (chain_id, block_number) DO UPDATE SET
            block_hash = EXCLUDED.block_hash,
            parent_hash = EXCLUDED.parent_hash,
            block_timestamp = EXCLUDED.block_timestamp",
            &[
                &(*chain_id as i64),
                &(block.number as i64),
                &block.hash,
                &block.parent_hash,
                &(block.timestamp as i64),
            ],
        )
        .await?;
    }

    Ok(())
}

pub async fn delete_in_scope(txn: &Transaction<'_>, scope: &RollbackScope) -> Result<(), RepoError> {
    let condition = scope_condition(scope);

    for table in [
        "multidexing_entity_history",
        "multidexing_raw_events",
        "multidexing_contract_registrations",
    ] {
        txn.batch_execute(&format!("DELETE FROM {table} WHERE {condition}")).await?;
    }

    Ok(())
}

pub async fn delete_blocks_above(txn: &Transaction<'_>, rewinds: &[ChainRewind]) -> Result<(), RepoError> {
    for rewind in rewinds {
        let rewound_to = rewind.block_number.map_or(-1, |block_number| block_number as i64);

        txn.execute(
            "DELETE FROM multidexing_chain_blocks WHERE chain_id = $1 AND block_number > $2",
            &[&(rewind.chain_id as i64), &rewound_to],
        )
        .await?;
    }

    Ok(())
}

pub async fn prune(txn: &Transaction<'_>, chain_id: ChainId, min_block_number: u64) -> Result<(), RepoError> {
    let params: [&(dyn ToSql + Sync); 2] = [&(chain_id as i64), &(min_block_number as i64)];

    txn.execute(
        "DELETE FROM multidexing_raw_events WHERE chain_id = $1 AND block_number < $2",
        &params,
    )
    .await?;
    txn.execute(
        "DELETE FROM multidexing_chain_blocks WHERE chain_id = $1 AND block_number < $2",
        &params,
    )
    .await?;
    txn.execute(
        "DELETE FROM multidexing_entity_history history
        WHERE history.chain_id = $1 AND history.block_number < $2
        AND history.serial < (
            SELECT MAX(latest.serial) FROM multidexing_entity_history latest
            WHERE latest.entity_kind = history.entity_kind
            AND latest.entity_id = history.entity_id
            AND latest.chain_id = $1 AND latest.block_number < $2
        )",
        &params,
    )
    .await?;

    Ok(())
}

pub async fn load_data_list<Data: DeserializeOwned>(
    client: &Client,
    query: &str,
    params: &[&(dyn ToSql + Sync)],
) -> Result<Vec<Data>, RepoError> {
    let rows = client.query(json_aggregate_query(query).as_str(), params).await?;
    let json_aggregate: serde_json::Value = match rows.first() {
        Some(row) => row.try_get(0)?,
        None => serde_json::Value::Null,
    };

    if json_aggregate.is_array() {
        Ok(serde_json::from_value(json_aggregate)?)
    } else {
        Ok(vec![])
    }
}

fn json_aggregate_query(query: &str) -> String {
    format!("WITH result AS ({query}) SELECT COALESCE(json_agg(result), '[]'::json) FROM result")
}

#[derive(Deserialize)]
pub struct HistoryRow {
    serial: u64,
    entity_kind: String,
    entity_id: String,
    action: String,
    snapshot: Option<serde_json::Value>,
    chain_id: u64,
    block_number: u64,
    block_timestamp: u64,
    log_index: u64,
    previous_chain_id: u64,
    previous_block_number: u64,
    previous_block_timestamp: u64,
    previous_log_index: u64,
}

impl TryFrom<HistoryRow> for EntityHistoryRecord {
    type Error = RepoError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(EntityHistoryRecord {
            serial: row.serial,
            action: row.action.parse().map_err(RepoError::Query)?,
            entity_kind: row.entity_kind,
            entity_id: row.entity_id,
            snapshot: row.snapshot,
            identity: HistoryIdentity {
                chain_id: row.chain_id,
                block_number: row.block_number,
                block_timestamp: row.block_timestamp,
                log_index: row.log_index,
            },
            previous: HistoryIdentity {
                chain_id: row.previous_chain_id,
                block_number: row.previous_block_number,
                block_timestamp: row.previous_block_timestamp,
                log_index: row.previous_log_index,
            },
        })
    }
}

pub fn to_history_records(rows: Vec<HistoryRow>) -> Result<Vec<EntityHistoryRecord>, RepoError> {
    let mut records = rows
        .into_iter()
        .map(EntityHistoryRecord::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    records.sort_by_key(|record| record.serial);

    Ok(records)
}

#[derive(Deserialize)]
pub struct IdentityRow {
    entity_kind: String,
    entity_id: String,
    chain_id: u64,
    block_number: u64,
    block_timestamp: u64,
    log_index: u64,
}

pub fn to_identities(rows: Vec<IdentityRow>) -> HashMap<EntityKey, HistoryIdentity> {
    rows.into_iter()
        .map(|row| {
            (
                EntityKey::new(&row.entity_kind, &row.entity_id),
                HistoryIdentity {
                    chain_id: row.chain_id,
                    block_number: row.block_number,
                    block_timestamp: row.block_timestamp,
                    log_index: row.log_index,
                },
            )
        })
        .collect()
}

#[derive(Deserialize)]
pub struct ChainCheckpointRow {
    chain_id: u64,
    start_block_number: u64,
    end_block_number: Option<u64>,
    latest_fetched_block_number: Option<u64>,
    latest_processed_block_number: Option<u64>,
    processed_block_number: Option<u64>,
    processed_log_index: Option<u64>,
    events_processed: u64,
    batches_fetched: u64,
    first_event_block_number: Option<u64>,
    caught_up_at: Option<i64>,
    is_live: bool,
    is_finished: bool,
}

impl From<ChainCheckpointRow> for ChainCheckpoint {
    fn from(row: ChainCheckpointRow) -> Self {
        ChainCheckpoint {
            chain_id: row.chain_id,
            start_block_number: row.start_block_number,
            end_block_number: row.end_block_number,
            latest_fetched_block_number: row.latest_fetched_block_number,
            latest_processed_block_number: row.latest_processed_block_number,
            processed_position: row
                .processed_block_number
                .zip(row.processed_log_index)
                .map(|(block_number, log_index)| EventPosition {
                    block_number,
                    log_index,
                }),
            events_processed: row.events_processed,
            batches_fetched: row.batches_fetched,
            first_event_block_number: row.first_event_block_number,
            caught_up_at: row.caught_up_at,
            is_live: row.is_live,
            is_finished: row.is_finished,
        }
    }
}

#[derive(Deserialize)]
pub struct FirstBlockRow {
    pub chain_id: u64,
    pub block_number: u64,
}
