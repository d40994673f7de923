mod migrations;
mod raw_queries;

use migrations::SQLikeMigrations;

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::error;

use super::{Repo, RepoError};
use crate::chain_reorg::{RollbackPlan, RollbackScope};
use crate::contract_registry::ContractRegistration;
use crate::sources::BlockRef;
use crate::storage_writer::WriteUnit;
use crate::{ChainCheckpoint, ChainId, Entity, EntityHistoryRecord, EntityKey, HistoryIdentity};

use raw_queries::{
    load_data_list, scope_condition, ChainCheckpointRow, FirstBlockRow, HistoryRow, IdentityRow,
};

impl From<tokio_postgres::Error> for RepoError {
    fn from(error: tokio_postgres::Error) -> Self {
        if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            RepoError::Conflict(error.to_string())
        } else if error.is_closed() {
            RepoError::NotConnected
        } else {
            RepoError::Query(error.to_string())
        }
    }
}

/// Postgres-backed repo over a single connection.
/// Every commit, rollback and prune runs in its own transaction.
pub struct PostgresRepo {
    url: String,
    client: Mutex<Client>,
}

impl PostgresRepo {
    pub async fn new(url: &str) -> Result<Self, RepoError> {
        let client = connect(url).await?;

        Ok(Self {
            url: url.to_string(),
            client: Mutex::new(client),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn execute_migrations(&self, migrations: Vec<&'static str>) -> Result<(), RepoError> {
        let client = self.client.lock().await;

        for migration in migrations {
            client.batch_execute(migration).await?;
        }

        Ok(())
    }
}

async fn connect(url: &str) -> Result<Client, RepoError> {
    let (client, conn) = tokio_postgres::connect(url, NoTls).await?;

    tokio::spawn(async move {
        if let Err(conn_error) = conn.await {
            error!(%conn_error, "postgres connection closed");
        }
    });

    Ok(client)
}

#[async_trait::async_trait]
impl Repo for PostgresRepo {
    async fn migrate(&self) -> Result<(), RepoError> {
        self.execute_migrations(SQLikeMigrations::get_internal_migrations()).await
    }

    async fn reset(&self) -> Result<(), RepoError> {
        self.execute_migrations(SQLikeMigrations::get_reset_internal_migrations()).await?;

        self.migrate().await
    }

    async fn get_last_reset_count(&self) -> Result<u64, RepoError> {
        let client = self.client.lock().await;
        let row = client.query_one("SELECT COUNT(*) FROM multidexing_reset_counts", &[]).await?;
        let count: i64 = row.try_get(0)?;

        Ok(count as u64)
    }

    async fn create_reset_count(&self) -> Result<(), RepoError> {
        let client = self.client.lock().await;
        client.batch_execute("INSERT INTO multidexing_reset_counts DEFAULT VALUES").await?;

        Ok(())
    }

    async fn commit(&self, unit: &WriteUnit) -> Result<(), RepoError> {
        let mut client = self.client.lock().await;
        let txn = client.transaction().await?;

        raw_queries::insert_raw_events(&txn, &unit.raw_events).await?;
        raw_queries::apply_entity_changes(&txn, &unit.entity_changes).await?;
        raw_queries::insert_history(&txn, &unit.history).await?;
        raw_queries::insert_contract_registrations(&txn, &unit.contract_registrations).await?;
        raw_queries::upsert_checkpoints(&txn, &unit.checkpoints).await?;
        raw_queries::upsert_blocks(&txn, &unit.block_refs).await?;

        txn.commit().await?;

        Ok(())
    }

    async fn read_entity(&self, kind: &str, id: &str) -> Result<Option<Entity>, RepoError> {
        let client = self.client.lock().await;
        let mut entities: Vec<Entity> = load_data_list(
            &client,
            "SELECT kind, id, fields FROM multidexing_entities WHERE kind = $1 AND id = $2",
            &[&kind, &id],
        )
        .await?;

        Ok(entities.pop())
    }

    async fn read_chain_checkpoints(&self) -> Result<Vec<ChainCheckpoint>, RepoError> {
        let client = self.client.lock().await;
        let rows: Vec<ChainCheckpointRow> =
            load_data_list(&client, "SELECT * FROM multidexing_chain_checkpoints", &[]).await?;

        Ok(rows.into_iter().map(ChainCheckpoint::from).collect())
    }

    async fn load_contract_registrations(&self) -> Result<Vec<ContractRegistration>, RepoError> {
        let client = self.client.lock().await;

        load_data_list(&client, "SELECT * FROM multidexing_contract_registrations", &[]).await
    }

    async fn load_recent_blocks(
        &self,
        chain_id: ChainId,
        limit: usize,
    ) -> Result<Vec<BlockRef>, RepoError> {
        let client = self.client.lock().await;
        let mut blocks: Vec<BlockRef> = load_data_list(
            &client,
            "SELECT block_number AS number, block_hash AS hash, parent_hash, block_timestamp AS timestamp
            FROM multidexing_chain_blocks WHERE chain_id = $1
            ORDER BY block_number DESC LIMIT $2",
            &[&(chain_id as i64), &(limit as i64)],
        )
        .await?;
        blocks.sort_by(|a, b| b.number.cmp(&a.number));

        Ok(blocks)
    }

    async fn load_latest_history_identities(
        &self,
        keys: &[EntityKey],
    ) -> Result<HashMap<EntityKey, HistoryIdentity>, RepoError> {
        let kinds: Vec<&str> = keys.iter().map(|key| key.kind.as_str()).collect();
        let ids: Vec<&str> = keys.iter().map(|key| key.id.as_str()).collect();

        let client = self.client.lock().await;
        let rows: Vec<IdentityRow> = load_data_list(
            &client,
            "SELECT DISTINCT ON (entity_kind, entity_id)
            entity_kind, entity_id, chain_id, block_number, block_timestamp, log_index
            FROM multidexing_entity_history
            WHERE (entity_kind, entity_id) IN (SELECT * FROM UNNEST($1::TEXT[], $2::TEXT[]))
            ORDER BY entity_kind, entity_id, serial DESC",
            &[&kinds, &ids],
        )
        .await?;

        Ok(raw_queries::to_identities(rows))
    }

    async fn load_history_records_in_scope(
        &self,
        scope: &RollbackScope,
    ) -> Result<Vec<EntityHistoryRecord>, RepoError> {
        let query = format!(
            "SELECT * FROM multidexing_entity_history WHERE {}",
            scope_condition(scope)
        );

        let client = self.client.lock().await;
        let rows: Vec<HistoryRow> = load_data_list(&client, &query, &[]).await?;

        raw_queries::to_history_records(rows)
    }

    async fn load_history_record_at(
        &self,
        key: &EntityKey,
        identity: &HistoryIdentity,
    ) -> Result<Option<EntityHistoryRecord>, RepoError> {
        let client = self.client.lock().await;
        let rows: Vec<HistoryRow> = load_data_list(
            &client,
            "SELECT * FROM multidexing_entity_history
            WHERE entity_kind = $1 AND entity_id = $2
            AND chain_id = $3 AND block_number = $4 AND log_index = $5 AND block_timestamp = $6",
            &[
                &key.kind,
                &key.id,
                &(identity.chain_id as i64),
                &(identity.block_number as i64),
                &(identity.log_index as i64),
                &(identity.block_timestamp as i64),
            ],
        )
        .await?;

        Ok(raw_queries::to_history_records(rows)?.pop())
    }

    async fn load_first_invalidated_event_blocks(
        &self,
        scope: &RollbackScope,
    ) -> Result<HashMap<ChainId, u64>, RepoError> {
        let query = format!(
            "SELECT chain_id, MIN(block_number) AS block_number FROM multidexing_raw_events
            WHERE {} GROUP BY chain_id",
            scope_condition(scope)
        );

        let client = self.client.lock().await;
        let rows: Vec<FirstBlockRow> = load_data_list(&client, &query, &[]).await?;

        Ok(rows.into_iter().map(|row| (row.chain_id, row.block_number)).collect())
    }

    async fn apply_rollback(&self, plan: &RollbackPlan) -> Result<(), RepoError> {
        let mut client = self.client.lock().await;
        let txn = client.transaction().await?;

        raw_queries::delete_in_scope(&txn, &plan.scope).await?;
        raw_queries::apply_entity_changes(&txn, &plan.restores).await?;
        raw_queries::upsert_checkpoints(&txn, &plan.checkpoints).await?;
        raw_queries::delete_blocks_above(&txn, &plan.rewinds).await?;

        txn.commit().await?;

        Ok(())
    }

    async fn prune(&self, chain_id: ChainId, min_block_number: u64) -> Result<(), RepoError> {
        let mut client = self.client.lock().await;
        let txn = client.transaction().await?;

        raw_queries::prune(&txn, chain_id, min_block_number).await?;

        txn.commit().await?;

        Ok(())
    }
}
