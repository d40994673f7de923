pub struct SQLikeMigrations;

impl SQLikeMigrations {
    pub fn create_entities() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS multidexing_entities (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                fields JSONB NOT NULL,
                updated_at BIGINT NOT NULL DEFAULT EXTRACT(EPOCH FROM CURRENT_TIMESTAMP)::BIGINT,
                PRIMARY KEY (kind, id)
            )",
        ]
    }
    pub fn drop_entities() -> &'static [&'static str] {
        &["DROP TABLE IF EXISTS multidexing_entities"]
    }

    pub fn create_entity_history() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS multidexing_entity_history (
                serial BIGSERIAL PRIMARY KEY,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                snapshot JSONB,
                chain_id BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                block_timestamp BIGINT NOT NULL,
                log_index BIGINT NOT NULL,
                previous_chain_id BIGINT NOT NULL,
                previous_block_number BIGINT NOT NULL,
                previous_block_timestamp BIGINT NOT NULL,
                previous_log_index BIGINT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS multidexing_entity_history_identity_index
            ON multidexing_entity_history(entity_kind, entity_id, chain_id, block_number, log_index)",
            "CREATE INDEX IF NOT EXISTS multidexing_entity_history_order_index
            ON multidexing_entity_history(block_timestamp, chain_id, block_number)",
        ]
    }
    pub fn drop_entity_history() -> &'static [&'static str] {
        &["DROP TABLE IF EXISTS multidexing_entity_history"]
    }

    /// Duplicates are tolerated: a raw event is only ever read back for rollbacks and pruning
    pub fn create_raw_events() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS multidexing_raw_events (
                chain_id BIGINT NOT NULL,
                contract_address TEXT NOT NULL,
                contract_name TEXT NOT NULL,
                event_name TEXT NOT NULL,
                params JSONB NOT NULL,
                block_hash TEXT NOT NULL,
                block_number BIGINT NOT NULL,
                block_timestamp BIGINT NOT NULL,
                transaction_hash TEXT NOT NULL,
                transaction_index BIGINT NOT NULL,
                log_index BIGINT NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE INDEX IF NOT EXISTS multidexing_raw_events_chain_block_log_index
            ON multidexing_raw_events(chain_id, block_number, log_index)",
        ]
    }
    pub fn drop_raw_events() -> &'static [&'static str] {
        &["DROP TABLE IF EXISTS multidexing_raw_events"]
    }

    pub fn create_contract_registrations() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS multidexing_contract_registrations (
                chain_id BIGINT NOT NULL,
                address TEXT NOT NULL,
                contract_name TEXT NOT NULL,
                block_number BIGINT NOT NULL,
                log_index BIGINT NOT NULL,
                block_timestamp BIGINT NOT NULL,
                registering_contract_address TEXT NOT NULL,
                registering_contract_name TEXT NOT NULL,
                registering_event_name TEXT NOT NULL,
                PRIMARY KEY (chain_id, address)
            )",
        ]
    }
    pub fn drop_contract_registrations() -> &'static [&'static str] {
        &["DROP TABLE IF EXISTS multidexing_contract_registrations"]
    }

    pub fn create_chain_checkpoints() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS multidexing_chain_checkpoints (
                chain_id BIGINT PRIMARY KEY,
                start_block_number BIGINT NOT NULL,
                end_block_number BIGINT,
                latest_fetched_block_number BIGINT,
                latest_processed_block_number BIGINT,
                processed_block_number BIGINT,
                processed_log_index BIGINT,
                events_processed BIGINT NOT NULL,
                batches_fetched BIGINT NOT NULL,
                first_event_block_number BIGINT,
                caught_up_at BIGINT,
                is_live BOOLEAN NOT NULL,
                is_finished BOOLEAN NOT NULL
            )",
        ]
    }
    pub fn drop_chain_checkpoints() -> &'static [&'static str] {
        &["DROP TABLE IF EXISTS multidexing_chain_checkpoints"]
    }

    pub fn create_chain_blocks() -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS multidexing_chain_blocks (
                chain_id BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                block_hash TEXT NOT NULL,
                parent_hash TEXT NOT NULL,
                block_timestamp BIGINT NOT NULL,
                PRIMARY KEY (chain_id, block_number)
            )",
        ]
    }
    pub fn drop_chain_blocks() -> &'static [&'static str] {
        &["DROP TABLE IF EXISTS multidexing_chain_blocks"]
    }

    pub fn create_reset_counts() -> &'static [&'static str] {
        &["CREATE TABLE IF NOT EXISTS multidexing_reset_counts (
                id BIGSERIAL PRIMARY KEY,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"]
    }

    pub fn get_internal_migrations() -> Vec<&'static str> {
        [
            Self::create_entities(),
            Self::create_entity_history(),
            Self::create_raw_events(),
            Self::create_contract_registrations(),
            Self::create_chain_checkpoints(),
            Self::create_chain_blocks(),
            Self::create_reset_counts(),
        ]
        .concat()
    }

    /// Reset counts survive resets
    pub fn get_reset_internal_migrations() -> Vec<&'static str> {
        [
            Self::drop_entities(),
            Self::drop_entity_history(),
            Self::drop_raw_events(),
            Self::drop_contract_registrations(),
            Self::drop_chain_checkpoints(),
            Self::drop_chain_blocks(),
        ]
        .concat()
    }
}
