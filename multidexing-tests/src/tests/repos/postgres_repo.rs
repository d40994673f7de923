#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use multidexing::chain_reorg::{ReorgCheckpoint, RollbackEngine, RollbackScope};
    use multidexing::storage_writer::RecordedBlock;
    use multidexing::{
        BlockRef, Chain, CheckpointTracker, ContractRegistration, EntityKey, HistoryIdentity,
        MultiChainMode, PostgresRepo, Repo, RepoError, WriteUnit,
    };

    use crate::factory::{fetched_transfer_event, transfer_unit, Balance, MockChainSource};
    use crate::test_runner;

    async fn balance(repo: &PostgresRepo, id: &str) -> Option<u64> {
        repo.read_entity("Balance", id)
            .await
            .unwrap()
            .map(|entity| entity.to_record::<Balance>().unwrap().amount)
    }

    fn block(chain_id: u64, number: u64) -> BlockRef {
        BlockRef {
            number,
            hash: format!("0x{chain_id}-{number}-0"),
            parent_hash: format!("0x{chain_id}-{}-0", number.saturating_sub(1)),
            timestamp: number * 10,
        }
    }

    async fn tracker(repo: &PostgresRepo) -> CheckpointTracker {
        let chains = [Chain::new(1, MockChainSource::new(1, 0))];

        CheckpointTracker::new(&chains, repo.read_chain_checkpoints().await.unwrap())
    }

    fn reorg(safe_block_number: u64) -> ReorgCheckpoint {
        ReorgCheckpoint {
            chain_id: 1,
            safe_block: block(1, safe_block_number),
        }
    }

    #[tokio::test]
    pub async fn commits_entities_history_and_checkpoints_together() {
        test_runner::run_test(|repo| async move {
            let event = fetched_transfer_event(1, 5, 0, "0xa", 10);

            repo.commit(&transfer_unit(&event, None)).await.unwrap();

            assert_eq!(balance(&repo, "0xa").await, Some(10));

            let checkpoints = repo.read_chain_checkpoints().await.unwrap();
            assert_eq!(checkpoints.len(), 1);
            assert_eq!(checkpoints[0].latest_processed_block_number, Some(5));
            assert_eq!(checkpoints[0].processed_position, Some(event.position()));

            let key = EntityKey::new("Balance", "0xa");
            let identities = repo.load_latest_history_identities(&[key.clone()]).await.unwrap();
            assert_eq!(identities.get(&key).map(|identity| identity.block_number), Some(5));
        })
        .await;
    }

    #[tokio::test]
    pub async fn rejects_a_conflicting_unit_as_a_whole() {
        test_runner::run_test(|repo| async move {
            let event = fetched_transfer_event(1, 5, 0, "0xa", 10);
            repo.commit(&transfer_unit(&event, None)).await.unwrap();

            let mut conflicting = transfer_unit(&event, Some((&event, 10)));
            conflicting.raw_events.clear();
            let result = repo.commit(&conflicting).await;

            assert!(matches!(result, Err(RepoError::Conflict(_))));
            assert_eq!(balance(&repo, "0xa").await, Some(10));
        })
        .await;
    }

    #[tokio::test]
    pub async fn resolves_history_records_by_their_full_identity() {
        test_runner::run_test(|repo| async move {
            let event = fetched_transfer_event(1, 5, 0, "0xa", 10);
            repo.commit(&transfer_unit(&event, None)).await.unwrap();
            let key = EntityKey::new("Balance", "0xa");
            let identity = HistoryIdentity::of(&event);

            let record = repo.load_history_record_at(&key, &identity).await.unwrap();
            assert_eq!(record.map(|record| record.identity), Some(identity));

            let other_timestamp = HistoryIdentity {
                block_timestamp: identity.block_timestamp + 1,
                ..identity
            };
            assert!(repo
                .load_history_record_at(&key, &other_timestamp)
                .await
                .unwrap()
                .is_none());
        })
        .await;
    }

    #[tokio::test]
    pub async fn rolls_back_to_the_value_before_the_safe_block() {
        test_runner::run_test(|repo| async move {
            let first = fetched_transfer_event(1, 30, 0, "0xa", 5);
            repo.commit(&transfer_unit(&first, None)).await.unwrap();
            let second = fetched_transfer_event(1, 50, 0, "0xa", 10);
            repo.commit(&transfer_unit(&second, Some((&first, 5)))).await.unwrap();
            let created = fetched_transfer_event(1, 60, 0, "0xb", 1);
            repo.commit(&transfer_unit(&created, None)).await.unwrap();

            let repo = Arc::new(repo);
            let engine = RollbackEngine::new(repo.clone(), MultiChainMode::Unordered);
            let plan = engine.plan(&reorg(40), &tracker(&repo).await).await.unwrap();
            repo.apply_rollback(&plan).await.unwrap();

            assert_eq!(balance(&repo, "0xa").await, Some(5));
            assert_eq!(balance(&repo, "0xb").await, None);

            let checkpoints = repo.read_chain_checkpoints().await.unwrap();
            assert_eq!(checkpoints[0].latest_processed_block_number, Some(40));

            let scope = RollbackScope::Chain {
                chain_id: 1,
                safe_block_number: 0,
            };
            let remaining_blocks: Vec<u64> = repo
                .load_history_records_in_scope(&scope)
                .await
                .unwrap()
                .iter()
                .map(|record| record.identity.block_number)
                .collect();
            assert_eq!(remaining_blocks, vec![30]);
        })
        .await;
    }

    #[tokio::test]
    pub async fn persists_registrations_and_recent_blocks() {
        test_runner::run_test(|repo| async move {
            let registration = ContractRegistration {
                chain_id: 1,
                address: "0xc1".to_string(),
                contract_name: "Pool".to_string(),
                block_number: 10,
                log_index: 2,
                block_timestamp: 100,
                registering_contract_address: "0xfa".to_string(),
                registering_contract_name: "Factory".to_string(),
                registering_event_name: "PoolCreated".to_string(),
            };
            let unit = WriteUnit {
                contract_registrations: vec![registration.clone()],
                block_refs: [3, 9, 7]
                    .into_iter()
                    .map(|number| RecordedBlock {
                        chain_id: 1,
                        block: block(1, number),
                    })
                    .collect(),
                ..Default::default()
            };

            repo.commit(&unit).await.unwrap();

            assert_eq!(repo.load_contract_registrations().await.unwrap(), vec![registration]);

            let recent_blocks = repo.load_recent_blocks(1, 2).await.unwrap();
            assert_eq!(recent_blocks, vec![block(1, 9), block(1, 7)]);
            assert!(repo.load_recent_blocks(2, 2).await.unwrap().is_empty());
        })
        .await;
    }

    #[tokio::test]
    pub async fn prunes_all_but_the_latest_stale_history_record() {
        test_runner::run_test(|repo| async move {
            let first = fetched_transfer_event(1, 5, 0, "0xa", 1);
            repo.commit(&transfer_unit(&first, None)).await.unwrap();
            let second = fetched_transfer_event(1, 50, 0, "0xa", 2);
            repo.commit(&transfer_unit(&second, Some((&first, 1)))).await.unwrap();
            let third = fetched_transfer_event(1, 95, 0, "0xa", 3);
            repo.commit(&transfer_unit(&third, Some((&second, 3)))).await.unwrap();

            repo.prune(1, 80).await.unwrap();

            let scope = RollbackScope::Chain {
                chain_id: 1,
                safe_block_number: 0,
            };
            let history_blocks: Vec<u64> = repo
                .load_history_records_in_scope(&scope)
                .await
                .unwrap()
                .iter()
                .map(|record| record.identity.block_number)
                .collect();
            assert_eq!(history_blocks, vec![50, 95]);

            let first_raw_event_blocks = repo.load_first_invalidated_event_blocks(&scope).await.unwrap();
            assert_eq!(first_raw_event_blocks.get(&1), Some(&95));
            assert_eq!(balance(&repo, "0xa").await, Some(6));
        })
        .await;
    }

    #[tokio::test]
    pub async fn keeps_reset_counts_across_resets() {
        test_runner::run_test(|repo| async move {
            let before = repo.get_last_reset_count().await.unwrap();

            repo.create_reset_count().await.unwrap();
            repo.commit(&transfer_unit(&fetched_transfer_event(1, 5, 0, "0xa", 1), None))
                .await
                .unwrap();
            repo.reset().await.unwrap();

            assert_eq!(repo.get_last_reset_count().await.unwrap(), before + 1);
            assert_eq!(balance(&repo, "0xa").await, None);
            assert!(repo.read_chain_checkpoints().await.unwrap().is_empty());
        })
        .await;
    }
}
