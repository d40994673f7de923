#[cfg(test)]
mod tests {
    use std::time::Duration;

    use multidexing::{index_chains, Chain, MemoryRepo, MultiChainMode};

    use crate::factory::{
        journal_contract, ping_event, test_config, token_contract, transfer_event, Balance,
        Journal, MockChainSource, JOURNAL_ID,
    };
    use crate::{init_tracing, wait_until};

    fn balance(repo: &MemoryRepo, id: &str) -> Option<u64> {
        repo.entity("Balance", id)
            .map(|entity| entity.to_record::<Balance>().unwrap().amount)
    }

    fn processed_block(repo: &MemoryRepo, chain_id: u64) -> Option<u64> {
        repo.checkpoint(chain_id)
            .and_then(|checkpoint| checkpoint.latest_processed_block_number)
    }

    #[tokio::test]
    async fn rolls_back_entities_created_in_reorged_blocks() {
        init_tracing();
        let repo = MemoryRepo::new();
        let source = MockChainSource::new(1, 100)
            .with_events(vec![transfer_event(1, 50, 0, "0xa", 10)]);
        let config = test_config(repo.clone())
            .add_chain(Chain::new(1, source.clone()))
            .add_contract(token_contract(&[1]));

        let handle = index_chains(config).await.unwrap();
        wait_until("chain 1 reaches its head", || processed_block(&repo, 1) >= Some(100)).await;
        assert_eq!(balance(&repo, "0xa"), Some(10));

        source.reorg_from(41, vec![]);
        source.set_head(101);
        wait_until("chain 1 indexes the new fork", || processed_block(&repo, 1) >= Some(101)).await;

        let summary = handle.stop().await.unwrap();

        assert_eq!(summary.rollbacks, 1);
        assert!(summary.stopped);
        assert_eq!(balance(&repo, "0xa"), None);
        assert!(repo.history().is_empty());
        assert!(repo.raw_events().is_empty());
    }

    #[tokio::test]
    async fn slow_chains_do_not_hold_back_unordered_chains() {
        init_tracing();
        let repo = MemoryRepo::new();
        let fast_source = MockChainSource::new(1, 40).with_events(
            (1..=5).map(|n| transfer_event(1, n * 5, 0, "0xa", n)).collect(),
        );
        let slow_source = MockChainSource::new(2, 40)
            .with_latency(Duration::from_millis(100))
            .with_events((1..=5).map(|n| transfer_event(2, n * 5, 0, "0xb", n)).collect());
        let config = test_config(repo.clone())
            .add_chain(Chain::new(1, fast_source).with_end_block(40))
            .add_chain(Chain::new(2, slow_source).with_end_block(40))
            .add_contract(token_contract(&[1, 2]));

        let handle = index_chains(config).await.unwrap();

        wait_until("chain 1 finishes", || {
            repo.checkpoint(1).is_some_and(|checkpoint| checkpoint.is_finished)
        })
        .await;
        assert!(!repo.checkpoint(2).is_some_and(|checkpoint| checkpoint.is_finished));

        let summary = handle.wait().await.unwrap();

        assert!(!summary.stopped);
        assert_eq!(summary.events_processed, 10);
        for checkpoint in &summary.checkpoints {
            assert!(checkpoint.is_finished);
            assert!(checkpoint.is_caught_up());
            assert_eq!(checkpoint.latest_processed_block_number, Some(40));
            assert_eq!(checkpoint.events_processed, 5);
        }
        assert_eq!(balance(&repo, "0xa"), Some(15));
        assert_eq!(balance(&repo, "0xb"), Some(15));
    }

    #[tokio::test]
    async fn commits_ordered_chains_by_timestamp() {
        init_tracing();
        let repo = MemoryRepo::new();
        let chain_a = MockChainSource::new(1, 20).with_events(vec![
            ping_event(1, 3, 0),
            ping_event(1, 10, 0),
            ping_event(1, 15, 0),
        ]);
        // Fetched last, yet its block 9 predates block 10 of chain 1
        let chain_b = MockChainSource::new(2, 20)
            .with_latency(Duration::from_millis(30))
            .with_events(vec![ping_event(2, 9, 0), ping_event(2, 12, 0)]);
        let config = test_config(repo.clone())
            .with_multi_chain_mode(MultiChainMode::Ordered)
            .add_chain(Chain::new(1, chain_a).with_end_block(20))
            .add_chain(Chain::new(2, chain_b).with_end_block(20))
            .add_contract(journal_contract(&[1, 2]));

        let summary = index_chains(config).await.unwrap().wait().await.unwrap();

        let journal: Journal = repo.entity("Journal", JOURNAL_ID).unwrap().to_record().unwrap();
        assert_eq!(
            journal.entries,
            vec!["1:3:0", "2:9:0", "1:10:0", "2:12:0", "1:15:0"]
        );
        assert_eq!(summary.events_processed, 5);
    }

    #[tokio::test]
    async fn breaks_timestamp_ties_by_chain_id() {
        init_tracing();
        let repo = MemoryRepo::new();
        let chain_a = MockChainSource::new(1, 10).with_events(vec![ping_event(1, 5, 0)]);
        let chain_b = MockChainSource::new(2, 10)
            .with_genesis_timestamp(20)
            .with_events(vec![ping_event(2, 3, 0), ping_event(2, 3, 1)]);
        let config = test_config(repo.clone())
            .with_multi_chain_mode(MultiChainMode::Ordered)
            .add_chain(Chain::new(2, chain_b).with_end_block(10))
            .add_chain(Chain::new(1, chain_a).with_end_block(10))
            .add_contract(journal_contract(&[1, 2]));

        index_chains(config).await.unwrap().wait().await.unwrap();

        let journal: Journal = repo.entity("Journal", JOURNAL_ID).unwrap().to_record().unwrap();
        assert_eq!(journal.entries, vec!["1:5:0", "2:3:0", "2:3:1"]);
    }

    #[tokio::test]
    async fn prunes_data_far_behind_the_processed_cursor() {
        init_tracing();
        let repo = MemoryRepo::new();
        let source = MockChainSource::new(1, 100).with_events(vec![
            transfer_event(1, 5, 0, "0xa", 1),
            transfer_event(1, 50, 0, "0xa", 2),
            transfer_event(1, 95, 0, "0xa", 3),
        ]);
        let config = test_config(repo.clone())
            .with_prune_n_blocks_away(20)
            .with_prune_interval(0)
            .add_chain(Chain::new(1, source).with_end_block(100))
            .add_contract(token_contract(&[1]));

        index_chains(config).await.unwrap().wait().await.unwrap();

        assert_eq!(balance(&repo, "0xa"), Some(6));
        let raw_event_blocks: Vec<u64> =
            repo.raw_events().iter().map(|event| event.block_number).collect();
        assert_eq!(raw_event_blocks, vec![95]);
        // The record at block 50 still backs a rollback to any block below 95
        let history_blocks: Vec<u64> = repo
            .history()
            .iter()
            .map(|record| record.identity.block_number)
            .collect();
        assert_eq!(history_blocks, vec![50, 95]);
        assert!(repo.recorded_blocks(1).iter().all(|block| block.number >= 80));
    }
}
