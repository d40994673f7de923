use std::collections::{BTreeMap, BTreeSet, HashMap};

use ethers::abi::{Event as AbiEvent, HumanReadableParser, RawLog, Token};
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Address, Block, BlockNumber, Filter, Log, TxHash, H256, I256, U64};
use futures_util::future::try_join_all;
use serde_json::{Map, Value};

use super::{BlockRef, ChainDataSource, EventsPage, SourceError, WatchedAddress};
use crate::{ChainId, Event};

const BLOCKS_CHUNK_SIZE: usize = 4;

/// Generic EVM JSON-RPC chain data source.
///
/// Every contract whose events should be decoded must be described with the human-readable
/// ABI of each event, e.g. `event Transfer(address indexed from, address indexed to, uint256 value)`.
pub struct EvmJsonRpcSource {
    provider: Provider<Http>,
    events: HashMap<(String, H256), AbiEvent>,
}

impl EvmJsonRpcSource {
    pub fn new(json_rpc_url: &str) -> Result<Self, SourceError> {
        let provider = Provider::<Http>::try_from(json_rpc_url)
            .map_err(|error| SourceError::Malformed(error.to_string()))?;

        Ok(Self {
            provider,
            events: HashMap::new(),
        })
    }

    pub fn add_event_abi(mut self, contract_name: &str, abi: &str) -> Result<Self, SourceError> {
        let event = HumanReadableParser::parse_event(abi)
            .map_err(|error| SourceError::Malformed(format!("{abi}: {error}")))?;

        self.events.insert((contract_name.to_string(), event.signature()), event);

        Ok(self)
    }

    fn topics_for(&self, contract_name: &str) -> Vec<H256> {
        self.events
            .keys()
            .filter(|(name, _topic)| name == contract_name)
            .map(|(_name, topic)| *topic)
            .collect()
    }

    async fn fetch_block(&self, block_number: u64) -> Result<BlockRef, SourceError> {
        let block = self
            .provider
            .get_block(BlockNumber::Number(U64::from(block_number)))
            .await
            .map_err(transient)?
            .ok_or_else(|| {
                SourceError::Transient(format!("block {block_number} is not available yet"))
            })?;

        to_block_ref(&block)
    }

    async fn fetch_blocks(
        &self,
        block_numbers: BTreeSet<u64>,
    ) -> Result<BTreeMap<u64, BlockRef>, SourceError> {
        let block_numbers: Vec<_> = block_numbers.into_iter().collect();
        let mut blocks = BTreeMap::new();

        for chunk in block_numbers.chunks(BLOCKS_CHUNK_SIZE) {
            let fetched = try_join_all(chunk.iter().map(|number| self.fetch_block(*number))).await?;

            blocks.extend(fetched.into_iter().map(|block| (block.number, block)));
        }

        Ok(blocks)
    }

    fn decode(
        &self,
        chain_id: ChainId,
        log: &Log,
        watched_address: &WatchedAddress,
        block_timestamp: u64,
    ) -> Result<Option<Event>, SourceError> {
        if log.removed == Some(true) {
            return Ok(None);
        }

        let Some(topic) = log.topics.first() else {
            return Ok(None);
        };
        let Some(abi) = self.events.get(&(watched_address.contract_name.clone(), *topic)) else {
            return Ok(None);
        };

        let decoded = abi
            .parse_log(RawLog::from(log.clone()))
            .map_err(|error| SourceError::Malformed(format!("{}: {error}", abi.name)))?;
        let params: Map<String, Value> = decoded
            .params
            .into_iter()
            .map(|param| (param.name, token_to_json(param.value)))
            .collect();

        Ok(Some(Event {
            chain_id,
            contract_address: watched_address.address.clone(),
            contract_name: watched_address.contract_name.clone(),
            event_name: abi.name.clone(),
            params: Value::Object(params),
            block_hash: required(log.block_hash, "block_hash").map(|hash| format!("{hash:#x}"))?,
            block_number: required(log.block_number, "block_number")?.as_u64(),
            block_timestamp,
            transaction_hash: required(log.transaction_hash, "transaction_hash")
                .map(|hash| format!("{hash:#x}"))?,
            transaction_index: required(log.transaction_index, "transaction_index")?.as_u64(),
            log_index: required(log.log_index, "log_index")?.low_u64(),
        }))
    }
}

#[async_trait::async_trait]
impl ChainDataSource for EvmJsonRpcSource {
    async fn get_head_block(&self, _chain_id: ChainId) -> Result<BlockRef, SourceError> {
        let block_number = self.provider.get_block_number().await.map_err(transient)?;

        self.fetch_block(block_number.as_u64()).await
    }

    async fn get_block(
        &self,
        _chain_id: ChainId,
        block_number: u64,
    ) -> Result<BlockRef, SourceError> {
        self.fetch_block(block_number).await
    }

    async fn get_events(
        &self,
        chain_id: ChainId,
        from_block_number: u64,
        to_block_number: u64,
        watched_addresses: &[WatchedAddress],
    ) -> Result<EventsPage, SourceError> {
        let (first_block, last_block) = tokio::try_join!(
            self.fetch_block(from_block_number),
            self.fetch_block(to_block_number)
        )?;

        let mut filters = Vec::new();
        for watched_address in watched_addresses {
            let topics = self.topics_for(&watched_address.contract_name);
            if topics.is_empty() {
                continue;
            }

            let address: Address = watched_address.address.parse().map_err(|_error| {
                SourceError::Malformed(format!("invalid address {}", watched_address.address))
            })?;
            let filter = Filter::new()
                .address(address)
                .topic0(topics)
                .from_block(from_block_number)
                .to_block(last_block.number);

            filters.push((watched_address, filter));
        }

        let logs_per_filter = try_join_all(filters.iter().map(|(watched_address, filter)| async move {
            self.provider
                .get_logs(filter)
                .await
                .map(|logs| (*watched_address, logs))
        }))
        .await
        .map_err(transient)?;

        // Blocks holding logs and their parents, except the range edges fetched above
        let block_numbers: BTreeSet<u64> = logs_per_filter
            .iter()
            .flat_map(|(_watched_address, logs)| logs.iter())
            .filter_map(|log| log.block_number.map(|number| number.as_u64()))
            .flat_map(|number| [number.checked_sub(1), Some(number)])
            .flatten()
            .filter(|number| *number > from_block_number && *number < last_block.number)
            .collect();
        let mut blocks = self.fetch_blocks(block_numbers).await?;
        blocks.insert(first_block.number, first_block.clone());
        blocks.insert(last_block.number, last_block.clone());

        let mut events = Vec::new();
        for (watched_address, logs) in &logs_per_filter {
            for log in logs {
                let block_number = required(log.block_number, "block_number")?.as_u64();
                let block_timestamp = blocks
                    .get(&block_number)
                    .map(|block| block.timestamp)
                    .ok_or_else(|| SourceError::Transient(format!("missing block {block_number}")))?;

                if let Some(event) = self.decode(chain_id, log, watched_address, block_timestamp)? {
                    events.push(event);
                }
            }
        }
        events.sort_by_key(|event| event.position());

        Ok(EventsPage {
            events,
            first_block,
            last_block,
            blocks: blocks.into_values().collect(),
        })
    }
}

fn to_block_ref(block: &Block<TxHash>) -> Result<BlockRef, SourceError> {
    Ok(BlockRef {
        number: required(block.number, "number")?.as_u64(),
        hash: required(block.hash, "hash").map(|hash| format!("{hash:#x}"))?,
        parent_hash: format!("{:#x}", block.parent_hash),
        timestamp: block.timestamp.low_u64(),
    })
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, SourceError> {
    value.ok_or_else(|| SourceError::Malformed(format!("missing {field}")))
}

fn transient(error: ProviderError) -> SourceError {
    SourceError::Transient(error.to_string())
}

fn token_to_json(token: Token) -> Value {
    match token {
        Token::Address(address) => Value::String(format!("{address:#x}")),
        Token::FixedBytes(bytes) | Token::Bytes(bytes) => Value::String(format!(
            "0x{}",
            bytes.iter().map(|byte| format!("{byte:02x}")).collect::<String>()
        )),
        Token::Int(value) => Value::String(I256::from_raw(value).to_string()),
        Token::Uint(value) => Value::String(value.to_string()),
        Token::Bool(value) => Value::Bool(value),
        Token::String(value) => Value::String(value),
        Token::FixedArray(tokens) | Token::Array(tokens) | Token::Tuple(tokens) => {
            Value::Array(tokens.into_iter().map(token_to_json).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::U256;

    use super::*;

    #[test]
    fn encodes_tokens_as_plain_json() {
        let address: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();

        assert_eq!(
            token_to_json(Token::Address(address)),
            Value::String("0x00000000000000000000000000000000000000aa".to_string())
        );
        assert_eq!(
            token_to_json(Token::Uint(U256::from(1_000u64))),
            Value::String("1000".to_string())
        );
        assert_eq!(
            token_to_json(Token::Int(U256::MAX)),
            Value::String("-1".to_string())
        );
        assert_eq!(
            token_to_json(Token::Bytes(vec![0x0a, 0xff])),
            Value::String("0x0aff".to_string())
        );
    }

    #[test]
    fn registers_event_topics_per_contract() {
        let source = EvmJsonRpcSource::new("http://localhost:8545")
            .unwrap()
            .add_event_abi(
                "Token",
                "event Transfer(address indexed from, address indexed to, uint256 value)",
            )
            .unwrap();

        assert_eq!(source.topics_for("Token").len(), 1);
        assert!(source.topics_for("Pair").is_empty());
    }
}
