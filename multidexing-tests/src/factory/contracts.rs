use multidexing::{ChainId, Contract};

use super::{PingHandler, PoolCreatedHandler, SwapHandler, TransferHandler};

pub const TOKEN_ADDRESS: &str = "0x00000000000000000000000000000000000000aa";
pub const FACTORY_ADDRESS: &str = "0x00000000000000000000000000000000000000fa";
pub const JOURNAL_ADDRESS: &str = "0x00000000000000000000000000000000000000bb";

pub fn token_contract(chain_ids: &[ChainId]) -> Contract {
    chain_ids
        .iter()
        .fold(Contract::new("Token"), |contract, chain_id| {
            contract.add_address(TOKEN_ADDRESS, chain_id, 0)
        })
        .add_handler(TransferHandler)
}

pub fn factory_contract(chain_id: ChainId) -> Contract {
    Contract::new("Factory")
        .add_address(FACTORY_ADDRESS, &chain_id, 0)
        .add_handler(PoolCreatedHandler)
}

/// Template for pools registered by the factory
pub fn pool_contract() -> Contract {
    Contract::new("Pool").add_handler(SwapHandler)
}

pub fn journal_contract(chain_ids: &[ChainId]) -> Contract {
    chain_ids
        .iter()
        .fold(Contract::new("Journal"), |contract, chain_id| {
            contract.add_address(JOURNAL_ADDRESS, chain_id, 0)
        })
        .add_handler(PingHandler)
}
