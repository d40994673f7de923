use multidexing::{Handler, HandlerContext, HandlerError, LoaderContext};

use super::{Balance, Journal, Pool};

pub struct TransferHandler;

#[async_trait::async_trait]
impl Handler for TransferHandler {
    fn event_name(&self) -> &'static str {
        "Transfer"
    }

    async fn load(&self, context: &LoaderContext<'_>) -> Result<(), HandlerError> {
        let to = context.get_event_params().get_string("to")?;
        context.load::<Balance>(&to).await?;

        Ok(())
    }

    fn handle(&self, context: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        let params = context.get_event_params();
        let to = params.get_string("to")?;
        let amount = params.get_u64("amount")?;

        let balance = context.get::<Balance>(&to)?.map_or(0, |balance| balance.amount);

        context.set(&Balance {
            id: to,
            amount: balance + amount,
        })
    }
}

pub struct PoolCreatedHandler;

#[async_trait::async_trait]
impl Handler for PoolCreatedHandler {
    fn event_name(&self) -> &'static str {
        "PoolCreated"
    }

    fn handle(&self, context: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        let address = context.get_event_params().get_address_string("pool")?;

        context.register_contract("Pool", &address);
        context.set(&Pool {
            address,
            swaps: 0,
            volume: 0,
        })
    }
}

pub struct SwapHandler;

#[async_trait::async_trait]
impl Handler for SwapHandler {
    fn event_name(&self) -> &'static str {
        "Swap"
    }

    async fn load(&self, context: &LoaderContext<'_>) -> Result<(), HandlerError> {
        let address = context.event().contract_address.to_lowercase();
        context.load::<Pool>(&address).await?;

        Ok(())
    }

    fn handle(&self, context: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        let address = context.event().contract_address.to_lowercase();
        let amount = context.get_event_params().get_u64("amount")?;

        let pool = context
            .get::<Pool>(&address)?
            .ok_or_else(|| HandlerError::custom(format!("swap on unknown pool {address}")))?;

        context.set(&Pool {
            swaps: pool.swaps + 1,
            volume: pool.volume + amount,
            ..pool
        })
    }
}

pub const JOURNAL_ID: &str = "journal";

/// Appends `chain:block:log` of every ping to the shared journal
pub struct PingHandler;

#[async_trait::async_trait]
impl Handler for PingHandler {
    fn event_name(&self) -> &'static str {
        "Ping"
    }

    async fn load(&self, context: &LoaderContext<'_>) -> Result<(), HandlerError> {
        context.load::<Journal>(JOURNAL_ID).await?;

        Ok(())
    }

    fn handle(&self, context: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        let event = context.event();
        let mut journal = context.get::<Journal>(JOURNAL_ID)?.unwrap_or_else(|| Journal {
            id: JOURNAL_ID.to_string(),
            entries: vec![],
        });

        journal.entries.push(format!(
            "{}:{}:{}",
            event.chain_id, event.block_number, event.log_index
        ));

        context.set(&journal)
    }
}
