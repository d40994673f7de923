mod error;
mod handler;
mod handler_context;
mod loader_context;
mod processor;

pub use error::HandlerError;
pub use handler::{Handler, Handlers};
pub use handler_context::HandlerContext;
pub use loader_context::LoaderContext;

pub(crate) use processor::{ProcessedUnit, ProcessingError, Processor};
