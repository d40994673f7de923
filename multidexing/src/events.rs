mod event;
mod event_params;

pub use event::{Event, EventKey, EventPosition};
pub use event_params::EventParams;
