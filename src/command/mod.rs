//! Command dispatch and handlers for the guest agent

mod dispatcher;
pub mod handlers;

pub use dispatcher::{CommandDispatcher, Reply, ResultBuf};
pub use handlers::HandlerContext;
