//! Site state machine and DR operation handling

pub mod handlers;
pub mod manager;

pub use handlers::{
    site_leader_election, DrTimeouts, HandlerContext, HandlerRegistry, OperationHandler,
};
pub use manager::{VdcManager, VdcManagerConfig};
