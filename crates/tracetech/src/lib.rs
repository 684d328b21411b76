pub use tracetech_config::{config, persistence, types};
pub use tracetech_sync::{
    attachments, channel, engine, error, fallback, insights, memory, projection, reconcile,
    remote, seed, session, writes,
};

pub mod cli;
