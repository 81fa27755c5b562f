mod commands;
mod poller;
mod query;
mod render;

pub use commands::{definitions, CommandHandler};
pub use poller::FeedPoller;
pub use query::QueryHandler;
