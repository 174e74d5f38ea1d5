pub mod dispatcher;
pub mod parser;

pub use dispatcher::CommandDispatcher;
