pub mod agent;
pub mod dispatcher;
pub mod fetch;
pub mod frontier;
pub mod lifecycle;
pub mod limiter;
pub mod orchestrator;
pub mod task;
pub mod url;
