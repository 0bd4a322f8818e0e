pub mod connection;
pub mod engine;
pub mod history;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod types;
pub mod wire;
