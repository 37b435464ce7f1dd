pub mod daemon;
pub mod emit;
pub mod probe;
pub mod queue;
pub mod store;
