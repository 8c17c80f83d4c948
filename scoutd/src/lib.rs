pub mod attach;
pub mod codegen;
pub mod config;
pub mod consumer;
pub mod decode;
pub mod lifecycle;
pub mod metrics;
pub mod offsets;
pub mod perf;
pub mod schema;
pub mod semaphores;
pub mod sink;
