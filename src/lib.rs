//! Library surface for the TitanCompute agent binary and its integration
//! tests: configuration, quantization, telemetry, model management, token
//! validation, the coordinator client, and the RPC server implementation.

pub mod config;
pub mod coordinator;
pub mod model_manager;
pub mod proto;
pub mod quantization;
pub mod server;
pub mod telemetry;
pub mod token;
