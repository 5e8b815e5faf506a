//! Generated gRPC types and service traits for the coordinator/agent wire
//! contract, compiled from `proto/titancompute.proto` by `build.rs`.

pub mod titancompute {
    tonic::include_proto!("titancompute");
}
