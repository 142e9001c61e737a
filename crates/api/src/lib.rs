//! Generated wire types and gRPC client/server stubs for the orchestration
//! hub's `AgentHub` service, compiled from `proto/v1/hub.proto` by `build.rs`.

pub mod gen {
    pub mod api {
        pub mod v1 {
            tonic::include_proto!("api.v1");
        }
    }
}

pub use gen::api::v1::*;
