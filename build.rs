//! Generates the tonic client and server for the servant RPC surface.
//!
//! Message types are hand-written prost structs in `src/proto/mod.rs`, so only
//! the service plumbing is generated here and no `protoc` is required.

fn main() {
    let method = |name: &str, route: &str, input: &str, output: &str| {
        tonic_build::manual::Method::builder()
            .name(name)
            .route_name(route)
            .input_type(input)
            .output_type(output)
            .codec_path("tonic::codec::ProstCodec")
            .build()
    };

    let dispatcher = tonic_build::manual::Service::builder()
        .name("TicketDispatcher")
        .package("servant_cluster")
        .method(method(
            "get_tickets",
            "GetTickets",
            "crate::proto::Empty",
            "crate::proto::TicketsInfo",
        ))
        .method(method(
            "set_tickets",
            "SetTickets",
            "crate::proto::TicketsInfo",
            "crate::proto::Empty",
        ))
        .build();

    tonic_build::manual::Builder::new().compile(&[dispatcher]);

    println!("cargo:rerun-if-changed=build.rs");
}
