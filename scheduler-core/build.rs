/// Build script – compiles protobuf definitions into Rust source code.
///
/// tonic-build wraps prost-build and additionally generates tonic server/client
/// stubs. The generated files are written to `OUT_DIR` (managed by Cargo) and
/// pulled into the crate via `tonic::include_proto!` in `src/proto/mod.rs`.
///
/// Prerequisites
/// -------------
/// `protoc` (the protobuf compiler) must be available on `$PATH`, or its path
/// must be set in the `PROTOC` environment variable before running `cargo build`.
/// Install on Ubuntu/Debian: `sudo apt install -y protobuf-compiler`
/// Install on macOS:          `brew install protobuf`
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = "proto";
    let proto_file = format!("{}/scheduling.proto", proto_root);

    println!("cargo:rerun-if-changed={}", proto_file);

    tonic_build::configure()
        // Generate both server (node heartbeat RPC) and client stubs so the
        // node-agent simulator crate can link the same generated types.
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_protos(&[proto_file.as_str()], &[proto_root])?;

    Ok(())
}
