/// Proto-generated modules.
///
/// `tonic::include_proto!` expands to an `include!` of the file that
/// prost/tonic-build wrote into `OUT_DIR` during the build script.
pub mod scheduling_v1 {
    // Package name declared in scheduling.proto is `scheduling.v1`.
    tonic::include_proto!("scheduling.v1");
}
