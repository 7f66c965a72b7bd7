//! scheduler-core – hierarchical fair-share scheduling engine.
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── resources        – JobResources lattice (spec §3, §4.1)
//! ├── element/         – pool-tree element variants (spec §3, §9)
//! ├── fair_share/       – periodic fair-share updater (spec §4.1)
//! ├── preemption/       – preemptible-job tracker + preemption planner (spec §4.6, §4.7)
//! ├── scheduling/       – per-heartbeat scheduling state machine (spec §4.2-4.5)
//! ├── scheduling_context – per-heartbeat mutable node view (spec §4)
//! ├── tree/             – live tree + immutable snapshot (spec §3, §9)
//! ├── tree_host/        – multi-tree dispatcher (spec §4.9)
//! ├── node_shard/       – per-shard heartbeat pipeline (spec §4.8)
//! ├── controller        – operation controller trait (spec §6, consumed)
//! ├── job               – job lifecycle (spec §3)
//! ├── config/           – pool-tree YAML configuration (spec §6)
//! ├── error             – structured error types (spec §7)
//! ├── proto/            – generated gRPC/protobuf types (spec §6)
//! └── grpc              – tonic service wiring the proto onto node_shard
//! ```

pub mod config;
pub mod controller;
pub mod element;
pub mod error;
pub mod fair_share;
pub mod grpc;
pub mod job;
pub mod node_shard;
pub mod preemption;
pub mod proto;
pub mod resources;
pub mod scheduling;
pub mod scheduling_context;
pub mod tree;
pub mod tree_host;
