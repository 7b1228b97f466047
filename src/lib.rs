//! paude: isolated, network-restricted container sessions for AI coding agents.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![warn(missing_copy_implementations)]
#![deny(unused_must_use)]
#![deny(unsafe_op_in_unsafe_fn)]

/// Execution backends: the local container engine and the remote cluster.
pub mod backends;
/// The command-line surface.
pub mod cli;
/// Runtime configuration read from the environment.
pub mod config;
/// Core session management and domain types.
pub mod core;
/// Credential projection onto session workloads.
pub mod credentials;
/// Egress enforcement: the forward proxy and confining network policy.
pub mod egress;
/// Image hashing and materialization.
pub mod image;
/// Shared filesystem paths and workspace resolution.
pub mod utils;
/// Workspace file synchronization between host and session.
pub mod workspace_sync;
