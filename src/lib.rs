//! VibeTunnel core: the PTY session, streaming, and federation engine behind
//! a terminal-sharing server.
//!
//! This crate owns four tightly-coupled subsystems: the PTY session manager,
//! the stream watcher / terminal materializer pipeline, the control-plane
//! UNIX socket, and HQ/remote federation. Everything outside of that core
//! (HTTP transport, Git command execution, push notifications, mDNS, the
//! native GUI) is treated as an external collaborator and only appears here
//! as a trait boundary ([`git_ops::GitOps`]) or is left for a caller to wire
//! in.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]
#![deny(unsafe_op_in_unsafe_fn)]

/// Buffer aggregator: multiplexes local and remote snapshots to subscribers.
pub mod aggregator;
/// Asciinema v2 writer/reader.
pub mod asciinema;
/// Length-prefixed typed message codec.
pub mod codec;
/// Configuration store (`config.json`), validated and hot-reloaded.
pub mod config;
/// Control-plane UNIX socket server and client helpers.
pub mod control;
/// Error dedup: suppress repeated parser/log errors per key.
pub mod dedup;
/// Activity / title / prompt detector.
pub mod detector;
/// Error taxonomy shared across the crate.
pub mod errors;
/// The `GitOps` trait: the only Git surface this crate depends on.
pub mod git_ops;
/// Tracing/logging setup for the daemon and one-shot CLI invocations.
pub mod logging;
/// Session registry: create/list/attach/kill, control directory layout.
pub mod manager;
/// Terminal materializer: headless VT emulator + binary snapshot encoding.
pub mod materializer;
/// Control directory / session directory path layout.
pub mod paths;
/// PTY session: spawn, mirror I/O, resize, reap.
pub mod pty;
/// Remote registry and HQ client (federation).
pub mod remote;
/// Session data model.
pub mod session;
/// Buffer snapshot binary encoding (wire format version 1).
pub mod snapshot;
/// File-tail stream watcher with prune-on-clear replay.
pub mod stream_watcher;
/// Startup/shutdown wiring and single-instance guarantee.
pub mod wiring;
