// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # tracefront
//!
//! Event-capture frontend for consistency-checking simulators.
//!
//! An instrumentation engine invokes the [`Capture`] callbacks from the
//! monitored program's own threads. Each callback turns what it observed
//! into an [`Event`], stamps it with a global sequence id and pushes it into
//! a bounded queue. A single drain thread encodes events into fixed 43-byte
//! big-endian records and writes them to the trace sink, flushing after
//! every record so that backends can consume the stream over a pipe.
//!
//! In lockstep mode a thread that emitted a synchronization boundary
//! (the end of the region before a lock acquire or release) blocks until
//! every backend has echoed its thread id back over the thread's private
//! channel.

pub mod capture;
pub mod collision;
pub mod config;
pub mod context;
pub mod drain;
pub mod event;
pub mod fault;
pub mod fifo;
pub mod lockstep;
pub mod memory;
pub mod queue;
pub mod sink;
pub mod site;
pub mod stats;
pub mod types;
pub mod wire;

pub use capture::Access;
pub use capture::Capture;
pub use capture::CodeSite;
pub use config::Config;
pub use context::ThreadContext;
pub use event::Event;
pub use event::EventKind;
pub use event::Semantics;
pub use event::SiteInfo;
pub use fault::CaptureFault;
pub use fault::CaptureResult;
pub use lockstep::LockstepSync;
pub use memory::MemoryReader;
pub use memory::ProcessMemory;
pub use queue::EventQueue;
pub use stats::StatsReport;
pub use stats::TraceStats;
pub use types::ThreadId;
pub use wire::RECORD_SIZE;
