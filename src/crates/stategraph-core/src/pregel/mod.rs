//! Pregel-inspired execution engine for stateful graph workflows
//!
//! This module implements the bulk-synchronous execution model behind
//! [`CompiledGraph`](crate::CompiledGraph). Execution is divided into
//! **supersteps**; within one superstep every runnable node sees the same
//! state, and their writes become visible together at the barrier.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Pregel Loop Lifecycle                     │
//! │                                                             │
//! │  ┌────────────────────────────────────────────────────┐     │
//! │  │  Superstep N                                       │     │
//! │  │                                                    │     │
//! │  │  1. Plan: nodes whose trigger channels changed     │     │
//! │  │     ↓                                              │     │
//! │  │  2. Execute (concurrent, isolated)                 │     │
//! │  │     ├── Node A  ├── Node B  ├── Send → C           │     │
//! │  │     ↓                                              │     │
//! │  │  3. Barrier: merge writes through reducers         │     │
//! │  │     ↓                                              │     │
//! │  │  4. Route: edges, routers, Command gotos           │     │
//! │  │     ↓                                              │     │
//! │  │  5. Checkpoint                                     │     │
//! │  └────────────────────────────────────────────────────┘     │
//! │                     ↓                                       │
//! │                 More work?                                  │
//! │            Yes ↙         ↘ No                               │
//! │      Superstep N+1       Done                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Components
//!
//! | Module      | Role                                                   |
//! |-------------|--------------------------------------------------------|
//! | `plan`      | Graph definition compiled into channels and triggers   |
//! | `channels`  | Versioned channel store with atomic commit             |
//! | `algo`      | Task planning and routing writes                       |
//! | `io`        | Input, node updates and state edits as channel writes  |
//! | `executor`  | Concurrent task execution with retry and deadlines     |
//! | `loop_impl` | Superstep state machine, checkpointing and resume      |
//!
//! # Channels
//!
//! Besides the user's state channels the plan adds internal ones:
//!
//! ```text
//! branch:to:{node}            edge trigger, cleared every superstep
//! join:{a}+{b}:to:{node}      barrier, available once every member wrote
//! fallback:{from}:to:{node}   failure handed to a fallback node
//! __tasks__                   pending Send instructions
//! ```
//!
//! A node runs in superstep N when one of its trigger channels holds a
//! version newer than the one it saw when it last ran. The versions a node
//! saw are part of every checkpoint, so planning after a restart yields the
//! same tasks as planning without one.

pub(crate) mod algo;
pub(crate) mod channels;
pub(crate) mod executor;
pub(crate) mod io;
pub(crate) mod loop_impl;
pub mod plan;
pub(crate) mod types;

pub use plan::ExecutionPlan;
