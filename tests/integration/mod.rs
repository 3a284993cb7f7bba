//! Integration test suite for mesh.
//!
//! These tests drive the coordinator end to end against a scripted
//! provider. They verify that decomposition, scheduling, turn budgets,
//! the message bus and session persistence work together.
//!
//! # Test Categories
//!
//! - `orchestration_e2e`: Full request execution tests
//! - `parallel_execution`: Concurrent group correctness
//! - `budget`: Turn budget enforcement across a run
//! - `bus_delivery`: Message bus delivery, retries and expiry
//! - `persistence`: Session store and checkpoints
//!
//! # CI Compatibility
//!
//! No test spawns a real provider CLI, so the suite is safe to run in CI.

mod fixtures;

mod budget;
mod bus_delivery;
mod orchestration_e2e;
mod parallel_execution;
mod persistence;
