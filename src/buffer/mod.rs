//! Replay storage for real environment transitions.
//!
//! - [`replay_buffer::ReplayBuffer`] -- fixed-capacity, thread-safe arena with
//!   FIFO or priority eviction and uniform or weighted sampling.

pub mod replay_buffer;

pub use replay_buffer::{
    BufferSnapshot, EvictionPolicy, Inserted, ReplayBuffer, SampledTransition, SamplingStrategy,
    SlotId,
};
