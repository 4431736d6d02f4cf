//! Streaming PCM playback over pooled audio queues.
//!
//! A [`context::Context`] fixes the stream format and owns a pool of
//! reusable output queues. Each [`player::Player`] wraps a byte source
//! (`std::io::Read` of interleaved PCM) and holds a queue only while it is
//! active; a shared background worker refills player backlogs as buffer
//! completions drain them. The native layer sits behind the
//! [`engine::AudioEngine`] trait, with a CPAL implementation in
//! [`backend`].

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod engine;
pub mod player;
pub mod source;

mod pool;
mod scheduler;

#[cfg(test)]
mod fake_engine;
