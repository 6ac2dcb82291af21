//! Algorithms shipped with the engine.

pub mod flooding;
pub mod ping_pong;

pub use flooding::{Flooding, FloodingFactory};
pub use ping_pong::{PingPong, PingPongFactory};
