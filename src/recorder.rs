pub mod replay_writer;

pub use replay_writer::{ReplayStreamWriter, ReplayWriter};
