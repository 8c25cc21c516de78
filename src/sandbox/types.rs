use tokio::sync::watch;

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub width: u32,
    pub height: u32,
}

/// Negotiated terminal parameters of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Pty {
    pub term: String,
    pub window: Window,
}

/// Parameters of a container attach.
///
/// `window` carries the current size plus later updates with
/// last-writer-wins semantics; the attach applies the current value
/// before wiring the update loop.
pub struct ExecAttachOptions {
    pub env: Vec<String>,
    pub command: Vec<String>,
    pub is_pty: bool,
    pub term: Option<String>,
    pub window: Option<watch::Receiver<Window>>,
}

/// One chunk of container output, already demultiplexed.
#[derive(Debug)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}
