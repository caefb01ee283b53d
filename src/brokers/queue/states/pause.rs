/// Accepts and accumulates. The backlog drains in order once a dispatching
/// status takes over.
#[derive(Debug, Default)]
pub struct PausedState;
