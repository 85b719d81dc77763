use std::fmt;

use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// Shard lifecycle as reported by the shard engine.
//
// The engine owns these transitions; the bridge only ever logs them.

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    /// Just registered, about to be processed for activation.
    New = 0,
    /// Being fetched from its mount and indexed.
    Initializing = 1,
    /// Initialized and active, with no readers.
    Available = 2,
    /// Has active readers.
    Serving = 3,
    /// An operation failed and the shard needs recovery.
    Errored = 0xf0,
    /// Reserved.
    Unknown = 0xff,
}

impl ShardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardState::New => "new",
            ShardState::Initializing => "initializing",
            ShardState::Available => "available",
            ShardState::Serving => "serving",
            ShardState::Errored => "errored",
            ShardState::Unknown => "unknown",
        }
    }
}

impl From<ShardState> for u8 {
    fn from(state: ShardState) -> Self {
        state as u8
    }
}

impl TryFrom<u8> for ShardState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ShardState::New),
            1 => Ok(ShardState::Initializing),
            2 => Ok(ShardState::Available),
            3 => Ok(ShardState::Serving),
            0xf0 => Ok(ShardState::Errored),
            0xff => Ok(ShardState::Unknown),
            other => Err(other),
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition observed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTrace {
    pub key: String,
    /// The engine operation that caused the transition.
    pub op: String,
    pub state: ShardState,
    pub error: Option<String>,
}

/// Logs shard transitions until `ctx` is cancelled or every sender is gone.
/// Returns how many traces were drained.
pub async fn trace_loop(
    ctx: CancellationToken,
    mut traces: mpsc::Receiver<ShardTrace>,
) -> usize {
    let mut seen = 0;
    loop {
        let trace = select! {
            _ = ctx.cancelled() => break,
            trace = traces.recv() => match trace {
                Some(trace) => trace,
                None => break,
            },
        };
        seen += 1;
        match (&trace.state, &trace.error) {
            (ShardState::Errored, error) => warn!(
                key = %trace.key,
                op = %trace.op,
                error = error.as_deref().unwrap_or("unknown"),
                "shard errored"
            ),
            (state, _) => debug!(key = %trace.key, op = %trace.op, %state, "shard trace"),
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_values() {
        for state in [
            ShardState::New,
            ShardState::Initializing,
            ShardState::Available,
            ShardState::Serving,
            ShardState::Errored,
            ShardState::Unknown,
        ] {
            assert_eq!(ShardState::try_from(u8::from(state)), Ok(state));
        }
        assert_eq!(u8::from(ShardState::Errored), 0xf0);
        assert_eq!(ShardState::try_from(7), Err(7));
    }

    #[tokio::test]
    async fn test_trace_loop_drains_until_senders_close() {
        let (tx, rx) = mpsc::channel(4);
        for state in [ShardState::New, ShardState::Initializing, ShardState::Errored] {
            tx.send(ShardTrace {
                key: "bafy1".into(),
                op: "register".into(),
                state,
                error: (state == ShardState::Errored).then(|| "fetch failed".into()),
            })
            .await
            .unwrap();
        }
        drop(tx);
        assert_eq!(trace_loop(CancellationToken::new(), rx).await, 3);
    }

    #[tokio::test]
    async fn test_trace_loop_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel::<ShardTrace>(1);
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert_eq!(trace_loop(ctx, rx).await, 0);
    }
}
