use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{CepError, CepResult, ExecutionError};
use crate::instance::{InstanceId, MatchResult};

use super::dispatcher::ControlMsg;

/// Match results of one registered instance.
///
/// The stream disconnects once the instance terminates and its buffered
/// matches are drained. Dropping the stream stops the instance (best effort).
#[derive(Debug)]
pub struct MatchStream {
    instance_id: InstanceId,
    rx: Receiver<MatchResult>,
    control_tx: Sender<ControlMsg>,
    closed: AtomicBool,
}

impl MatchStream {
    pub(crate) fn new(instance_id: InstanceId, rx: Receiver<MatchResult>, control_tx: Sender<ControlMsg>) -> Self {
        Self {
            instance_id,
            rx,
            control_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// The instance backing this stream.
    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Best-effort explicit stop of the instance.
    ///
    /// This is non-blocking and idempotent. Matches already buffered can still
    /// be received.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.control_tx.try_send(ControlMsg::Stop {
            instance_id: self.instance_id,
        });
    }

    /// Receive the next match (blocking).
    ///
    /// # Errors
    ///
    /// `ExecutionError::Disconnected` once the instance is gone and the buffer is empty.
    pub fn recv(&self) -> CepResult<MatchResult> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next match with a timeout.
    ///
    /// # Errors
    ///
    /// `ExecutionError::Timeout` if nothing arrives in time, `Disconnected` as for `recv`.
    pub fn recv_timeout(&self, timeout: Duration) -> CepResult<MatchResult> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => CepError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Receive a buffered match without waiting.
    ///
    /// # Errors
    ///
    /// `ExecutionError::Disconnected` as for `recv`.
    pub fn try_recv(&self) -> CepResult<Option<MatchResult>> {
        match self.rx.try_recv() {
            Ok(result) => Ok(Some(result)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }
}

fn disconnected() -> CepError {
    CepError::Execution(ExecutionError::Disconnected {
        path: "match_stream".to_string(),
    })
}

impl Drop for MatchStream {
    fn drop(&mut self) {
        self.close();
    }
}
