use crate::transport::{
    DriverNotice, NoticeSource, TransportError, TransportErrorKind, TransportResult,
};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use futures_channel::mpsc;
use futures_util::{
    future::{BoxFuture, FutureExt},
    select_biased,
    stream::StreamExt,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Consumer of driver notices, called on the pump task in arrival order.
pub trait NoticeSink: Send + Sync {
    fn apply(&self, notice: DriverNotice);
}

impl<T> NoticeSink for Arc<T>
where
    T: NoticeSink + ?Sized,
{
    fn apply(&self, notice: DriverNotice) {
        (**self).apply(notice)
    }
}

/// What the pump delivered before it stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub completions: u64,
    pub attaches: u64,
    pub removals: u64,
    pub activation_callbacks: u64,
}

impl PumpSummary {
    fn count(&mut self, notice: &DriverNotice) {
        match notice {
            DriverNotice::Completion(_) => self.completions += 1,
            DriverNotice::Attached(_) => self.attaches += 1,
            DriverNotice::Removed => self.removals += 1,
            DriverNotice::Activation(_) => self.activation_callbacks += 1,
        }
    }
}

/// Handle for stopping a running pump.
#[derive(Clone, Debug)]
pub struct CompletionPumpHandle {
    cmd_tx: mpsc::UnboundedSender<PumpCmd>,
}

impl CompletionPumpHandle {
    /// Ask the pump to stop after the notice it is currently delivering.
    pub fn shutdown(&self) -> TransportResult<()> {
        self.cmd_tx
            .unbounded_send(PumpCmd::Shutdown)
            .map_err(|_| stopped_err())
    }

    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Future that drives the pump. Callers should spawn this on their executor of choice.
pub struct CompletionPumpTask {
    inner: BoxFuture<'static, TransportResult<PumpSummary>>,
}

impl Future for CompletionPumpTask {
    type Output = TransportResult<PumpSummary>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}

/// Start delivering notices from `source` into `sink`.
///
/// The pump ends when the source hangs up, the source fails, or the handle
/// asks it to shut down. Dropping the handle alone does not stop it.
pub fn start_completion_pump<S, K>(source: S, sink: K) -> (CompletionPumpHandle, CompletionPumpTask)
where
    S: NoticeSource + 'static,
    K: NoticeSink + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::unbounded();
    let task = CompletionPumpTask {
        inner: run_pump(source, sink, cmd_rx).boxed(),
    };
    (CompletionPumpHandle { cmd_tx }, task)
}

#[derive(Debug)]
enum PumpCmd {
    Shutdown,
}

enum Step {
    Cmd(Option<PumpCmd>),
    Notice(TransportResult<Option<DriverNotice>>),
}

async fn run_pump<S, K>(
    mut source: S,
    sink: K,
    cmd_rx: mpsc::UnboundedReceiver<PumpCmd>,
) -> TransportResult<PumpSummary>
where
    S: NoticeSource + 'static,
    K: NoticeSink + 'static,
{
    let mut cmd_rx = cmd_rx.fuse();
    let mut summary = PumpSummary::default();

    loop {
        let step = {
            let mut next_notice = source.next_notice().fuse();
            select_biased! {
                cmd = cmd_rx.next() => Step::Cmd(cmd),
                notice = next_notice => Step::Notice(notice),
            }
        };

        match step {
            Step::Cmd(Some(PumpCmd::Shutdown)) => {
                debug!(?summary, "completion pump shut down");
                break Ok(summary);
            }
            Step::Cmd(None) => trace!("pump handle dropped"),
            Step::Notice(Ok(Some(notice))) => {
                summary.count(&notice);
                sink.apply(notice);
            }
            Step::Notice(Ok(None)) => {
                debug!(?summary, "notice source closed");
                break Ok(summary);
            }
            Step::Notice(Err(err)) => {
                warn!(error = %err, "notice source failed");
                break Err(err);
            }
        }
    }
}

fn stopped_err() -> TransportError {
    TransportError::with_message(TransportErrorKind::Disconnected, "pump not running")
}
