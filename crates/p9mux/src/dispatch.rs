//! The dispatcher task and the connection reader task.
//!
//! The dispatcher is the only owner of the outstanding table and the only
//! writer on the connection. Callers reach it through the request and
//! cancellation channels; the reader hands it every decoded message. Nothing
//! here needs a lock.

use {
    crate::{
        config::Config,
        context::Context,
        error::{Error, Fault},
        fcall::*,
        io_err, serialize,
        tag::{TagGuard, TagPool},
        utils::{self, Result},
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, error, info, trace, warn},
    std::{
        collections::HashMap,
        io,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::{broadcast, mpsc, oneshot},
        time::{Instant, timeout, timeout_at},
    },
    tokio_stream::StreamExt,
    tokio_util::{
        codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
        sync::CancellationToken,
    },
};

/// Where the outcome of an outstanding request goes
#[derive(Debug)]
enum Waiter {
    /// A caller blocked in `send`
    Caller(oneshot::Sender<Result<Msg>>),
    /// Nobody waits any more; the tag stays reserved until the server is done with it
    Abandoned,
    /// A `TFlush` sent on behalf of an abandoned request
    Flush { oldtag: u16, id: u64 },
}

/// A request on its way to, or registered with, the dispatcher.
///
/// Holds the guard of its tag, so the tag goes back to the pool exactly when
/// the request is dropped. `TVersion` travels on `NOTAG` and has no guard.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    id: u64,
    ctx: Context,
    msg: Msg,
    tag: Option<TagGuard>,
    waiter: Waiter,
}

impl PendingRequest {
    pub(crate) fn new(
        id: u64,
        ctx: Context,
        msg: Msg,
        tag: Option<TagGuard>,
        reply: oneshot::Sender<Result<Msg>>,
    ) -> PendingRequest {
        PendingRequest {
            id,
            ctx,
            msg,
            tag,
            waiter: Waiter::Caller(reply),
        }
    }

    /// Release the tag, then hand the outcome to whoever waits for it
    fn resolve(self, outcome: Result<Msg>) {
        let PendingRequest {
            id,
            msg,
            tag,
            waiter,
            ..
        } = self;
        let t = msg.tag;
        drop(tag);

        match waiter {
            Waiter::Caller(reply) => {
                if reply.send(outcome).is_err() {
                    debug!("caller of request {} (tag {}) is gone", id, t);
                }
            }
            Waiter::Abandoned => debug!("dropping outcome of abandoned tag {}", t),
            Waiter::Flush { oldtag, .. } => debug!("flush of tag {} resolved", oldtag),
        }
    }
}

/// A caller stopped waiting for request `id`, which holds `tag`
#[derive(Debug)]
pub(crate) struct Cancel {
    pub(crate) tag: u16,
    pub(crate) id: u64,
}

/// State shared by the client handles and both tasks
pub(crate) struct Shared {
    pub(crate) tags: Arc<TagPool>,
    pub(crate) closed: CancellationToken,
    pub(crate) faults: broadcast::Sender<Fault>,
    /// Configured, then negotiated, maximum message size
    pub(crate) msize: AtomicU32,
}

impl Shared {
    pub(crate) fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    /// Report a broken connection and close the client
    fn fail(&self, e: io::Error) {
        if self.closed.is_cancelled() {
            debug!("transport error after close: {}", e);
            return;
        }
        error!("transport failure: {}", e);
        let _ = self.faults.send(Fault::Transport(Arc::new(e)));
        self.closed.cancel();
    }
}

pub(crate) struct Dispatcher<W> {
    framedwrite: FramedWrite<W, LengthDelimitedCodec>,
    outstanding: HashMap<u16, PendingRequest>,
    requests: mpsc::Receiver<PendingRequest>,
    responses: mpsc::Receiver<Msg>,
    cancels: mpsc::UnboundedReceiver<Cancel>,
    shared: Arc<Shared>,
    write_timeout: Duration,
    flush_on_cancel: bool,
}

/// Why a frame did not make it onto the connection
#[derive(Debug)]
enum WriteError {
    /// The client closed while writing
    Closed,
    /// The deadline passed before any byte of the frame went out; the frame was discarded
    Unsent,
    /// The deadline passed after the whole frame went out, and the server may still answer it
    Sent,
    /// The deadline passed part way through the frame; the stream is no longer framed
    Torn,
    Io(io::Error),
}

impl WriteError {
    fn into_io(self) -> io::Error {
        match self {
            WriteError::Closed => io_err!(NotConnected, "client closed"),
            WriteError::Unsent | WriteError::Sent => {
                io_err!(TimedOut, "write deadline exceeded")
            }
            WriteError::Torn => io_err!(TimedOut, "write deadline exceeded mid-frame"),
            WriteError::Io(e) => e,
        }
    }
}

impl<W> Dispatcher<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub(crate) fn new(
        framedwrite: FramedWrite<W, LengthDelimitedCodec>,
        requests: mpsc::Receiver<PendingRequest>,
        responses: mpsc::Receiver<Msg>,
        cancels: mpsc::UnboundedReceiver<Cancel>,
        shared: Arc<Shared>,
        config: &Config,
    ) -> Dispatcher<W> {
        Dispatcher {
            framedwrite,
            outstanding: HashMap::new(),
            requests,
            responses,
            cancels,
            shared,
            write_timeout: config.write_timeout,
            flush_on_cancel: config.flush_on_cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shared.closed.cancelled() => break,
                req = self.requests.recv() => match req {
                    Some(req) => self.submit(req).await,
                    // Every client handle is gone
                    None => break,
                },
                Some(msg) = self.responses.recv() => self.deliver(msg),
                Some(cancel) = self.cancels.recv() => self.abandon(cancel).await,
            }
        }

        self.shared.closed.cancel();
        self.drain();
    }

    async fn submit(&mut self, req: PendingRequest) {
        if let Some(e) = req.ctx.err() {
            debug!("request {} expired before it was written", req.id);
            req.resolve(Err(e));
            return;
        }

        let tag = req.msg.tag;
        if self.outstanding.contains_key(&tag) {
            error!("tag {} is already outstanding", tag);
            req.resolve(Err(Error::Protocol(format!("tag {} reused while in flight", tag))));
            return;
        }

        let deadline = req
            .ctx
            .deadline()
            .unwrap_or_else(|| Instant::now() + self.write_timeout);
        let frame = match encode(&req.msg, self.shared.msize()) {
            Ok(frame) => frame,
            Err(e) => {
                req.resolve(Err(Error::Io(e)));
                return;
            }
        };

        debug!("\t→ {:?}", req.msg);
        let id = req.id;
        self.outstanding.insert(tag, req);

        let e = match self.write(frame, deadline).await {
            Ok(()) => return,
            Err(e) => e,
        };
        warn!("failed to send request {} on tag {}: {:?}", id, tag, e);

        match e {
            WriteError::Closed => {
                if let Some(req) = self.outstanding.remove(&tag) {
                    req.resolve(Err(Error::Closed));
                }
            }
            WriteError::Unsent => {
                if let Some(req) = self.outstanding.remove(&tag) {
                    req.resolve(Err(Error::WriteFailed(e.into_io())));
                }
            }
            // The tag stays reserved until the server answers or the flush does
            WriteError::Sent => {
                if let Some(req) = self.outstanding.get_mut(&tag) {
                    let waiter = std::mem::replace(&mut req.waiter, Waiter::Abandoned);
                    if let Waiter::Caller(reply) = waiter {
                        let _ = reply.send(Err(Error::WriteFailed(e.into_io())));
                    }
                }
                if self.flush_on_cancel && tag != NOTAG {
                    self.flush(tag, id).await;
                }
            }
            WriteError::Torn | WriteError::Io(_) => {
                let e = e.into_io();
                let cause = io::Error::new(e.kind(), e.to_string());
                if let Some(req) = self.outstanding.remove(&tag) {
                    req.resolve(Err(Error::WriteFailed(e)));
                }
                self.shared.fail(cause);
            }
        }
    }

    /// Write one frame by `deadline`.
    ///
    /// The write buffer is empty on entry, so on a missed deadline whatever
    /// is left in it belongs to this frame.
    async fn write(&mut self, frame: bytes::Bytes, deadline: Instant) -> std::result::Result<(), WriteError> {
        // size[4] is added by the codec
        let len = frame.len() + 4;
        let res = tokio::select! {
            _ = self.shared.closed.cancelled() => return Err(WriteError::Closed),
            res = timeout_at(deadline, self.framedwrite.send(frame)) => res,
        };

        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteError::Io(e)),
            Err(_) => {
                let pending = self.framedwrite.write_buffer().len();
                if pending == len {
                    self.framedwrite.write_buffer_mut().clear();
                    Err(WriteError::Unsent)
                } else if pending == 0 {
                    Err(WriteError::Sent)
                } else {
                    Err(WriteError::Torn)
                }
            }
        }
    }

    fn deliver(&mut self, msg: Msg) {
        let Some(req) = self.outstanding.remove(&msg.tag) else {
            warn!("response {:?} for unknown tag {}", msg.typ(), msg.tag);
            let _ = self.shared.faults.send(Fault::UnexpectedResponse {
                tag: msg.tag,
                typ: msg.typ(),
            });
            return;
        };

        if let Waiter::Flush { oldtag, id } = &req.waiter {
            // Once the flush is answered the server will not answer oldtag
            if self.outstanding.get(oldtag).is_some_and(|old| old.id == *id) {
                if let Some(old) = self.outstanding.remove(oldtag) {
                    old.resolve(Err(Error::Cancelled));
                }
            }
        }

        req.resolve(Ok(msg));
    }

    async fn abandon(&mut self, cancel: Cancel) {
        let Some(req) = self.outstanding.get_mut(&cancel.tag) else {
            return;
        };
        if req.id != cancel.id || !matches!(req.waiter, Waiter::Caller(_)) {
            return;
        }
        debug!("request {} on tag {} abandoned", cancel.id, cancel.tag);
        req.waiter = Waiter::Abandoned;

        // A TVersion cannot be flushed
        if self.flush_on_cancel && cancel.tag != NOTAG {
            self.flush(cancel.tag, cancel.id).await;
        }
    }

    async fn flush(&mut self, oldtag: u16, id: u64) {
        let guard = match self.shared.tags.try_acquire() {
            Ok(guard) => guard,
            Err(e) => {
                debug!("not flushing tag {}: {}", oldtag, e);
                return;
            }
        };

        let tag = guard.get();
        let msg = Msg {
            tag,
            body: FCall::TFlush { oldtag },
        };
        let frame = match encode(&msg, self.shared.msize()) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode flush of tag {}: {}", oldtag, e);
                return;
            }
        };

        debug!("\t→ {:?}", msg);
        self.outstanding.insert(
            tag,
            PendingRequest {
                id: 0,
                ctx: Context::background(),
                msg,
                tag: Some(guard),
                waiter: Waiter::Flush { oldtag, id },
            },
        );

        let deadline = Instant::now() + self.write_timeout;
        match self.write(frame, deadline).await {
            Ok(()) => {}
            Err(WriteError::Closed) => {}
            Err(WriteError::Unsent) => {
                debug!("flush of tag {} timed out unsent", oldtag);
                self.outstanding.remove(&tag);
            }
            // Rflush will still come
            Err(WriteError::Sent) => debug!("flush of tag {} sent late", oldtag),
            Err(e) => {
                warn!("failed to flush tag {}: {:?}", oldtag, e);
                self.outstanding.remove(&tag);
                self.shared.fail(e.into_io());
            }
        }
    }

    fn drain(&mut self) {
        self.requests.close();
        let mut count = 0;
        while let Ok(req) = self.requests.try_recv() {
            req.resolve(Err(Error::Closed));
            count += 1;
        }
        for (_, req) in self.outstanding.drain() {
            req.resolve(Err(Error::Closed));
            count += 1;
        }
        info!("dispatcher stopped, {} requests resolved as closed", count);
    }
}

fn encode(msg: &Msg, msize: u32) -> io::Result<bytes::Bytes> {
    let mut writer = bytes::BytesMut::with_capacity(256).writer();
    serialize::write_msg(&mut writer, msg)?;
    let frame = writer.into_inner().freeze();

    // size[4] is added by the codec
    if frame.len() + 4 > msize as usize {
        return Err(io_err!(
            InvalidInput,
            format!("message of {} bytes exceeds msize {}", frame.len() + 4, msize)
        ));
    }
    Ok(frame)
}

/// Pulls messages off the connection and forwards them to the dispatcher
pub(crate) struct Reader<R> {
    framedread: FramedRead<R, LengthDelimitedCodec>,
    responses: mpsc::Sender<Msg>,
    shared: Arc<Shared>,
    read_timeout: Duration,
}

impl<R> Reader<R>
where
    R: AsyncRead + Send + Unpin,
{
    pub(crate) fn new(
        framedread: FramedRead<R, LengthDelimitedCodec>,
        responses: mpsc::Sender<Msg>,
        shared: Arc<Shared>,
        read_timeout: Duration,
    ) -> Reader<R> {
        Reader {
            framedread,
            responses,
            shared,
            read_timeout,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let next = tokio::select! {
                _ = self.shared.closed.cancelled() => break,
                next = timeout(self.read_timeout, self.framedread.next()) => next,
            };

            let bytes = match next {
                Err(_) => {
                    trace!("read deadline expired, re-arming");
                    continue;
                }
                Ok(None) => {
                    self.shared
                        .fail(io_err!(UnexpectedEof, "connection closed by peer"));
                    break;
                }
                Ok(Some(Err(e))) if utils::is_transient(&e) => continue,
                Ok(Some(Err(e))) => {
                    self.shared.fail(e);
                    break;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            let msg = match serialize::read_msg(&mut bytes.reader()) {
                Ok(msg) => msg,
                Err(e) => {
                    self.shared.fail(e);
                    break;
                }
            };
            debug!("\t← {:?}", msg);

            tokio::select! {
                _ = self.shared.closed.cancelled() => break,
                res = self.responses.send(msg) => if res.is_err() { break },
            }
        }
        debug!("reader stopped");
    }
}
