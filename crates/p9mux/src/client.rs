//! Asynchronous client side 9P library.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        config::Config,
        context::Context,
        dispatch::{Cancel, Dispatcher, PendingRequest, Reader, Shared},
        error::{Error, Fault, errno::Errno},
        fcall::*,
        io_err, res,
        tag::{TagGuard, TagPool},
        utils::{self, Result},
    },
    log::info,
    std::sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, UnixStream},
        sync::{broadcast, mpsc, oneshot},
    },
    tokio_util::{sync::CancellationToken, task::TaskTracker},
};

/// Number of faults a slow subscriber may lag behind
const FAULT_BACKLOG: usize = 16;

/// A handle on one multiplexed 9P connection.
///
/// Cheap to clone; every clone shares the connection. Any number of tasks
/// may call [`Client::send`] at once, each request carrying its own tag.
/// The connection is shut down by [`Client::close`], by a transport failure,
/// or when the last handle is dropped.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    requests: mpsc::Sender<PendingRequest>,
    cancels: mpsc::UnboundedSender<Cancel>,
    next_id: Arc<AtomicU64>,
    tasks: TaskTracker,
}

impl Client {
    /// Start the reader and dispatcher tasks over a split connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, config: Config) -> Client
    where
        R: 'static + AsyncRead + Send + Unpin,
        W: 'static + AsyncWrite + Send + Unpin,
    {
        let framing = utils::framing(config.max_frame_length());
        let framedread = framing.new_read(reader);
        let framedwrite = framing.new_write(writer);

        let (requests, requests_rx) = mpsc::channel(config.queue_depth.max(1));
        let (responses, responses_rx) = mpsc::channel(config.queue_depth.max(1));
        let (cancels, cancels_rx) = mpsc::unbounded_channel();
        let (faults, _) = broadcast::channel(FAULT_BACKLOG);

        let shared = Arc::new(Shared {
            tags: Arc::new(TagPool::new(config.max_tags)),
            closed: CancellationToken::new(),
            faults,
            msize: AtomicU32::new(config.msize),
        });

        let tasks = TaskTracker::new();
        tasks.spawn(
            Reader::new(framedread, responses, shared.clone(), config.read_timeout).run(),
        );
        tasks.spawn(
            Dispatcher::new(
                framedwrite,
                requests_rx,
                responses_rx,
                cancels_rx,
                shared.clone(),
                &config,
            )
            .run(),
        );
        tasks.close();

        Client {
            shared,
            requests,
            cancels,
            next_id: Arc::new(AtomicU64::new(1)),
            tasks,
        }
    }

    /// Like [`Client::new`] for a single bidirectional stream
    pub fn from_stream<S>(stream: S, config: Config) -> Client
    where
        S: 'static + AsyncRead + AsyncWrite + Send,
    {
        let (readhalf, writehalf) = tokio::io::split(stream);
        Client::new(readhalf, writehalf, config)
    }

    /// Connect to `proto!address!port`, where proto is `tcp` or `unix`
    pub async fn dial(addr: &str, config: Config) -> Result<Client> {
        let (proto, host, port) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => {
                let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
                stream.set_nodelay(true)?;
                info!("connected: {:?}", stream.peer_addr()?);
                let (readhalf, writehalf) = stream.into_split();
                Ok(Client::new(readhalf, writehalf, config))
            }
            "unix" => {
                let stream = UnixStream::connect(host).await?;
                info!("connected: {}", host);
                let (readhalf, writehalf) = stream.into_split();
                Ok(Client::new(readhalf, writehalf, config))
            }
            _ => res!(io_err!(InvalidInput, "Protocol not supported")),
        }
    }

    /// Send one request and wait for the response carrying the same tag.
    ///
    /// `TVersion` goes out on `NOTAG`, every other request on a tag from the
    /// pool. The returned message may be any reply, including `RError`; see
    /// [`Client::rpc`] for a checked variant. Gives up with
    /// [`Error::Cancelled`]/[`Error::DeadlineExceeded`] when `ctx` is done and
    /// with [`Error::Closed`] when the client shuts down, whichever comes first.
    pub async fn send(&self, ctx: &Context, body: FCall) -> Result<Msg> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let tag = match body {
            FCall::TVersion { .. } => None,
            _ => tokio::select! {
                _ = self.shared.closed.cancelled() => return Err(Error::Closed),
                e = ctx.done() => return Err(e),
                tag = self.shared.tags.acquire() => Some(tag?),
            },
        };

        let t = tag.as_ref().map_or(NOTAG, TagGuard::get);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, mut response) = oneshot::channel();
        let request = PendingRequest::new(id, ctx.clone(), Msg { tag: t, body }, tag, reply);

        // Dropping `request` on an early return releases the tag
        tokio::select! {
            _ = self.shared.closed.cancelled() => return Err(Error::Closed),
            e = ctx.done() => return Err(e),
            permit = self.requests.reserve() => permit.map_err(|_| Error::Closed)?.send(request),
        }

        // A delivered outcome wins over a close or cancel that raced with it
        tokio::select! {
            biased;
            outcome = &mut response => outcome.unwrap_or(Err(Error::Closed)),
            _ = self.shared.closed.cancelled() => Err(Error::Closed),
            e = ctx.done() => {
                let _ = self.cancels.send(Cancel { tag: t, id });
                Err(e)
            }
        }
    }

    /// Send a request and check the reply.
    ///
    /// Error replies become [`Error::Remote`] or [`Error::No`]; a reply of any
    /// other kind than the one answering `body` is [`Error::UnexpectedResponse`].
    pub async fn rpc(&self, ctx: &Context, body: FCall) -> Result<FCall> {
        let request = MsgType::from(&body);
        let expected = request
            .response()
            .ok_or_else(|| Error::Protocol(format!("{:?} is not a request", request)))?;

        let response = self.send(ctx, body).await?;
        match response.body {
            FCall::RError { ename } => Err(Error::Remote(ename)),
            FCall::RlError { ecode } => Err(Error::No(Errno::from_raw(ecode as i32))),
            body if MsgType::from(&body) == expected => Ok(body),
            body => Err(Error::UnexpectedResponse {
                expected,
                got: MsgType::from(&body),
            }),
        }
    }

    /// Shut the client down; every waiting and future request fails with [`Error::Closed`]
    pub fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            info!("closing client");
        }
        self.shared.closed.cancel();
    }

    /// Close and wait for the reader and dispatcher tasks to exit
    pub async fn shutdown(&self) {
        self.close();
        self.tasks.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the client is closed, for whatever reason
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Subscribe to client-level faults from now on
    pub fn faults(&self) -> broadcast::Receiver<Fault> {
        self.shared.faults.subscribe()
    }

    /// Number of tags currently checked out
    pub fn in_flight(&self) -> usize {
        self.shared.tags.in_use()
    }

    /// The maximum message size: as configured until a version negotiation
    /// settles on another
    pub fn msize(&self) -> u32 {
        self.shared.msize()
    }

    /// Record the msize agreed on in `RVersion`; later requests are held to it
    pub(crate) fn negotiated(&self, msize: u32) {
        self.shared.msize.store(msize, Ordering::Relaxed);
    }
}
