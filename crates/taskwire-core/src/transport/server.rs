//! Multi-threaded message server.
//!
//! A [`MessageEndpointServer`] listens on two TCP ports: one for
//! fire-and-forget messages and one for request/response messages. Each port
//! is served by a [`MessageEndpointServerHandler`], which runs one receiver
//! thread relaying external traffic to a pool of worker threads over a
//! process-local address. Workers decode each message and hand it to the
//! server's [`ServerDispatch`] implementation.
//!
//! # Thread Safety
//!
//! Every socket is owned by the thread that opened it. The only state shared
//! between threads is the startup barrier, the server's two latch slots and
//! each handler's halt flag. Workers are stopped by shutdown messages sent
//! through the same ports as ordinary traffic, one worker per round. A worker
//! that misses its round is halted when the handler is joined, and joining
//! gives up on threads that outlive its deadline.

use super::endpoint::{
    AsyncRecvMessageEndpoint, AsyncSendMessageEndpoint, FanInMessageEndpoint,
    FanOutMessageEndpoint, FanOutStrategy, SyncRecvMessageEndpoint, SyncSendMessageEndpoint,
};
use crate::config::{ServerConfig, TransportConfig, LOCALHOST};
use crate::error::{Result, TransportError};
use crate::latch::{Latch, LatchSlot};
use crate::message::{
    Message, MessageStatus, NO_HEADER, NO_SEQUENCE_NUM, SHUTDOWN_HEADER, SHUTDOWN_PAYLOAD,
};
use crate::socket::proxy::control_pair;
use crate::socket::{MessageContext, ProxyStopper};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Request handlers invoked by server worker threads.
///
/// Calls arrive concurrently from every worker of a server, so
/// implementations synchronize their own state.
pub trait ServerDispatch: Send + Sync + 'static {
    /// Handle a fire-and-forget message.
    fn do_async_recv(&self, message: &Message) -> Result<()>;

    /// Handle a request and return the encoded reply.
    fn do_sync_recv(&self, message: &Message) -> Result<Bytes>;

    /// Called on each worker thread after its socket has closed.
    fn on_worker_stop(&self) {}
}

/// State shared by the server and all of its threads.
struct ServerShared<D> {
    dispatch: D,
    label: String,
    request_latch: LatchSlot,
    shutdown_latch: LatchSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Unstarted,
    Running,
    Stopped,
}

/// What the receiver thread reports once its sockets are open.
type ReceiverReady = Result<(u16, ProxyStopper)>;

/// Receiver thread plus worker pool for one delivery mode.
pub struct MessageEndpointServerHandler<D: ServerDispatch> {
    shared: Arc<ServerShared<D>>,
    ctx: Arc<MessageContext>,
    strategy: FanOutStrategy,
    label: String,
    port: u16,
    thread_count: usize,
    timeout: Duration,
    state: HandlerState,
    halt: Arc<AtomicBool>,
    receiver: Option<JoinHandle<Result<()>>>,
    workers: Vec<JoinHandle<Result<()>>>,
    proxy_stopper: Option<ProxyStopper>,
    // Every thread holds a clone of the sender; the channel disconnects once
    // all of them have returned
    done_tx: Option<Sender<()>>,
    done_rx: Option<Receiver<()>>,
}

impl<D: ServerDispatch> MessageEndpointServerHandler<D> {
    fn new(
        shared: Arc<ServerShared<D>>,
        ctx: Arc<MessageContext>,
        strategy: FanOutStrategy,
        port: u16,
        thread_count: usize,
        timeout: Duration,
    ) -> Self {
        let label = match strategy {
            FanOutStrategy::Balanced => format!("{}-async", shared.label),
            FanOutStrategy::Routed => format!("{}-sync", shared.label),
        };

        Self {
            shared,
            ctx,
            strategy,
            label,
            port,
            thread_count,
            timeout,
            state: HandlerState::Unstarted,
            halt: Arc::new(AtomicBool::new(false)),
            receiver: None,
            workers: Vec::new(),
            proxy_stopper: None,
            done_tx: None,
            done_rx: None,
        }
    }

    pub fn strategy(&self) -> FanOutStrategy {
        self.strategy
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of workers whose threads have not returned yet.
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_finished()).count()
    }

    /// Start the receiver and workers, returning the bound external port.
    ///
    /// Returns once every thread has its socket open and the relay is
    /// running. Each startup step gives up after `startup_timeout`.
    pub fn start(&mut self, startup_timeout: Duration) -> Result<u16> {
        if self.state != HandlerState::Unstarted {
            return Err(TransportError::AlreadyStarted(self.label.clone()));
        }

        // Receiver, workers and this thread
        let barrier = Latch::create_with_timeout(self.thread_count + 2, startup_timeout);
        let (ready_tx, ready_rx) = bounded::<ReceiverReady>(1);
        let (running_tx, running_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(0);
        self.done_rx = Some(done_rx);

        let receiver = {
            let ctx = Arc::clone(&self.ctx);
            let barrier = Arc::clone(&barrier);
            let strategy = self.strategy;
            let label = self.label.clone();
            let port = self.port;
            let timeout = self.timeout;
            let done = done_tx.clone();
            std::thread::Builder::new()
                .name(format!("{}-recv", self.label))
                .spawn(move || {
                    let _done = done;
                    run_receiver(&ctx, strategy, &label, port, timeout, &barrier, ready_tx, running_tx)
                })?
        };
        self.receiver = Some(receiver);
        self.done_tx = Some(done_tx);
        self.state = HandlerState::Running;

        let (port, stopper) = match ready_rx.recv_timeout(startup_timeout) {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                self.abort_start(startup_timeout);
                return Err(e);
            }
            Err(_) => {
                self.abort_start(startup_timeout);
                return Err(TransportError::Timeout(startup_timeout));
            }
        };
        self.proxy_stopper = Some(stopper);

        for i in 0..self.thread_count {
            let shared = Arc::clone(&self.shared);
            let ctx = Arc::clone(&self.ctx);
            let barrier = Arc::clone(&barrier);
            let halt = Arc::clone(&self.halt);
            let strategy = self.strategy;
            let label = self.label.clone();
            let timeout = self.timeout;
            let done = self.done_tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", self.label, i))
                .spawn(move || {
                    let _done = done;
                    run_worker(&shared, &ctx, strategy, &label, timeout, &barrier, &halt)
                });

            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.abort_start(startup_timeout);
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = barrier.wait() {
            error!("Handler {} threads did not start: {}", self.label, e);
            self.abort_start(startup_timeout);
            return Err(e);
        }

        match running_rx.recv_timeout(startup_timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                self.abort_start(startup_timeout);
                return Err(TransportError::Timeout(startup_timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.abort_start(startup_timeout);
                return Err(TransportError::Other(format!(
                    "Receiver for {} exited during startup",
                    self.label
                )));
            }
        }

        debug!(
            "Handler {} running {} {} workers on port {}",
            self.label,
            self.thread_count,
            self.strategy.as_str(),
            port
        );
        self.port = port;
        Ok(port)
    }

    /// Stop the relay, then join every worker and finally the receiver.
    ///
    /// Workers normally exit on shutdown messages sent before this is
    /// called. Any still running are halted and leave once their next
    /// receive times out. Threads still running after `timeout` are detached
    /// and reported as [`TransportError::Timeout`].
    pub fn join(&mut self, timeout: Duration) -> Result<()> {
        if self.state != HandlerState::Running {
            return Ok(());
        }

        self.halt.store(true, Ordering::Release);
        self.stop_relay();

        let result = self.join_threads(timeout);
        debug!("Handler {} joined", self.label);
        result
    }

    /// Unwind a failed start, halting whatever threads were spawned.
    fn abort_start(&mut self, startup_timeout: Duration) {
        self.halt.store(true, Ordering::Release);
        self.stop_relay();

        // Threads may still be at the barrier, which gives up on its own
        if let Err(e) = self.join_threads(startup_timeout + self.timeout) {
            debug!("Handler {} unwound with error: {}", self.label, e);
        }
    }

    fn stop_relay(&mut self) {
        if let Some(stopper) = self.proxy_stopper.take() {
            trace!("Stopping relay for {}", self.label);
            if let Err(e) = stopper.terminate() {
                warn!("Could not stop relay for {}: {}", self.label, e);
            }
        }
    }

    fn join_threads(&mut self, timeout: Duration) -> Result<()> {
        self.done_tx.take();
        let all_returned = match self.done_rx.take() {
            Some(done) => !matches!(
                done.recv_deadline(Instant::now() + timeout),
                Err(RecvTimeoutError::Timeout)
            ),
            None => true,
        };

        let mut first_err = None;
        for (i, worker) in self.workers.drain(..).enumerate() {
            let name = format!("{}-{}", self.label, i);
            if let Err(e) = join_or_detach(&name, worker, all_returned, timeout) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(receiver) = self.receiver.take() {
            let name = format!("{}-recv", self.label);
            if let Err(e) = join_or_detach(&name, receiver, all_returned, timeout) {
                first_err.get_or_insert(e);
            }
        }

        self.state = HandlerState::Stopped;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn join_or_detach(
    name: &str,
    handle: JoinHandle<Result<()>>,
    all_returned: bool,
    timeout: Duration,
) -> Result<()> {
    if !all_returned && !handle.is_finished() {
        error!("Thread {} still running after {:?}, detaching it", name, timeout);
        return Err(TransportError::Timeout(timeout));
    }
    log_join(name, handle)
}

fn log_join(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Thread {} failed: {}", name, e);
            Err(e)
        }
        Err(_) => {
            error!("Thread {} panicked", name);
            Err(TransportError::ThreadPanicked(name.to_string()))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_receiver(
    ctx: &Arc<MessageContext>,
    strategy: FanOutStrategy,
    label: &str,
    port: u16,
    timeout: Duration,
    barrier: &Latch,
    ready_tx: Sender<ReceiverReady>,
    running_tx: Sender<()>,
) -> Result<()> {
    let opened = FanInMessageEndpoint::bind(ctx, port, strategy, timeout)
        .and_then(|fan_in| {
            FanOutMessageEndpoint::bind(ctx, label, strategy, timeout)
                .map(|fan_out| (fan_in, fan_out))
        })
        .and_then(|(fan_in, fan_out)| {
            control_pair(ctx, label, TransportConfig::CONTROL_TIMEOUT)
                .map(|(stopper, control)| (fan_in, fan_out, stopper, control))
        });
    let (mut fan_in, mut fan_out, stopper, mut control) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            // The starter owns the error from here
            let _ = ready_tx.send(Err(e));
            return Ok(());
        }
    };

    let bound_port = fan_in.bound_port().unwrap_or(port);
    let _ = ready_tx.send(Ok((bound_port, stopper)));

    let result = barrier.wait().and_then(|_| {
        let _ = running_tx.send(());
        fan_in.attach_fan_out(&mut fan_out, &mut control)
    });
    if let Err(e) = &result {
        error!("Relay for {} stopped: {}", label, e);
    }

    trace!("Receiver for {} closing relay", label);
    let closed_in = fan_in.close();
    let closed_out = fan_out.close();
    result.and(closed_in).and(closed_out)
}

/// Internal endpoint a worker reads from.
enum WorkerEndpoint {
    Async(AsyncRecvMessageEndpoint),
    Sync(SyncRecvMessageEndpoint),
}

impl WorkerEndpoint {
    fn open(
        ctx: &Arc<MessageContext>,
        strategy: FanOutStrategy,
        label: &str,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(match strategy {
            FanOutStrategy::Balanced => {
                WorkerEndpoint::Async(AsyncRecvMessageEndpoint::connect_inproc(ctx, label, timeout)?)
            }
            FanOutStrategy::Routed => {
                WorkerEndpoint::Sync(SyncRecvMessageEndpoint::connect_inproc(ctx, label, timeout)?)
            }
        })
    }

    fn recv(&mut self) -> Result<Message> {
        match self {
            WorkerEndpoint::Async(endpoint) => endpoint.recv(),
            WorkerEndpoint::Sync(endpoint) => endpoint.recv(),
        }
    }

    fn set_recv_timeout(&mut self, timeout: Duration) -> Result<()> {
        match self {
            WorkerEndpoint::Async(endpoint) => endpoint.set_recv_timeout(timeout),
            WorkerEndpoint::Sync(endpoint) => endpoint.set_recv_timeout(timeout),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            WorkerEndpoint::Async(endpoint) => endpoint.close(),
            WorkerEndpoint::Sync(endpoint) => endpoint.close(),
        }
    }
}

fn run_worker<D: ServerDispatch>(
    shared: &ServerShared<D>,
    ctx: &Arc<MessageContext>,
    strategy: FanOutStrategy,
    label: &str,
    timeout: Duration,
    barrier: &Latch,
    halt: &AtomicBool,
) -> Result<()> {
    let mut endpoint = match WorkerEndpoint::open(ctx, strategy, label, timeout) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("Worker on {} could not open its endpoint: {}", label, e);
            return Err(e);
        }
    };

    if let Err(e) = barrier.wait() {
        let _ = endpoint.close();
        return Err(e);
    }

    let outcome = dispatch_loop(shared, &mut endpoint, halt);
    let closed = endpoint.close();
    let shutdown_latch = outcome?;
    closed?;

    shared.dispatch.on_worker_stop();

    // Lets the stopping thread know this worker's socket is gone
    if let Some(latch) = shutdown_latch {
        if let Err(e) = latch.wait() {
            warn!("Worker on {} outlived its shutdown round: {}", label, e);
        }
    }
    Ok(())
}

/// Handle messages until a shutdown arrives or the handler halts.
///
/// Returns the shutdown round's latch when stopped by a shutdown message.
fn dispatch_loop<D: ServerDispatch>(
    shared: &ServerShared<D>,
    endpoint: &mut WorkerEndpoint,
    halt: &AtomicBool,
) -> Result<Option<Arc<Latch>>> {
    loop {
        if halt.load(Ordering::Acquire) {
            debug!("Worker on {} halted", shared.label);
            return Ok(None);
        }

        let message = endpoint.recv()?;

        match message.status() {
            MessageStatus::Term => {
                trace!("Worker on {} received term", shared.label);
                let latch = shared.shutdown_latch.take();
                drain(shared, endpoint)?;
                return Ok(latch);
            }
            MessageStatus::Timeout => {
                trace!("Worker on {} timed out, listening again", shared.label);
                continue;
            }
            MessageStatus::Success => {}
            other => {
                error!("Unexpected message status on {}: {}", shared.label, other);
                return Err(TransportError::UnexpectedStatus {
                    label: shared.label.clone(),
                    status: other.to_string(),
                });
            }
        }

        handle_message(shared, endpoint, &message)?;

        if let Err(e) = shared.request_latch.wait_if_installed() {
            warn!("Request latch on {} not released: {}", shared.label, e);
        }
    }
}

/// Handle whatever is already queued for this worker without waiting for more.
fn drain<D: ServerDispatch>(shared: &ServerShared<D>, endpoint: &mut WorkerEndpoint) -> Result<()> {
    endpoint.set_recv_timeout(Duration::ZERO)?;
    for _ in 0..TransportConfig::HIGH_WATER_MARK {
        let message = endpoint.recv()?;
        if message.status() != MessageStatus::Success {
            break;
        }
        trace!("Worker on {} draining queued message", shared.label);
        handle_message(shared, endpoint, &message)?;
    }
    Ok(())
}

fn handle_message<D: ServerDispatch>(
    shared: &ServerShared<D>,
    endpoint: &mut WorkerEndpoint,
    message: &Message,
) -> Result<()> {
    match endpoint {
        WorkerEndpoint::Async(_) => shared.dispatch.do_async_recv(message),
        WorkerEndpoint::Sync(sync) => {
            let reply = shared.dispatch.do_sync_recv(message)?;
            sync.send_response(NO_HEADER, &reply)
        }
    }
}

/// Server with one async and one sync handler on a pair of ports.
///
/// # Example
///
/// ```no_run
/// use bytes::Bytes;
/// use taskwire::{Message, MessageEndpointServer, Result, ServerConfig, ServerDispatch};
///
/// struct Echo;
///
/// impl ServerDispatch for Echo {
///     fn do_async_recv(&self, _message: &Message) -> Result<()> {
///         Ok(())
///     }
///
///     fn do_sync_recv(&self, message: &Message) -> Result<Bytes> {
///         Ok(message.bytes().clone())
///     }
/// }
///
/// let mut server = MessageEndpointServer::new(ServerConfig::new("echo", 8005, 8006), Echo);
/// server.start()?;
/// server.stop()?;
/// # Ok::<(), taskwire::TransportError>(())
/// ```
pub struct MessageEndpointServer<D: ServerDispatch> {
    config: ServerConfig,
    ctx: Arc<MessageContext>,
    shared: Arc<ServerShared<D>>,
    // The stopping side of the request latch handed to workers
    pending_request: LatchSlot,
    async_handler: Option<MessageEndpointServerHandler<D>>,
    sync_handler: Option<MessageEndpointServerHandler<D>>,
    async_shutdown: Option<AsyncSendMessageEndpoint>,
    sync_shutdown: Option<SyncSendMessageEndpoint>,
    async_port: u16,
    sync_port: u16,
    started: bool,
}

impl<D: ServerDispatch> MessageEndpointServer<D> {
    /// Create a server on the process-wide message context.
    pub fn new(config: ServerConfig, dispatch: D) -> Self {
        Self::with_context(config, dispatch, MessageContext::global())
    }

    pub fn with_context(config: ServerConfig, dispatch: D, ctx: Arc<MessageContext>) -> Self {
        let shared = Arc::new(ServerShared {
            dispatch,
            label: config.label.clone(),
            request_latch: LatchSlot::new(),
            shutdown_latch: LatchSlot::new(),
        });

        Self {
            async_port: config.async_port,
            sync_port: config.sync_port,
            config,
            ctx,
            shared,
            pending_request: LatchSlot::new(),
            async_handler: None,
            sync_handler: None,
            async_shutdown: None,
            sync_shutdown: None,
            started: false,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.start_with_timeout(TransportConfig::STARTUP_TIMEOUT)
    }

    /// Start both handlers, returning once both relays are running.
    pub fn start_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.started {
            return Err(TransportError::AlreadyStarted(self.config.label.clone()));
        }
        self.config.validate()?;
        self.started = true;

        if let Err(e) = self.start_handlers(timeout) {
            error!("Failed to start server {}: {}", self.config.label, e);
            if let Err(stop_err) = self.stop() {
                warn!("Error unwinding server {}: {}", self.config.label, stop_err);
            }
            return Err(e);
        }

        info!(
            "Server {} listening on async port {} and sync port {} with {} threads",
            self.config.label, self.async_port, self.sync_port, self.config.thread_count
        );
        Ok(())
    }

    fn start_handlers(&mut self, timeout: Duration) -> Result<()> {
        let mut async_handler = MessageEndpointServerHandler::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.ctx),
            FanOutStrategy::Balanced,
            self.config.async_port,
            self.config.thread_count,
            self.config.timeout,
        );
        self.async_port = async_handler.start(timeout)?;
        self.async_handler = Some(async_handler);

        let mut sync_handler = MessageEndpointServerHandler::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.ctx),
            FanOutStrategy::Routed,
            self.config.sync_port,
            self.config.thread_count,
            self.config.timeout,
        );
        self.sync_port = sync_handler.start(timeout)?;
        self.sync_handler = Some(sync_handler);

        self.async_shutdown = Some(AsyncSendMessageEndpoint::connect(
            &self.ctx,
            LOCALHOST,
            self.async_port,
            self.config.shutdown_timeout,
        )?);
        self.sync_shutdown = Some(SyncSendMessageEndpoint::connect(
            &self.ctx,
            LOCALHOST,
            self.sync_port,
            self.config.shutdown_timeout,
        )?);
        Ok(())
    }

    /// Shut down every worker one at a time, then join both handlers.
    ///
    /// A failed round does not stop the ones after it. Joining each handler
    /// is bounded by the socket timeout plus the shutdown timeout. When a
    /// worker failed, its error is returned in preference to the rounds it
    /// left unanswered. Does nothing if the server is not started.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        info!("Stopping server {}", self.config.label);

        let shutdown_timeout = self.config.shutdown_timeout;
        let mut round_err = None;

        if let (Some(handler), Some(sender)) =
            (self.async_handler.as_ref(), self.async_shutdown.as_mut())
        {
            let result = shutdown_rounds(
                &self.shared,
                handler.live_workers(),
                shutdown_timeout,
                || sender.send(SHUTDOWN_HEADER, &SHUTDOWN_PAYLOAD, NO_SEQUENCE_NUM),
            );
            if let Err(e) = result {
                round_err.get_or_insert(e);
            }
        }

        if let (Some(handler), Some(sender)) =
            (self.sync_handler.as_ref(), self.sync_shutdown.as_mut())
        {
            let label = &self.shared.label;
            let result = shutdown_rounds(
                &self.shared,
                handler.live_workers(),
                shutdown_timeout,
                || {
                    let reply = sender.send_await_response(SHUTDOWN_HEADER, &SHUTDOWN_PAYLOAD)?;
                    match reply.status() {
                        MessageStatus::Success => Ok(()),
                        MessageStatus::Timeout => Err(TransportError::Timeout(shutdown_timeout)),
                        other => Err(TransportError::UnexpectedStatus {
                            label: label.clone(),
                            status: other.to_string(),
                        }),
                    }
                },
            );
            if let Err(e) = result {
                round_err.get_or_insert(e);
            }
        }

        let join_timeout = self.config.timeout + shutdown_timeout;
        let mut join_err = None;
        for mut handler in [self.async_handler.take(), self.sync_handler.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = handler.join(join_timeout) {
                join_err.get_or_insert(e);
            }
        }

        let mut close_err = None;
        if let Some(mut sender) = self.async_shutdown.take() {
            if let Err(e) = sender.close() {
                close_err.get_or_insert(e);
            }
        }
        if let Some(mut sender) = self.sync_shutdown.take() {
            if let Err(e) = sender.close() {
                close_err.get_or_insert(e);
            }
        }

        self.started = false;
        match join_err.or(round_err).or(close_err) {
            Some(e) => {
                warn!("Server {} stopped with error: {}", self.config.label, e);
                Err(e)
            }
            None => {
                info!("Server {} stopped", self.config.label);
                Ok(())
            }
        }
    }

    /// Install a latch that holds the next worker after it handles a message.
    ///
    /// Exactly one worker picks the latch up; the others carry on.
    pub fn set_request_latch(&self) {
        let latch = Latch::create_with_timeout(2, self.config.latch_timeout);
        self.pending_request.install(Arc::clone(&latch));
        self.shared.request_latch.install(latch);
    }

    /// Wait until a worker has handled a message, then remove the latch.
    pub fn await_request_latch(&self) -> Result<()> {
        let latch = self
            .pending_request
            .take()
            .ok_or_else(|| TransportError::Other("No request latch installed".to_string()))?;
        trace!("Waiting on request latch for {}", self.config.label);
        let result = latch.wait();

        // A latch no worker reached must not hold up a later message
        self.shared.request_latch.take();
        result
    }

    pub fn async_port(&self) -> u16 {
        self.async_port
    }

    pub fn sync_port(&self) -> u16 {
        self.sync_port
    }

    pub fn thread_count(&self) -> usize {
        self.config.thread_count
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn dispatch(&self) -> &D {
        &self.shared.dispatch
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

/// Run `rounds` sequential shutdown rounds, each stopping exactly one worker.
///
/// Every round runs even if an earlier one failed; the first error is
/// returned.
fn shutdown_rounds<D, F>(
    shared: &ServerShared<D>,
    rounds: usize,
    timeout: Duration,
    mut send_shutdown: F,
) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let mut first_err = None;
    for round in 0..rounds {
        let latch = Latch::create_with_timeout(2, timeout);
        shared.shutdown_latch.install(Arc::clone(&latch));

        trace!("Shutdown round {} for {}", round, shared.label);
        let result = send_shutdown().and_then(|_| latch.wait());

        // A worker that missed this round must not pick it up later
        shared.shutdown_latch.take();

        if let Err(e) = result {
            error!(
                "Shutdown round {} of {} failed for {}: {}",
                round + 1,
                rounds,
                shared.label,
                e
            );
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl<D: ServerDispatch> Drop for MessageEndpointServer<D> {
    fn drop(&mut self) {
        if self.started {
            warn!("Dropping started server {}, stopping it", self.config.label);
            if let Err(e) = self.stop() {
                warn!("Error stopping server {} on drop: {}", self.config.label, e);
            }
        }
    }
}
