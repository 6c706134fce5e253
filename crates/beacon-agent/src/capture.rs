//! The capture agent handle and its interception points.

use std::fmt;
use std::future::IntoFuture;
use std::io::Write;
use std::panic::{Location, PanicHookInfo};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::Duration;

use beacon_types::{CapturedEvent, ConsoleMethod, EventBody, SourceLocation, SubjectId};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::layer::CaptureLayer;
use crate::link::{self, ConnectionState, Delivery, Transport};
use crate::serialize::{render_message, serialize_args, Arg, ErrorInfo};

type PanicHook = dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static;

/// How long a panicking thread waits for its report to be written before
/// falling back to the previous hook.
const PANIC_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

struct AgentInner {
    config: AgentConfig,
    transport: Arc<Transport>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    previous_hook: Mutex<Option<Arc<PanicHook>>>,
}

/// Handle to a running capture agent. Cheap to clone; the connection task
/// stops when [`teardown`](Self::teardown) is called or the last handle is
/// dropped.
#[derive(Clone)]
pub struct CaptureAgent {
    inner: Arc<AgentInner>,
}

impl CaptureAgent {
    /// Starts the connection task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint cannot be turned into a channel URL or if no
    /// runtime is running.
    pub fn start(config: AgentConfig) -> Result<Self, AgentError> {
        let url = config.channel_url()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| AgentError::NoRuntime)?;

        let transport = Arc::new(Transport::new(
            url,
            config.backoff.clone(),
            config.queue_capacity,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(link::run(Arc::clone(&transport), shutdown_rx));

        tracing::debug!(subject = %config.subject, "capture agent started");

        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                transport,
                shutdown,
                task: Mutex::new(Some(task)),
                previous_hook: Mutex::new(None),
            }),
        })
    }

    pub fn subject(&self) -> &SubjectId {
        &self.inner.config.subject
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.transport.lock().state()
    }

    /// Events currently held for the next connection.
    pub fn queued(&self) -> usize {
        self.inner.transport.lock().queued()
    }

    /// Leaves [`ConnectionState::DisconnectedPermanent`] and starts
    /// connecting again. No effect in any other state.
    pub fn reset(&self) {
        if self.state() == ConnectionState::DisconnectedPermanent {
            self.inner.transport.reset.notify_one();
        }
    }

    /// Sends an event now if connected, otherwise queues it.
    pub fn emit(&self, event: CapturedEvent) -> Delivery {
        self.inner.transport.lock().deliver(event)
    }

    /// A console that writes to stdout/stderr as usual and forwards every
    /// call.
    pub fn console(&self) -> Console {
        Console {
            agent: self.clone(),
            out: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
            err: Arc::new(Mutex::new(Box::new(std::io::stderr()))),
        }
    }

    /// A `tracing` layer that forwards events as console events.
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer::new(Arc::downgrade(&self.inner.transport))
    }

    /// Forwards panics as `error` events. The hook that was installed
    /// before still runs unless [`AgentConfig::suppress_forwarded_panics`]
    /// is set and the panic frame was written to an open connection within
    /// a short bound. Calling this twice has no further effect.
    pub fn install_panic_hook(&self) {
        let mut slot = lock(&self.inner.previous_hook);
        if slot.is_some() {
            return;
        }
        let previous: Arc<PanicHook> = Arc::from(std::panic::take_hook());
        *slot = Some(Arc::clone(&previous));

        let transport = Arc::downgrade(&self.inner.transport);
        let suppress = self.inner.config.suppress_forwarded_panics;
        std::panic::set_hook(Box::new(move |info| {
            if !forward_panic(&transport, info, suppress) {
                previous(info);
            }
        }));
    }

    /// Reports a caught error as an `error` event. The `source()` chain
    /// becomes the stack.
    #[track_caller]
    pub fn report_error<E: std::error::Error + ?Sized>(&self, err: &E) -> Delivery {
        let info = ErrorInfo::from_error(err);
        self.emit(CapturedEvent::now(EventBody::Error {
            message: info.message,
            stack: info.stack,
            source: Some(caller_location(Location::caller())),
        }))
    }

    /// Reports a failure nobody handled.
    pub fn report_rejection(&self, reason: impl fmt::Display) -> Delivery {
        self.emit(CapturedEvent::now(EventBody::UnhandledRejection {
            message: reason.to_string(),
            stack: None,
        }))
    }

    /// Awaits `fut`, reporting an `Err` as an unhandled rejection. The result
    /// is returned unchanged.
    pub async fn supervise<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let result = fut.await;
        if let Err(e) = &result {
            self.report_rejection(e);
        }
        result
    }

    /// Spawns `fut` on the current runtime under [`supervise`](Self::supervise).
    pub fn spawn_supervised<F, T, E>(&self, fut: F) -> JoinHandle<Result<T, E>>
    where
        F: std::future::Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let agent = self.clone();
        tokio::spawn(async move { agent.supervise(fut).await })
    }

    /// Reports an HTTP exchange that failed at the transport level or came
    /// back with a 4xx/5xx status. The result is passed through untouched.
    #[track_caller]
    pub fn observe_response(
        &self,
        result: reqwest::Result<reqwest::Response>,
    ) -> reqwest::Result<reqwest::Response> {
        let message = match &result {
            Ok(response) if response.status().is_client_error() || response.status().is_server_error() => {
                Some(format!("HTTP {}: {}", response.status(), response.url()))
            }
            Ok(_) => None,
            Err(e) => Some(match e.url() {
                Some(url) => format!("Network error: {e} ({url})"),
                None => format!("Network error: {e}"),
            }),
        };
        if let Some(message) = message {
            self.emit(CapturedEvent::now(EventBody::Error {
                message,
                stack: None,
                source: Some(caller_location(Location::caller())),
            }));
        }
        result
    }

    /// Stops capturing: later events are discarded, the previous panic hook
    /// is reinstated, and the connection is closed after writing whatever
    /// was already handed to it.
    pub async fn teardown(&self) {
        self.inner.transport.lock().detach();
        self.restore_panic_hook();
        let _ = self.inner.shutdown.send(true);

        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "capture agent task ended abnormally");
            }
        }
        tracing::debug!(subject = %self.inner.config.subject, "capture agent torn down");
    }

    fn restore_panic_hook(&self) {
        let previous = lock(&self.inner.previous_hook).take();
        if let Some(previous) = previous {
            drop(std::panic::take_hook());
            std::panic::set_hook(Box::new(move |info| previous(info)));
        }
    }
}

/// Hands a panic to the link without waiting on the link lock. With
/// `confirm`, waits up to [`PANIC_WRITE_TIMEOUT`] for the frame to reach the
/// socket and returns whether it did; otherwise always returns false.
fn forward_panic(transport: &Weak<Transport>, info: &PanicHookInfo<'_>, confirm: bool) -> bool {
    let Some(transport) = transport.upgrade() else {
        return false;
    };
    let event = panic_event(info);
    // A panic raised while the link is locked must not wait on it.
    let mut link = match transport.link.try_lock() {
        Ok(link) => link,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return false,
    };
    if !confirm {
        link.deliver(event);
        return false;
    }
    let written = link.deliver_confirmed(event);
    drop(link);
    // The writer may be parked on this thread's own runtime.
    written.is_some_and(|written| written.recv_timeout(PANIC_WRITE_TIMEOUT).is_ok())
}

fn panic_event(info: &PanicHookInfo<'_>) -> CapturedEvent {
    let payload = info.payload();
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    };

    let backtrace = std::backtrace::Backtrace::capture();
    let stack = (backtrace.status() == std::backtrace::BacktraceStatus::Captured)
        .then(|| backtrace.to_string());

    CapturedEvent::now(EventBody::Error {
        message,
        stack,
        source: info.location().map(caller_location),
    })
}

fn caller_location(location: &Location<'_>) -> SourceLocation {
    SourceLocation {
        file: location.file().to_string(),
        line: Some(location.line()),
        column: Some(location.column()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Console facade. Each call prints the rendered line to the original
/// output (stderr for `warn` and `error`, stdout otherwise) and then
/// forwards a console event.
#[derive(Clone)]
pub struct Console {
    agent: CaptureAgent,
    out: SharedWriter,
    err: SharedWriter,
}

impl Console {
    /// Replaces the pass-through outputs.
    pub fn with_writers(
        mut self,
        out: impl Write + Send + 'static,
        err: impl Write + Send + 'static,
    ) -> Self {
        self.out = Arc::new(Mutex::new(Box::new(out)));
        self.err = Arc::new(Mutex::new(Box::new(err)));
        self
    }

    #[track_caller]
    pub fn log(&self, args: &[Arg]) -> Delivery {
        self.write(ConsoleMethod::Log, args)
    }

    #[track_caller]
    pub fn info(&self, args: &[Arg]) -> Delivery {
        self.write(ConsoleMethod::Info, args)
    }

    #[track_caller]
    pub fn warn(&self, args: &[Arg]) -> Delivery {
        self.write(ConsoleMethod::Warn, args)
    }

    #[track_caller]
    pub fn error(&self, args: &[Arg]) -> Delivery {
        self.write(ConsoleMethod::Error, args)
    }

    #[track_caller]
    pub fn debug(&self, args: &[Arg]) -> Delivery {
        self.write(ConsoleMethod::Debug, args)
    }

    #[track_caller]
    pub fn write(&self, method: ConsoleMethod, args: &[Arg]) -> Delivery {
        let message = render_message(args);
        let writer = match method {
            ConsoleMethod::Warn | ConsoleMethod::Error => &self.err,
            _ => &self.out,
        };
        {
            let mut w = lock(writer);
            let _ = writeln!(w, "{message}");
            let _ = w.flush();
        }
        self.agent.emit(CapturedEvent::now(EventBody::Console {
            method,
            message,
            args: serialize_args(args),
            source: Some(caller_location(Location::caller())),
        }))
    }
}
