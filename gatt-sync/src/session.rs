use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::anyhow;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use log::trace;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use uuid::Uuid;

use crate::criteria::ScanCriteria;
use crate::engine::{CentralEngine, EngineConfig, ReconnectPolicy};
use crate::fake::FakeTransport;
use crate::peripheral::Peripheral;
use crate::transport::{Scheduler, Transport, TransportEvent};
use crate::{Error, Event, Handle, OpToken, Result};

/// An async front end for a [`CentralEngine`]
///
/// The session owns the engine and a task that feeds it everything posted
/// to the transport bus, one event at a time. Operation timers are tokio
/// tasks that post their timeouts to that same bus.
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's not public API for SessionInner
// we don't really leak anything
#[derive(Debug)]
pub struct SessionInner {
    // The public-facing event stream (a clone of the engine's sender so
    // subscribing doesn't need to take the engine lock)
    event_bus: broadcast::Sender<Event>,

    // Every mutation of the tree happens under this lock, either from an
    // application command or from the task draining the transport bus.
    engine: Mutex<CentralEngine>,
}

/// Spawns a tokio task per armed timer which posts a `Timeout` to the
/// transport bus when it expires
#[derive(Debug)]
struct TokioScheduler {
    runtime: tokio::runtime::Handle,
    transport_bus: mpsc::UnboundedSender<TransportEvent>,
    timers: Arc<DashMap<OpToken, JoinHandle<()>>>,
}

impl Scheduler for TokioScheduler {
    fn arm(&self, handle: Handle, token: OpToken, after: Duration) {
        let bus = self.transport_bus.clone();
        let timers = Arc::downgrade(&self.timers);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(timers) = timers.upgrade() {
                timers.remove(&token);
            }
            let _ = bus.send(TransportEvent::Timeout { handle, token });
        });
        self.timers.insert(token, timer);
    }

    fn cancel(&self, token: OpToken) {
        if let Some((_, timer)) = self.timers.remove(&token) {
            timer.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.value().abort();
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    engine: EngineConfig,
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig::default()
    }

    pub fn set_engine_config(&mut self, config: EngineConfig) -> &mut Self {
        self.engine = config;
        self
    }

    pub fn set_reconnect_policy(&mut self, policy: ReconnectPolicy) -> &mut Self {
        self.engine.reconnect = policy;
        self
    }

    pub fn set_io_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.engine.io_timeout = timeout;
        self
    }

    /// Starts a session over the transport built by `make_transport`
    ///
    /// The transport is handed the sending end of the transport bus and
    /// should post everything it observes there.
    pub async fn start<T, F>(self, make_transport: F) -> Result<Session>
    where
        T: Transport + 'static,
        F: FnOnce(mpsc::UnboundedSender<TransportEvent>) -> Result<T>,
    {
        Session::start(self, make_transport).await
    }

    /// Starts a session over a [`FakeTransport`], returning a handle on the
    /// transport so that devices can be added and events injected
    pub async fn start_fake(self) -> Result<(Session, FakeTransport)> {
        let transport = FakeTransport::new();
        let session = self
            .start(|bus| {
                transport.attach(bus);
                Ok(transport.clone())
            })
            .await?;
        Ok((session, transport))
    }
}

impl Session {
    // The task draining the transport bus only holds a Weak reference to the
    // SessionInner (otherwise a Session could never be dropped) and re-wraps
    // it while processing each event.
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    async fn start<T, F>(config: SessionConfig, make_transport: F) -> Result<Self>
    where
        T: Transport + 'static,
        F: FnOnce(mpsc::UnboundedSender<TransportEvent>) -> Result<T>,
    {
        let (transport_bus_tx, transport_bus_rx) = mpsc::unbounded_channel();
        let transport = make_transport(transport_bus_tx.clone())?;
        let scheduler = TokioScheduler {
            runtime: tokio::runtime::Handle::current(),
            transport_bus: transport_bus_tx,
            timers: Arc::new(DashMap::new()),
        };

        let engine = CentralEngine::new(config.engine, Box::new(transport), Box::new(scheduler));
        let session = Session {
            inner: Arc::new(SessionInner {
                event_bus: engine.event_bus(),
                engine: Mutex::new(engine),
            }),
        };

        let weak_session = Arc::downgrade(&session.inner);
        tokio::spawn(async move { Session::run_transport_task(weak_session, transport_bus_rx).await });

        Ok(session)
    }

    async fn run_transport_task(
        weak_session_inner: Weak<SessionInner>,
        transport_bus: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        trace!("Starting task to process events from the transport bus...");

        let stream = UnboundedReceiverStream::new(transport_bus);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            // Only hold a strong reference while processing an event
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Exiting transport event task since Session has been dropped");
                    break;
                }
            };
            session.engine().on_transport_event(event);
        }

        trace!("Finished task processing events from the transport bus");
    }

    pub(crate) fn engine(&self) -> MutexGuard<'_, CentralEngine> {
        self.inner.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with read access to the engine (and so the whole tree)
    ///
    /// The engine is locked while `f` runs so it shouldn't block.
    pub fn with_engine<R>(&self, f: impl FnOnce(&CentralEngine) -> R) -> R {
        f(&self.engine())
    }

    /// Returns a stream of all engine events. Also see `peripheral_events`
    /// which may be convenient when you are only interested in events
    /// related to a single peripheral.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
            match x {
                Ok(x) => Some(x),
                Err(err) => {
                    log::warn!("Event subscriber lagged: {}", err);
                    None
                }
            }
        }))
    }

    /// As a convenience this provides a filtered stream of events that
    /// guarantees any peripheral events will only relate to the specified
    /// peripheral. Events unrelated to any peripheral are delivered
    /// unfiltered.
    pub fn peripheral_events(&self, peripheral: &Peripheral) -> Result<impl Stream<Item = Event>> {
        let filter_id = peripheral.id();
        Ok(self.events()?.filter(move |event| {
            let keep = match event.peripheral() {
                Some(id) => id == filter_id,
                None => true,
            };
            futures::future::ready(keep)
        }))
    }

    /// Starts scanning for peripherals matching `criteria`
    ///
    /// If already scanning this just replaces the criteria.
    pub fn start_scanning(&self, criteria: ScanCriteria) -> Result<()> {
        self.engine().start_scanning(criteria)
    }

    pub fn stop_scanning(&self) {
        self.engine().stop_scanning()
    }

    pub fn is_scanning(&self) -> bool {
        self.engine().is_scanning()
    }

    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.engine()
            .peripherals()
            .ids()
            .into_iter()
            .map(|id| Peripheral::wrap(self.clone(), id))
            .collect()
    }

    pub fn peripheral(&self, id: Uuid) -> Option<Peripheral> {
        if self.engine().peripherals().contains(&id) {
            Some(Peripheral::wrap(self.clone(), id))
        } else {
            None
        }
    }
}

/// Waits for the first event for which `outcome` returns a result
///
/// `events` should be subscribed before the operation being waited on is
/// issued so that its completion can't be missed.
pub(crate) async fn wait_for<T>(
    events: impl Stream<Item = Event>,
    mut outcome: impl FnMut(&Event) -> Option<Result<T>>,
) -> Result<T> {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        if let Some(result) = outcome(&event) {
            return result;
        }
    }
    Err(Error::Other(anyhow!("Event stream closed")))
}
