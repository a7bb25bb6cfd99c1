//! Agent lifecycle orchestration
//!
//! Every lifecycle transition is a task on the single-consumer queue, so
//! operations are strictly serialized: a config swap can never race a
//! transport start, and dispatcher retries queue up behind whatever
//! lifecycle change is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::batcher::{BatchSink, BatcherHandle, EventsBatchBuilder, MetricsBatchBuilder};
use crate::clients::GwClient;
use crate::config::Connector;
use crate::errors::DeliveryError;
use crate::nats::dispatcher::{RetryScheduler, UnauthorizedHook};
use crate::nats::{BrokerConnection, DispatcherOption, DurableDispatcher};
use crate::service::transit::fix_tracer_context;
use crate::service::{AgentStats, AgentStatus, Stats, Subject, TaskArgs, TransitService};
use crate::taskqueue::{Handler, Task, TaskHandle, TaskQueue, TaskResult};
use crate::{Envelope, PayloadKind};

const ALL_SUBJECTS: [Subject; 10] = [
    Subject::Config,
    Subject::Exit,
    Subject::ResetNats,
    Subject::StartController,
    Subject::StopController,
    Subject::StartNats,
    Subject::StopNats,
    Subject::StartTransport,
    Subject::StopTransport,
    Subject::RetryDurable,
];

/// Async hook for the pluggable controller surface
pub type ControllerHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
/// Invoked after a new config has been applied
pub type ConfigHandler = Arc<dyn Fn(&Connector) + Send + Sync>;
/// Invoked during exit, after all subsystems have stopped
pub type ExitHandler = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct Batchers {
    pub events: BatcherHandle,
    pub metrics: BatcherHandle,
}

pub(crate) struct Inner {
    config: RwLock<Connector>,
    connection: tokio::sync::Mutex<Option<Arc<BrokerConnection>>>,
    dispatcher: Mutex<Option<Arc<DurableDispatcher>>>,
    batchers: tokio::sync::Mutex<Option<Batchers>>,
    clients: RwLock<Arc<Vec<Arc<GwClient>>>>,
    pub(crate) stats: Stats,
    transport_running: AtomicBool,
    controller_running: AtomicBool,
    queue: OnceLock<Arc<TaskQueue<Subject, TaskArgs>>>,
    quit_tx: watch::Sender<bool>,
    controller_start: Mutex<Option<ControllerHook>>,
    controller_stop: Mutex<Option<ControllerHook>>,
    config_handlers: Mutex<Vec<ConfigHandler>>,
    exit_handlers: Mutex<Vec<ExitHandler>>,
}

/// The agent runtime: broker, transport, batchers, controller seam
pub struct AgentService {
    inner: Arc<Inner>,
    quit_rx: watch::Receiver<bool>,
}

impl AgentService {
    pub fn new(connector: Connector) -> Self {
        let task_alarm = connector.task_alarm();
        let (quit_tx, quit_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            config: RwLock::new(connector),
            connection: tokio::sync::Mutex::new(None),
            dispatcher: Mutex::new(None),
            batchers: tokio::sync::Mutex::new(None),
            clients: RwLock::new(Arc::new(Vec::new())),
            stats: Stats::new(),
            transport_running: AtomicBool::new(false),
            controller_running: AtomicBool::new(false),
            queue: OnceLock::new(),
            quit_tx,
            controller_start: Mutex::new(None),
            controller_stop: Mutex::new(None),
            config_handlers: Mutex::new(Vec::new()),
            exit_handlers: Mutex::new(Vec::new()),
        });

        let mut builder = TaskQueue::builder()
            .alarm(
                task_alarm,
                Arc::new(|subject: &Subject| {
                    warn!(?subject, "lifecycle task is taking too long");
                }),
            )
            .debugger(Arc::new(|last_tasks: Vec<(Subject, u8)>| {
                error!(?last_tasks, "task queue exhausted, recent tasks listed");
            }));
        for subject in ALL_SUBJECTS {
            let handler_inner = Arc::clone(&inner);
            let handler: Handler<Subject, TaskArgs> = Arc::new(move |task| {
                let inner = Arc::clone(&handler_inner);
                Box::pin(async move { inner.execute(task).await })
            });
            builder = builder.handler(subject, handler);
        }
        let queue = Arc::new(builder.build());
        let _ = inner.queue.set(queue);

        Self { inner, quit_rx }
    }

    /// Sending facade handed to payload producers
    pub fn transit(&self) -> TransitService {
        TransitService::new(Arc::clone(&self.inner))
    }

    pub async fn start_controller(&self) -> TaskResult {
        self.push_sync(Subject::StartController).await
    }

    pub async fn stop_controller(&self) -> TaskResult {
        self.push_sync(Subject::StopController).await
    }

    pub async fn start_nats(&self) -> TaskResult {
        self.push_sync(Subject::StartNats).await
    }

    pub async fn stop_nats(&self) -> TaskResult {
        self.push_sync(Subject::StopNats).await
    }

    pub async fn reset_nats(&self) -> TaskResult {
        self.push_sync(Subject::ResetNats).await
    }

    pub async fn start_transport(&self) -> TaskResult {
        self.push_sync(Subject::StartTransport).await
    }

    pub async fn stop_transport(&self) -> TaskResult {
        self.push_sync(Subject::StopTransport).await
    }

    pub async fn exit(&self) -> TaskResult {
        self.push_sync(Subject::Exit).await
    }

    pub fn start_controller_async(&self) -> anyhow::Result<TaskHandle<Subject>> {
        self.push_async(Subject::StartController)
    }

    pub fn stop_controller_async(&self) -> anyhow::Result<TaskHandle<Subject>> {
        self.push_async(Subject::StopController)
    }

    pub fn start_nats_async(&self) -> anyhow::Result<TaskHandle<Subject>> {
        self.push_async(Subject::StartNats)
    }

    pub fn stop_nats_async(&self) -> anyhow::Result<TaskHandle<Subject>> {
        self.push_async(Subject::StopNats)
    }

    pub fn reset_nats_async(&self) -> anyhow::Result<TaskHandle<Subject>> {
        self.push_async(Subject::ResetNats)
    }

    pub fn start_transport_async(&self) -> anyhow::Result<TaskHandle<Subject>> {
        self.push_async(Subject::StartTransport)
    }

    pub fn stop_transport_async(&self) -> anyhow::Result<TaskHandle<Subject>> {
        self.push_async(Subject::StopTransport)
    }

    /// Enqueue an exit without waiting for it
    pub fn exit_async(&self) -> anyhow::Result<TaskHandle<Subject>> {
        self.push_async(Subject::Exit)
    }

    /// Apply a new configuration, restarting subsystems as needed
    pub async fn config(&self, connector: Connector) -> TaskResult {
        self.inner
            .queue()
            .push_sync(Subject::Config, TaskArgs::Config(connector))
            .await
    }

    pub fn config_async(&self, connector: Connector) -> anyhow::Result<TaskHandle<Subject>> {
        Ok(self
            .inner
            .queue()
            .push_async(Subject::Config, TaskArgs::Config(connector))?)
    }

    async fn push_sync(&self, subject: Subject) -> TaskResult {
        self.inner.queue().push_sync(subject, TaskArgs::None).await
    }

    fn push_async(&self, subject: Subject) -> anyhow::Result<TaskHandle<Subject>> {
        Ok(self.inner.queue().push_async(subject, TaskArgs::None)?)
    }

    pub fn stats(&self) -> AgentStats {
        self.inner.stats.snapshot()
    }

    pub async fn status(&self) -> AgentStatus {
        AgentStatus {
            controller: self.inner.controller_running.load(Ordering::SeqCst),
            nats: self.inner.connection.lock().await.is_some(),
            transport: self.inner.transport_running.load(Ordering::SeqCst),
        }
    }

    /// Register hooks for the pluggable controller surface
    pub fn set_controller_hooks(&self, start: ControllerHook, stop: ControllerHook) {
        *self.inner.controller_start.lock().unwrap() = Some(start);
        *self.inner.controller_stop.lock().unwrap() = Some(stop);
    }

    pub fn on_config(&self, handler: ConfigHandler) {
        self.inner.config_handlers.lock().unwrap().push(handler);
    }

    pub fn on_exit(&self, handler: ExitHandler) {
        self.inner.exit_handlers.lock().unwrap().push(handler);
    }

    /// Push an exit task on SIGINT/SIGTERM
    pub fn hook_signals(&self) {
        let queue = Arc::clone(self.inner.queue());
        tokio::spawn(async move {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(err) => {
                        error!(error = %err, "failed to install signal handler");
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("signal received, shutting down");
            if let Err(err) = queue.push_async(Subject::Exit, TaskArgs::None) {
                error!(error = %err, "failed to queue exit");
            }
        });
    }

    /// Resolves once an exit task has completed
    pub async fn quit(&self) {
        let mut quit_rx = self.quit_rx.clone();
        if *quit_rx.borrow() {
            return;
        }
        let _ = quit_rx.changed().await;
    }
}

impl Inner {
    fn queue(&self) -> &Arc<TaskQueue<Subject, TaskArgs>> {
        self.queue
            .get()
            .expect("task queue is wired in AgentService::new")
    }

    async fn execute(self: Arc<Self>, task: Task<Subject, TaskArgs>) -> anyhow::Result<()> {
        debug!(subject = ?task.subject, idx = task.idx, "running lifecycle task");
        match task.subject {
            Subject::StartController => self.start_controller().await,
            Subject::StopController => self.stop_controller().await,
            Subject::StartNats => self.start_nats().await,
            Subject::StopNats => self.stop_nats().await,
            Subject::ResetNats => self.reset_nats().await,
            Subject::StartTransport => self.start_transport().await,
            Subject::StopTransport => self.stop_transport().await,
            Subject::Exit => self.exit().await,
            Subject::Config => match task.args {
                TaskArgs::Config(connector) => self.apply_config(connector).await,
                _ => anyhow::bail!("config task without a config"),
            },
            Subject::RetryDurable => match task.args {
                TaskArgs::Retry(opt) => self.retry_durable(opt).await,
                _ => anyhow::bail!("retry task without a dispatcher option"),
            },
        }
    }

    async fn start_controller(&self) -> anyhow::Result<()> {
        if self.controller_running.swap(true, Ordering::SeqCst) {
            debug!("controller already running");
            return Ok(());
        }
        let hook = self.controller_start.lock().unwrap().clone();
        if let Some(hook) = hook {
            if let Err(err) = hook().await {
                self.controller_running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        }
        info!("controller started");
        Ok(())
    }

    async fn stop_controller(&self) -> anyhow::Result<()> {
        if !self.controller_running.swap(false, Ordering::SeqCst) {
            debug!("controller not running");
            return Ok(());
        }
        let hook = self.controller_stop.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook().await?;
        }
        info!("controller stopped");
        Ok(())
    }

    async fn start_nats(&self) -> anyhow::Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            debug!("broker already connected");
            return Ok(());
        }
        let nats_config = self.config.read().unwrap().nats.clone();
        let fresh = BrokerConnection::connect(nats_config).await?;
        *connection = Some(Arc::new(fresh));
        Ok(())
    }

    async fn stop_nats(self: &Arc<Self>) -> anyhow::Result<()> {
        self.stop_transport().await?;
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.take() {
            connection.stop().await?;
        }
        Ok(())
    }

    async fn reset_nats(&self) -> anyhow::Result<()> {
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(connection) => connection.purge().await.map_err(Into::into),
            None => {
                debug!("broker not connected, nothing to reset");
                Ok(())
            }
        }
    }

    async fn start_transport(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.transport_running.load(Ordering::SeqCst) {
            debug!("transport already running");
            return Ok(());
        }
        let connection = self
            .connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("broker must be started before the transport"))?;
        let config = self.config.read().unwrap().clone();

        let clients = config
            .gw_connections
            .iter()
            .filter(|gw| gw.enabled)
            .map(|gw| GwClient::new(gw.clone(), &config.app_type).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        if clients.is_empty() {
            anyhow::bail!("no enabled downstream connections configured");
        }
        *self.clients.write().unwrap() = Arc::new(clients);

        let retry_queue = Arc::clone(self.queue());
        let scheduler: RetryScheduler = Arc::new(move |opt: DispatcherOption| {
            let durable = opt.durable.clone();
            if let Err(err) = retry_queue.push_async(Subject::RetryDurable, TaskArgs::Retry(opt)) {
                error!(durable, error = %err, "failed to queue durable retry");
            }
        });
        let unauthorized_queue = Arc::clone(self.queue());
        let on_unauthorized: UnauthorizedHook = Arc::new(move || {
            warn!("stopping transport after authorization failure");
            if let Err(err) = unauthorized_queue.push_async(Subject::StopTransport, TaskArgs::None)
            {
                error!(error = %err, "failed to queue transport stop");
            }
        });
        let dispatcher = Arc::new(DurableDispatcher::new(
            Arc::clone(&connection),
            scheduler,
            on_unauthorized,
        ));
        for kind in PayloadKind::ALL {
            dispatcher
                .open_durable(self.dispatcher_option(&connection, kind))
                .await?;
        }
        *self.dispatcher.lock().unwrap() = Some(dispatcher);

        let sink_inner = Arc::clone(self);
        let sink: BatchSink = Arc::new(move |kind, payload| {
            let inner = Arc::clone(&sink_inner);
            Box::pin(async move { inner.publish(kind, payload).await.map_err(Into::into) })
        });
        let events = BatcherHandle::spawn(
            Box::new(EventsBatchBuilder::new(config.batch_max_bytes)),
            config.batch_events(),
            config.batch_max_bytes,
            Arc::clone(&sink),
        );
        let metrics = BatcherHandle::spawn(
            Box::new(MetricsBatchBuilder::new()),
            config.batch_metrics(),
            config.batch_max_bytes,
            sink,
        );
        *self.batchers.lock().await = Some(Batchers { events, metrics });

        self.transport_running.store(true, Ordering::SeqCst);
        info!("transport started");
        Ok(())
    }

    async fn stop_transport(&self) -> anyhow::Result<()> {
        if !self.transport_running.swap(false, Ordering::SeqCst) {
            debug!("transport not running");
            return Ok(());
        }
        // flush pending batches before the consumers go away
        if let Some(batchers) = self.batchers.lock().await.take() {
            batchers.events.exit().await;
            batchers.metrics.exit().await;
        }
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            dispatcher.close_all();
        }
        info!("transport stopped");
        Ok(())
    }

    async fn exit(self: &Arc<Self>) -> anyhow::Result<()> {
        self.stop_nats().await?;
        self.stop_controller().await?;
        let handlers: Vec<_> = self.exit_handlers.lock().unwrap().clone();
        for handler in handlers {
            handler();
        }
        let _ = self.quit_tx.send(true);
        info!("agent exited");
        Ok(())
    }

    /// Minimal-restart config swap.
    ///
    /// If the broker-relevant subset is unchanged only the transport is
    /// bounced (picking up new clients, batch intervals and suppression);
    /// otherwise broker and transport are torn down and brought back in
    /// order.
    async fn apply_config(self: &Arc<Self>, connector: Connector) -> anyhow::Result<()> {
        let same_broker = {
            let current = self.config.read().unwrap();
            current.broker_checksum() == connector.broker_checksum()
        };
        let transport_was_running = self.transport_running.load(Ordering::SeqCst);

        if same_broker {
            debug!("broker config unchanged, restarting transport only");
            *self.config.write().unwrap() = connector.clone();
            if transport_was_running {
                self.stop_transport().await?;
                self.start_transport().await?;
            }
        } else {
            info!("broker config changed, restarting broker and transport");
            let broker_was_connected = self.connection.lock().await.is_some();
            self.stop_transport().await?;
            {
                let mut connection = self.connection.lock().await;
                if let Some(connection) = connection.take() {
                    connection.stop().await?;
                }
            }
            *self.config.write().unwrap() = connector.clone();
            if broker_was_connected {
                self.start_nats().await?;
            }
            if transport_was_running {
                self.start_transport().await?;
            }
        }

        let handlers: Vec<_> = self.config_handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(&connector);
        }
        Ok(())
    }

    async fn retry_durable(&self, opt: DispatcherOption) -> anyhow::Result<()> {
        if !self.transport_running.load(Ordering::SeqCst) {
            anyhow::bail!("transport is not running, dropping retry for {}", opt.durable);
        }
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("dispatcher is not running"))?;
        dispatcher.retry(opt).await?;
        Ok(())
    }

    fn dispatcher_option(self: &Arc<Self>, connection: &BrokerConnection, kind: PayloadKind) -> DispatcherOption {
        let dispatch_inner = Arc::clone(self);
        DispatcherOption {
            durable: kind.as_str().to_string(),
            subject: connection.subject_for(kind),
            handler: Arc::new(move |envelope| {
                let inner = Arc::clone(&dispatch_inner);
                Box::pin(async move { inner.dispatch(envelope).await })
            }),
        }
    }

    /// Deliver one decoded payload to every enabled downstream
    async fn dispatch(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        let payload = match envelope.kind {
            PayloadKind::Metrics | PayloadKind::Inventory => {
                let (agent_id, app_type) = self.identity();
                fix_tracer_context(&envelope.payload, &agent_id, &app_type)?
            }
            _ => envelope.payload.clone(),
        };

        let clients = self.clients.read().unwrap().clone();
        if clients.is_empty() {
            return Err(DeliveryError::undecided("no downstream clients configured"));
        }
        for client in clients.iter() {
            if let Err(err) = client.send(envelope.kind, payload.clone()).await {
                self.stats.record_error(format!("{}: {err}", client.host_name()));
                return Err(err);
            }
        }
        self.stats
            .record_sent(payload.len(), envelope.kind == PayloadKind::Metrics);
        Ok(())
    }

    /// Queue a payload on the broker with a fresh trace token
    pub(crate) async fn publish(
        &self,
        kind: PayloadKind,
        payload: Bytes,
    ) -> Result<(), DeliveryError> {
        let connection = self
            .connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| DeliveryError::transient("broker is not connected"))?;
        let trace_token = crate::transit::make_trace_token();
        connection.publish(kind, payload, &trace_token).await
    }

    /// Hand a payload to the events batcher; `false` if no batcher is up
    pub(crate) async fn batch_events(&self, payload: Bytes) -> bool {
        match self.batchers.lock().await.as_ref() {
            Some(batchers) => batchers.events.add(payload),
            None => false,
        }
    }

    /// Hand a payload to the metrics batcher; `false` if no batcher is up
    pub(crate) async fn batch_metrics(&self, payload: Bytes) -> bool {
        match self.batchers.lock().await.as_ref() {
            Some(batchers) => batchers.metrics.add(payload),
            None => false,
        }
    }

    pub(crate) fn connector(&self) -> Connector {
        self.config.read().unwrap().clone()
    }

    pub(crate) fn identity(&self) -> (String, String) {
        let config = self.config.read().unwrap();
        (config.agent_id.clone(), config.app_type.clone())
    }
}
