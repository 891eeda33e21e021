//! Tokio front end for the pipeline.
//!
//! [`MeshNetworkManager`] is a cheap handle to an actor task that owns a
//! [`Pipeline`]. Every operation becomes a command on an unbounded channel,
//! so calls never block and are processed in the order they were made.
//! A second task delivers notifications to the observer, which keeps
//! observer callbacks off the actor: an observer may call back into the
//! manager without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

use super::parameters::NetworkParameters;
use super::pipeline::{Notification, Pipeline};
use super::request::SendRequest;
use crate::access::MeshMessage;
use crate::core::{Address, Bearer, MeshError, MeshObserver, MessageHandle, PduType};
use crate::crypto::KeyIndex;
use crate::proxy::ProxyConfigurationMessage;
use crate::store::{MemorySequenceStore, MeshNetwork, ModelId, SequenceStore};

enum Command {
    Send {
        handle: MessageHandle,
        request: SendRequest,
    },
    Reply {
        handle: MessageHandle,
        origin: Address,
        destination: Address,
        message: Arc<dyn MeshMessage>,
        application_key: Option<KeyIndex>,
    },
    Publish {
        handle: MessageHandle,
        message: Arc<dyn MeshMessage>,
        element: Address,
        model: ModelId,
    },
    Cancel(MessageHandle),
    Incoming {
        data: Vec<u8>,
        pdu_type: PduType,
    },
    ProxyConfiguration {
        message: ProxyConfigurationMessage,
        result: oneshot::Sender<Result<(), MeshError>>,
    },
    SetNetwork(Arc<MeshNetwork>),
    SetParameters(NetworkParameters),
    SetObserver(Option<Weak<dyn MeshObserver>>),
}

enum Notify {
    Observer(Option<Weak<dyn MeshObserver>>),
    Event(Notification),
}

/// Builder for a [`MeshNetworkManager`].
pub struct MeshNetworkManagerBuilder {
    network: MeshNetwork,
    bearer: Arc<dyn Bearer>,
    params: NetworkParameters,
    store: Box<dyn SequenceStore>,
}

impl MeshNetworkManagerBuilder {
    /// Override the network parameters.
    pub fn parameters(mut self, params: NetworkParameters) -> Self {
        self.params = params;
        self
    }

    /// Persist sequence numbers in `store` instead of memory.
    pub fn sequence_store(mut self, store: impl SequenceStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    /// Start the actor. Must be called from within a tokio runtime.
    pub fn spawn(self) -> MeshNetworkManager {
        let pipeline = Pipeline::new(Arc::new(self.network), self.bearer, self.params, self.store);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(deliver_notifications(notify_rx));
        let task = tokio::spawn(run(pipeline, commands_rx, shutdown_rx, notify_tx));

        MeshNetworkManager {
            commands: commands_tx,
            next_handle: AtomicU64::new(1),
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Handle to a running mesh network manager.
///
/// # Example
///
/// ```ignore
/// let manager = MeshNetworkManager::builder(network, bearer)
///     .parameters(NetworkParameters::default())
///     .spawn();
/// manager.set_observer(&observer);
///
/// let message = AccessMessage::new(Opcode::new(0xC202)?, vec![0x01, 0x00]);
/// let handle = manager.send(SendRequest::new(message, destination))?;
/// ```
pub struct MeshNetworkManager {
    commands: mpsc::UnboundedSender<Command>,
    next_handle: AtomicU64,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MeshNetworkManager {
    /// Start building a manager for `network`, sending through `bearer`.
    pub fn builder(network: MeshNetwork, bearer: Arc<dyn Bearer>) -> MeshNetworkManagerBuilder {
        MeshNetworkManagerBuilder {
            network,
            bearer,
            params: NetworkParameters::default(),
            store: Box::new(MemorySequenceStore::new()),
        }
    }

    /// Queue a message for sending. Returns its handle immediately; the
    /// outcome is reported to the observer.
    pub fn send(&self, request: SendRequest) -> Result<MessageHandle, MeshError> {
        let handle = self.allocate_handle();
        self.submit(Command::Send { handle, request })?;
        Ok(handle)
    }

    /// Reply to a message received from `origin` on the local element
    /// `destination`.
    pub fn reply(
        &self,
        origin: Address,
        destination: Address,
        message: impl MeshMessage + 'static,
        application_key: Option<KeyIndex>,
    ) -> Result<MessageHandle, MeshError> {
        let handle = self.allocate_handle();
        self.submit(Command::Reply {
            handle,
            origin,
            destination,
            message: Arc::new(message),
            application_key,
        })?;
        Ok(handle)
    }

    /// Publish from a local model using its publication settings.
    pub fn publish(
        &self,
        message: impl MeshMessage + 'static,
        element: Address,
        model: ModelId,
    ) -> Result<MessageHandle, MeshError> {
        let handle = self.allocate_handle();
        self.submit(Command::Publish {
            handle,
            message: Arc::new(message),
            element,
            model,
        })?;
        Ok(handle)
    }

    /// Cancel a send. Unknown or finished handles are ignored.
    pub fn cancel(&self, handle: MessageHandle) -> Result<(), MeshError> {
        self.submit(Command::Cancel(handle))
    }

    /// Pass a PDU received by the bearer.
    pub fn handle_incoming(&self, data: &[u8], pdu_type: PduType) -> Result<(), MeshError> {
        self.submit(Command::Incoming {
            data: data.to_vec(),
            pdu_type,
        })
    }

    /// Send a proxy configuration message to the connected proxy node.
    pub async fn send_proxy_configuration(&self, message: ProxyConfigurationMessage) -> Result<(), MeshError> {
        let (result, rx) = oneshot::channel();
        self.submit(Command::ProxyConfiguration { message, result })?;
        rx.await.map_err(|_| MeshError::ManagerStopped)?
    }

    /// Replace the network configuration.
    pub fn set_network(&self, network: MeshNetwork) -> Result<(), MeshError> {
        self.submit(Command::SetNetwork(Arc::new(network)))
    }

    /// Replace the network parameters.
    pub fn set_parameters(&self, params: NetworkParameters) -> Result<(), MeshError> {
        self.submit(Command::SetParameters(params))
    }

    /// Report outcomes to `observer`. Only a weak reference is kept.
    pub fn set_observer<O: MeshObserver + 'static>(&self, observer: &Arc<O>) -> Result<(), MeshError> {
        let observer: Weak<dyn MeshObserver> = Arc::downgrade(observer) as Weak<dyn MeshObserver>;
        self.submit(Command::SetObserver(Some(observer)))
    }

    /// Stop reporting outcomes.
    pub fn clear_observer(&self) -> Result<(), MeshError> {
        self.submit(Command::SetObserver(None))
    }

    /// Stop the actor and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn allocate_handle(&self) -> MessageHandle {
        MessageHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, command: Command) -> Result<(), MeshError> {
        self.commands.send(command).map_err(|_| MeshError::ManagerStopped)
    }
}

impl Drop for MeshNetworkManager {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn run(
    mut pipeline: Pipeline,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
    notify: mpsc::UnboundedSender<Notify>,
) {
    debug!(local = %pipeline.network().local_address(), "Mesh network manager started");
    loop {
        let deadline = pipeline.next_deadline();
        let timer = async move {
            match deadline {
                Some(deadline) => sleep_until(Instant::from_std(deadline)).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Commands win over a due timer so a cancel disarms it first.
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            command = commands.recv() => match command {
                Some(command) => execute(&mut pipeline, command, &notify),
                None => break,
            },
            () = timer => pipeline.poll_timers(now()),
        }

        for notification in pipeline.take_notifications() {
            let _ = notify.send(Notify::Event(notification));
        }
    }
    debug!(in_flight = pipeline.in_flight(), "Mesh network manager stopped");
}

fn execute(pipeline: &mut Pipeline, command: Command, notify: &mpsc::UnboundedSender<Notify>) {
    let now = now();
    match command {
        Command::Send { handle, request } => pipeline.send(handle, request, now),
        Command::Reply {
            handle,
            origin,
            destination,
            message,
            application_key,
        } => pipeline.reply(handle, origin, destination, message, application_key, now),
        Command::Publish {
            handle,
            message,
            element,
            model,
        } => pipeline.publish(handle, message, element, model, now),
        Command::Cancel(handle) => {
            if !pipeline.cancel(handle) {
                trace!(%handle, "Nothing to cancel");
            }
        }
        Command::Incoming { data, pdu_type } => pipeline.handle_incoming(&data, pdu_type, now),
        Command::ProxyConfiguration { message, result } => {
            let _ = result.send(pipeline.send_proxy_configuration(&message));
        }
        Command::SetNetwork(network) => pipeline.set_network(network),
        Command::SetParameters(params) => pipeline.set_parameters(params),
        Command::SetObserver(observer) => {
            let _ = notify.send(Notify::Observer(observer));
        }
    }
}

async fn deliver_notifications(mut rx: mpsc::UnboundedReceiver<Notify>) {
    let mut observer: Option<Weak<dyn MeshObserver>> = None;
    while let Some(notify) = rx.recv().await {
        match notify {
            Notify::Observer(next) => observer = next,
            Notify::Event(notification) => match observer.as_ref().and_then(Weak::upgrade) {
                Some(observer) => notification.dispatch(observer.as_ref()),
                None => trace!(?notification, "No observer"),
            },
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
