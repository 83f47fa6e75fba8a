use super::{Envelope, ProtocolError, Request, Result, ServiceKey};
use crate::transport::{Inbox, MessagePort};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service key this client speaks as. Appears in timeout errors.
    pub caller: ServiceKey,
    /// How long `invoke` waits for a matching response.
    pub invoke_timeout: Duration,
}

impl ClientConfig {
    pub const DATABASE_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Defaults for a given context: the database context waits longer
    /// because device batches can be large.
    pub fn for_caller(caller: ServiceKey) -> Self {
        let invoke_timeout = match caller {
            ServiceKey::Database => Self::DATABASE_TIMEOUT,
            _ => Self::DEFAULT_TIMEOUT,
        };
        Self {
            caller,
            invoke_timeout,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::for_caller(ServiceKey::Database)
    }
}

/// Calling side of the protocol.
///
/// Each `invoke` registers a one-shot callback under a fresh message id.
/// A response arriving after the timeout finds no callback and is dropped.
pub struct ServiceClient {
    config: ClientConfig,
    port: Arc<dyn MessagePort>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl ServiceClient {
    pub fn new(port: Arc<dyn MessagePort>, config: ClientConfig) -> Self {
        Self {
            config,
            port,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Envelope>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Send a request and wait for its response payload.
    pub async fn invoke(&self, request: Request) -> Result<Value> {
        let service = request.service();
        let (operation, payload) = request.into_parts()?;
        let message_id = Uuid::new_v4().to_string();

        let (tx, rx) = oneshot::channel();
        self.pending().insert(message_id.clone(), tx);

        let envelope = Envelope::request(service, operation, payload, message_id.clone());
        if let Err(e) = self.port.post(envelope).await {
            self.pending().remove(&message_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.invoke_timeout, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(message) => Err(ProtocolError::Remote {
                    operation: operation.to_string(),
                    message,
                }),
                None => Ok(response.payload),
            },
            Ok(Err(_)) => Err(ProtocolError::ChannelClosed),
            Err(_) => {
                self.pending().remove(&message_id);
                warn!("{} invoke timeout: {}/{}", self.config.caller, service, operation);
                Err(ProtocolError::Timeout {
                    caller: self.config.caller,
                    service,
                    operation: operation.to_string(),
                })
            }
        }
    }

    /// [`invoke`](Self::invoke) and decode the payload.
    pub async fn invoke_as<R: DeserializeOwned>(&self, request: Request) -> Result<R> {
        let operation = request.operation();
        let payload = self.invoke(request).await?;
        serde_json::from_value(payload)
            .map_err(|e| ProtocolError::InvalidPayload(format!("{}: {}", operation, e)))
    }

    /// Fire-and-forget: no message id, no response.
    pub async fn emit(&self, request: Request) -> Result<()> {
        let service = request.service();
        let (operation, payload) = request.into_parts()?;
        self.port
            .post(Envelope::event(service, operation, payload))
            .await?;
        Ok(())
    }

    /// Route a response to its waiting caller. Returns false when nobody is
    /// waiting (late or unknown response).
    pub fn handle_response(&self, envelope: Envelope) -> bool {
        let Some(message_id) = envelope.message_id.clone() else {
            debug!("Dropping response without message id: {}", envelope.operation);
            return false;
        };
        let Some(tx) = self.pending().remove(&message_id) else {
            debug!("Dropping late response for {}", message_id);
            return false;
        };
        tx.send(envelope).is_ok()
    }

    /// Spawn a task feeding responses from `inbox` into this client.
    pub fn listen(self: &Arc<Self>, mut inbox: Inbox) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if envelope.is_response() {
                    client.handle_response(envelope);
                } else {
                    debug!("Ignoring unsolicited {}/{}", envelope.service, envelope.operation);
                }
            }
        })
    }
}

/// Responding side of the protocol.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Value>;
}

/// Answer requests arriving on `inbox` until it closes.
///
/// Requests are handled one at a time, in arrival order. Events get no
/// response; handler errors on requests go back as error responses.
pub async fn serve<H: ServiceHandler + ?Sized>(
    handler: Arc<H>,
    port: Arc<dyn MessagePort>,
    mut inbox: Inbox,
) {
    while let Some(envelope) = inbox.recv().await {
        if envelope.is_response() {
            continue;
        }

        let result = match Request::from_envelope(&envelope) {
            Ok(request) => handler.handle(request).await,
            Err(e) => Err(e),
        };

        if envelope.message_id.is_none() {
            if let Err(e) = result {
                warn!("Failed to handle event {}: {}", envelope.operation, e);
            }
            continue;
        }

        let response = match result {
            Ok(payload) => envelope.respond(payload),
            Err(e) => {
                warn!("Failed to handle {}: {}", envelope.operation, e);
                envelope.respond_error(e.to_string())
            }
        };
        if let Err(e) = port.post(response).await {
            warn!("Failed to send response for {}: {}", envelope.operation, e);
            break;
        }
    }
}
