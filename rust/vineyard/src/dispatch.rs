//! Request dispatch on a bounded worker pool.
//!
//! Service methods are plain synchronous code and may block, so they run on
//! tokio's blocking pool, never on a connection's I/O task. A semaphore caps
//! how many run at once. The server takes a permit with [`Dispatcher::reserve`]
//! before it accepts a request for execution, so a connection stops reading
//! while every worker is busy instead of queueing tasks without bound.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use vineyard_wire::{ErrorKind, RemoteError, RequestMessage, Response, ResponseMessage};

use crate::ServiceRegistry;
use crate::registry::panic_message;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, max_concurrent: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free worker. `None` once the dispatcher is closed.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Dispatch one request and build its reply, waiting for a worker first.
    ///
    /// Always yields a response carrying the request's opaque and
    /// serializer type; every failure is an error response.
    pub async fn dispatch(&self, message: RequestMessage) -> ResponseMessage {
        match self.reserve().await {
            Some(permit) => self.run(permit, message).await,
            None => failure(&message, "dispatcher closed".to_string()),
        }
    }

    /// Dispatch one request on a worker already reserved. The permit is
    /// released when the service method returns.
    pub async fn run(&self, permit: OwnedSemaphorePermit, message: RequestMessage) -> ResponseMessage {
        let opaque = message.request.opaque;
        let header = message.header;

        let registry = Arc::clone(&self.registry);
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let outcome = registry.invoke(&message.request);
            (message, outcome)
        });

        match task.await {
            Ok((message, outcome)) => {
                if let Err(e) = &outcome {
                    tracing::debug!(
                        opaque,
                        bean = %message.request.bean_name,
                        method = %message.request.method_name,
                        kind = %e.kind,
                        "dispatch failed: {}",
                        e.message
                    );
                }
                ResponseMessage::reply_to(&message, outcome)
            }
            // The registry catches service panics, so this is runtime
            // shutdown or a panic while dropping arguments.
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    panic_message(join_err.into_panic().as_ref())
                } else {
                    "worker cancelled".to_string()
                };
                tracing::warn!(opaque, %reason, "dispatch worker failed");
                ResponseMessage::new(
                    header.magic,
                    header.serializer_type,
                    Response::failure(opaque, RemoteError::new(ErrorKind::ServiceInvocation, reason)),
                )
            }
        }
    }
}

fn failure(message: &RequestMessage, reason: String) -> ResponseMessage {
    ResponseMessage::reply_to(
        message,
        Err(RemoteError::new(ErrorKind::ServiceInvocation, reason)),
    )
}
