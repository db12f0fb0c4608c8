//! Callback-style invocations.
//!
//! [`AsyncInvocationService::invoke`] returns immediately and runs the
//! invocation on a spawned task, handing the outcome to a callback. A
//! bulkhead caps how many run at once; closing it on shutdown fails queued
//! callers with `Shutdown`.

use crate::cluster::Address;
use crate::dispatcher::OperationDispatcher;
use crate::error::{EngineError, Result};
use crate::operation::{Operation, Response};
use crate::resilience::Bulkhead;
use std::sync::Arc;
use tracing::{debug, info};

pub struct AsyncInvocationService {
    dispatcher: Arc<OperationDispatcher>,
    bulkhead: Arc<Bulkhead>,
}

impl AsyncInvocationService {
    pub fn new(dispatcher: Arc<OperationDispatcher>, max_concurrent: usize) -> Self {
        Self {
            dispatcher,
            bulkhead: Arc::new(Bulkhead::new(max_concurrent)),
        }
    }

    /// Invoke `op` in the background and pass the outcome to `callback`.
    ///
    /// With a `target` the operation runs there; without one, a
    /// partition-affine operation goes to its partition owner (with
    /// retries) and anything else runs on this member.
    pub fn invoke<F>(&self, op: Operation, target: Option<Address>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        if self.bulkhead.is_closed() {
            return Err(EngineError::Shutdown);
        }
        let dispatcher = Arc::clone(&self.dispatcher);
        let bulkhead = Arc::clone(&self.bulkhead);
        debug!(operation = %op, "Queueing async invocation");

        tokio::spawn(async move {
            let permit = match bulkhead.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    callback(Err(EngineError::Shutdown));
                    return;
                }
            };
            let result = match target {
                Some(target) => dispatcher.invoke(op, target).await,
                None if op.is_partition_aware() => dispatcher.invoke_on_partition(op).await,
                None => {
                    let here = dispatcher.this_address().clone();
                    dispatcher.invoke(op, here).await
                }
            };
            drop(permit);
            callback(result);
        });
        Ok(())
    }

    /// Invocations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.bulkhead.in_use()
    }

    pub fn shutdown(&self) {
        self.bulkhead.close();
        info!("Async invocation service stopped");
    }
}
