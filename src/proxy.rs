//! Distributed-object proxy registry.
//!
//! Proxies are local handles to cluster-wide objects (a named map, a named
//! lock). They are created through the owning service's
//! [`RemoteService`](crate::service::RemoteService) capability and cached
//! per (service, name). A joining member receives a post-join operation
//! listing every proxy so it can recreate them; destroying a proxy is
//! announced to every member.

use crate::cluster::{Address, ClusterView};
use crate::codec::{from_payload, to_payload};
use crate::error::{EngineError, Result};
use crate::operation::{Operation, Response};
use crate::retry::RetryChannel;
use crate::service::{OperationContext, PostJoinAware, RunOutcome, Service, ServiceManager};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Registry name of the proxy service.
pub const PROXY_SERVICE_NAME: &str = "node:proxy";

/// A local handle to a cluster-wide object.
pub trait DistributedObject: Send + Sync {
    fn service_name(&self) -> &str;

    fn name(&self) -> &str;
}

/// Identifies a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub service_name: String,
    pub object_name: String,
}

impl ProxyInfo {
    pub fn new(service_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            object_name: object_name.into(),
        }
    }
}

pub struct ProxyService {
    this_address: Address,
    cluster: Arc<dyn ClusterView>,
    retry: Arc<RetryChannel>,
    services: Weak<ServiceManager>,
    proxies: DashMap<ProxyInfo, Arc<dyn DistributedObject>>,
}

impl ProxyService {
    pub fn new(
        this_address: Address,
        cluster: Arc<dyn ClusterView>,
        retry: Arc<RetryChannel>,
        services: Weak<ServiceManager>,
    ) -> Self {
        Self {
            this_address,
            cluster,
            retry,
            services,
            proxies: DashMap::new(),
        }
    }

    /// Return the cached proxy or create it through its service.
    pub fn get_or_create_proxy(
        &self,
        service_name: &str,
        object_name: &str,
    ) -> Result<Arc<dyn DistributedObject>> {
        let info = ProxyInfo::new(service_name, object_name);
        if let Some(existing) = self.proxies.get(&info) {
            return Ok(Arc::clone(existing.value()));
        }

        let services = self.services.upgrade().ok_or(EngineError::Shutdown)?;
        let service = services
            .get(service_name)
            .ok_or_else(|| EngineError::UnknownService(service_name.to_string()))?;
        let remote = service.remote().ok_or_else(|| {
            EngineError::Service(format!("service '{service_name}' has no distributed objects"))
        })?;
        let created = remote.create_distributed_object(object_name);

        let proxy = self.proxies.entry(info).or_insert(created).clone();
        debug!(service = %service_name, object = %object_name, "Proxy ready");
        Ok(proxy)
    }

    /// Destroy a proxy and its object, here and on every other member.
    pub fn destroy_proxy(&self, service_name: &str, object_name: &str) -> bool {
        let info = ProxyInfo::new(service_name, object_name);
        let existed = self.destroy_local(&info);

        match to_payload(&info) {
            Ok(payload) => {
                let op = Operation::new(PROXY_SERVICE_NAME, "destroy").with_payload(payload);
                for member in self.cluster.members() {
                    if member != self.this_address {
                        self.retry.send_operation(&op, &member);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode proxy destroy"),
        }
        existed
    }

    fn destroy_local(&self, info: &ProxyInfo) -> bool {
        let existed = self.proxies.remove(info).is_some();
        if let Some(service) = self.services.upgrade().and_then(|s| s.get(&info.service_name)) {
            if let Some(remote) = service.remote() {
                remote.destroy_distributed_object(&info.object_name);
            }
        }
        existed
    }

    /// Known proxies, sorted.
    pub fn proxies(&self) -> Vec<ProxyInfo> {
        let mut infos: Vec<ProxyInfo> = self.proxies.iter().map(|e| e.key().clone()).collect();
        infos.sort();
        infos
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Drop every proxy without destroying the objects behind them.
    pub fn close(&self) {
        let count = self.proxies.len();
        self.proxies.clear();
        info!(count, "Proxies released");
    }
}

impl Service for ProxyService {
    fn name(&self) -> &str {
        PROXY_SERVICE_NAME
    }

    fn run(&self, _ctx: &mut OperationContext<'_>, op: &Operation) -> Result<RunOutcome> {
        match op.name.as_str() {
            "create" => {
                let infos: Vec<ProxyInfo> = from_payload(&op.payload)?;
                for info in infos {
                    if let Err(e) = self.get_or_create_proxy(&info.service_name, &info.object_name) {
                        warn!(
                            service = %info.service_name,
                            object = %info.object_name,
                            error = %e,
                            "Could not recreate proxy"
                        );
                    }
                }
                Ok(RunOutcome::Respond(Response::Ack))
            }
            "destroy" => {
                let info: ProxyInfo = from_payload(&op.payload)?;
                self.destroy_local(&info);
                Ok(RunOutcome::Respond(Response::Ack))
            }
            other => Err(EngineError::Service(format!(
                "unknown proxy operation '{other}'"
            ))),
        }
    }

    fn post_join(&self) -> Option<&dyn PostJoinAware> {
        Some(self)
    }
}

impl PostJoinAware for ProxyService {
    fn post_join_operation(&self) -> Option<Operation> {
        let infos = self.proxies();
        if infos.is_empty() {
            return None;
        }
        match to_payload(&infos) {
            Ok(payload) => Some(Operation::new(PROXY_SERVICE_NAME, "create").with_payload(payload)),
            Err(e) => {
                warn!(error = %e, "Failed to encode proxy post-join operation");
                None
            }
        }
    }
}
