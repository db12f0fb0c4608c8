// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event subsystem: listener registrations and event delivery.
//!
//! A listener registration is (id, service, topic, subscriber address). The
//! registering member keeps the listener object; every other member only
//! knows the registration, learned through a `register` operation broadcast
//! on creation and through the event service's post-join operation when it
//! joins later.
//!
//! Publishing looks up registrations for (service, topic): local ones are
//! delivered inline, remote ones go out as `HEADER_EVENT` packets through the
//! retry channel, addressed to the registration id.
//!
//! # Registration Flow
//!
//! ```text
//!  member A                                   member B
//!  register_listener("topic", "news", l)
//!    ├─ store registration + listener
//!    └─ "register" op ─────────────────────►  store registration
//!                                             publish("topic", "news", e)
//!  handle_event_packet  ◄──── HEADER_EVENT ─── └─ subscriber is A: send packet
//!    └─ listener.on_event(e)
//! ```

use crate::cluster::{Address, ClusterView};
use crate::codec::{from_payload, to_payload};
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::operation::{Operation, Response};
use crate::packet::Packet;
use crate::retry::RetryChannel;
use crate::service::{OperationContext, PostJoinAware, RunOutcome, Service};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Registry name of the event service.
pub const EVENT_SERVICE_NAME: &str = "node:event";

/// A listener subscription known cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub service_name: String,
    pub topic: String,
    pub subscriber: Address,
}

/// An event as delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub service_name: String,
    pub topic: String,
    pub payload: Vec<u8>,
    /// Member that published it.
    pub publisher: Address,
}

/// Wire form of an event packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventEnvelope {
    registration_id: String,
    event: Event,
}

/// Receives events for one registration.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

pub struct EventService {
    this_address: Address,
    cluster: Arc<dyn ClusterView>,
    retry: Arc<RetryChannel>,
    registrations: DashMap<String, Registration>,
    listeners: DashMap<String, Arc<dyn EventListener>>,
}

impl EventService {
    pub fn new(this_address: Address, cluster: Arc<dyn ClusterView>, retry: Arc<RetryChannel>) -> Self {
        Self {
            this_address,
            cluster,
            retry,
            registrations: DashMap::new(),
            listeners: DashMap::new(),
        }
    }

    /// Register a local listener and announce it to every member.
    ///
    /// Returns the registration id.
    pub fn register_listener(
        &self,
        service_name: &str,
        topic: &str,
        listener: Arc<dyn EventListener>,
    ) -> String {
        let registration = Registration {
            id: uuid::Uuid::new_v4().to_string(),
            service_name: service_name.to_string(),
            topic: topic.to_string(),
            subscriber: self.this_address.clone(),
        };
        let id = registration.id.clone();
        self.listeners.insert(id.clone(), listener);
        self.registrations.insert(id.clone(), registration.clone());
        debug!(registration_id = %id, service = %service_name, topic = %topic, "Listener registered");

        self.broadcast("register", &registration);
        id
    }

    /// Remove a local listener and announce the removal.
    pub fn deregister_listener(&self, registration_id: &str) -> bool {
        let removed = self.registrations.remove(registration_id).is_some();
        self.listeners.remove(registration_id);
        if removed {
            self.broadcast("deregister", &registration_id.to_string());
        }
        removed
    }

    /// Registrations for (service, topic), sorted by id.
    pub fn registrations(&self, service_name: &str, topic: &str) -> Vec<Registration> {
        let mut matching: Vec<Registration> = self
            .registrations
            .iter()
            .filter(|r| r.service_name == service_name && r.topic == topic)
            .map(|r| r.value().clone())
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    /// Publish an event to every registration of (service, topic).
    ///
    /// Returns how many registrations it was delivered or sent to.
    pub fn publish(&self, service_name: &str, topic: &str, payload: Vec<u8>) -> usize {
        let event = Event {
            service_name: service_name.to_string(),
            topic: topic.to_string(),
            payload,
            publisher: self.this_address.clone(),
        };
        let mut delivered = 0;
        for registration in self.registrations(service_name, topic) {
            if registration.subscriber == self.this_address {
                if self.deliver_local(&registration.id, &event) {
                    delivered += 1;
                }
                metrics::record_event_published(service_name, true);
                continue;
            }

            let envelope = EventEnvelope {
                registration_id: registration.id.clone(),
                event: event.clone(),
            };
            match to_payload(&envelope) {
                Ok(bytes) => {
                    if self
                        .retry
                        .send(Packet::event(bytes), &registration.subscriber)
                        .accepted()
                    {
                        delivered += 1;
                    }
                    metrics::record_event_published(service_name, false);
                }
                Err(e) => warn!(error = %e, "Failed to encode event"),
            }
        }
        trace!(service = %service_name, topic = %topic, delivered, "Event published");
        delivered
    }

    /// Deliver an inbound event packet to its listener.
    pub fn handle_event_packet(&self, packet: &Packet) {
        let envelope: EventEnvelope = match from_payload(packet.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Discarding undecodable event packet");
                metrics::record_protocol_violation("event_decode");
                return;
            }
        };
        if !self.deliver_local(&envelope.registration_id, &envelope.event) {
            debug!(
                registration_id = %envelope.registration_id,
                "No listener for event, dropping"
            );
        }
    }

    fn deliver_local(&self, registration_id: &str, event: &Event) -> bool {
        let listener = self
            .listeners
            .get(registration_id)
            .map(|l| Arc::clone(l.value()));
        match listener {
            Some(listener) => {
                listener.on_event(event);
                true
            }
            None => false,
        }
    }

    /// Drop the registrations of a departed member.
    pub fn on_member_left(&self, address: &Address) {
        let before = self.registrations.len();
        self.registrations.retain(|_, r| &r.subscriber != address);
        let dropped = before - self.registrations.len();
        if dropped > 0 {
            info!(member = %address, dropped, "Dropped registrations of departed member");
        }
    }

    /// Drop every registration and listener.
    pub fn close(&self) {
        let count = self.registrations.len();
        self.registrations.clear();
        self.listeners.clear();
        info!(count, "Event registrations cleared");
    }

    fn local_registrations(&self) -> Vec<Registration> {
        let mut local: Vec<Registration> = self
            .registrations
            .iter()
            .filter(|r| r.subscriber == self.this_address)
            .map(|r| r.value().clone())
            .collect();
        local.sort_by(|a, b| a.id.cmp(&b.id));
        local
    }

    fn broadcast<T: Serialize>(&self, name: &str, payload: &T) {
        let payload = match to_payload(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(operation = %name, error = %e, "Failed to encode event registration");
                return;
            }
        };
        let op = Operation::new(EVENT_SERVICE_NAME, name).with_payload(payload);
        for member in self.cluster.members() {
            if member != self.this_address {
                self.retry.send_operation(&op, &member);
            }
        }
    }

    fn store_remote(&self, registration: Registration) {
        if registration.subscriber == self.this_address {
            return;
        }
        self.registrations.insert(registration.id.clone(), registration);
    }
}

impl Service for EventService {
    fn name(&self) -> &str {
        EVENT_SERVICE_NAME
    }

    fn run(&self, _ctx: &mut OperationContext<'_>, op: &Operation) -> Result<RunOutcome> {
        match op.name.as_str() {
            "register" => {
                let registration: Registration = from_payload(&op.payload)?;
                self.store_remote(registration);
            }
            "deregister" => {
                let id: String = from_payload(&op.payload)?;
                self.registrations.remove(&id);
            }
            "sync" => {
                let registrations: Vec<Registration> = from_payload(&op.payload)?;
                for registration in registrations {
                    self.store_remote(registration);
                }
            }
            other => {
                return Err(EngineError::Service(format!(
                    "unknown event operation '{other}'"
                )))
            }
        }
        Ok(RunOutcome::Respond(Response::Ack))
    }

    fn post_join(&self) -> Option<&dyn PostJoinAware> {
        Some(self)
    }
}

impl PostJoinAware for EventService {
    fn post_join_operation(&self) -> Option<Operation> {
        let local = self.local_registrations();
        if local.is_empty() {
            return None;
        }
        match to_payload(&local) {
            Ok(payload) => Some(Operation::new(EVENT_SERVICE_NAME, "sync").with_payload(payload)),
            Err(e) => {
                warn!(error = %e, "Failed to encode event post-join operation");
                None
            }
        }
    }
}
