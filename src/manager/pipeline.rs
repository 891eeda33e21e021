//! Synchronous coordinator of the four layers.
//!
//! [`Pipeline`] owns every layer and all pipeline state. It never blocks
//! and never calls the observer: outcomes are queued as
//! [`Notification`]s for the caller to dispatch once the mutation is over.
//! Time is passed in explicitly, so the same code runs under the tokio
//! actor and in plain unit tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::parameters::NetworkParameters;
use super::publication::PublicationSchedule;
use super::request::SendRequest;
use crate::access::{AccessLayer, AccessMessage, MeshMessage, MessageSecurity};
use crate::core::{
    Address, Bearer, ConfigError, MeshAddress, MeshError, MeshObserver, MessageHandle, PduType,
    TRANS_MIC_SIZE_SMALL, TTL_MAX, TTL_MIN_OUTBOUND, UNSEGMENTED_ACCESS_MAX_SIZE,
};
use crate::crypto::{KeyIndex, MicSize};
use crate::lower::{InboundAccessPdu, LowerEvent, LowerTransportLayer, OutboundAccessPdu, OutboundPdu};
use crate::network::{NetworkLayer, NetworkPdu, SecureNetworkBeacon};
use crate::proxy::ProxyConfigurationMessage;
use crate::store::{MeshNetwork, ModelId, SequenceStore};
use crate::upper;

/// An outcome waiting to be reported to the observer.
#[derive(Debug)]
pub enum Notification {
    /// A message for a local element was received.
    Received {
        /// Decoded message.
        message: AccessMessage,
        /// Source element.
        source: Address,
        /// Local destination.
        destination: MeshAddress,
    },
    /// A send completed.
    Sent {
        /// Handle of the send.
        handle: MessageHandle,
        /// The message.
        message: Arc<dyn MeshMessage>,
        /// Local source element.
        source: Address,
        /// Destination.
        destination: MeshAddress,
    },
    /// A send failed permanently.
    Failed {
        /// Handle of the send.
        handle: MessageHandle,
        /// The message.
        message: Arc<dyn MeshMessage>,
        /// Local source element.
        source: Address,
        /// Destination.
        destination: MeshAddress,
        /// Why.
        error: MeshError,
    },
    /// A proxy configuration message was received.
    ProxyConfiguration {
        /// Decoded message.
        message: ProxyConfigurationMessage,
        /// Proxy node that sent it.
        source: Address,
    },
    /// An authenticated secure network beacon was received.
    Beacon(SecureNetworkBeacon),
}

impl Notification {
    /// Call the matching observer method.
    pub fn dispatch(&self, observer: &dyn MeshObserver) {
        match self {
            Notification::Received {
                message,
                source,
                destination,
            } => observer.did_receive_message(message, *source, *destination),
            Notification::Sent {
                message,
                source,
                destination,
                ..
            } => observer.did_send_message(message.as_ref(), *source, *destination),
            Notification::Failed {
                message,
                source,
                destination,
                error,
                ..
            } => observer.failed_to_send_message(message.as_ref(), *source, *destination, error),
            Notification::ProxyConfiguration { message, source } => {
                observer.did_receive_proxy_configuration(message, *source)
            }
            Notification::Beacon(beacon) => observer.did_receive_beacon(beacon),
        }
    }
}

/// Whose device key protects a device-key message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKeyOwner {
    /// The destination node: configuration requests.
    Destination,
    /// The local node: replies to configuration requests.
    Source,
}

#[derive(Debug)]
struct PendingSend {
    message: Arc<dyn MeshMessage>,
    src: Address,
    dst: MeshAddress,
}

/// The four layers wired together.
pub struct Pipeline {
    network: Arc<MeshNetwork>,
    bearer: Arc<dyn Bearer>,
    params: NetworkParameters,
    network_layer: NetworkLayer,
    lower: LowerTransportLayer,
    access: AccessLayer,
    publications: PublicationSchedule,
    pending: HashMap<MessageHandle, PendingSend>,
    notifications: Vec<Notification>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("local_address", &self.network.local_address())
            .field("pending", &self.pending.len())
            .field("notifications", &self.notifications.len())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build a pipeline for `network`, sending through `bearer`.
    pub fn new(
        network: Arc<MeshNetwork>,
        bearer: Arc<dyn Bearer>,
        params: NetworkParameters,
        store: Box<dyn SequenceStore>,
    ) -> Self {
        let params = params.clamped();
        Self {
            network,
            bearer,
            network_layer: NetworkLayer::new(store, params.replay_cache_capacity),
            lower: LowerTransportLayer::new(params.clone()),
            access: AccessLayer::new(params.acknowledgment_message_timeout),
            publications: PublicationSchedule::new(),
            pending: HashMap::new(),
            notifications: Vec::new(),
            params,
        }
    }

    /// The configuration sends and receptions resolve against.
    pub fn network(&self) -> &Arc<MeshNetwork> {
        &self.network
    }

    /// Replace the configuration, e.g. after a key refresh or IV update.
    pub fn set_network(&mut self, network: Arc<MeshNetwork>) {
        self.network = network;
    }

    /// Effective (clamped) parameters.
    pub fn parameters(&self) -> &NetworkParameters {
        &self.params
    }

    /// Replace the parameters. They are clamped first.
    pub fn set_parameters(&mut self, params: NetworkParameters) {
        let params = params.clamped();
        self.lower.set_parameters(params.clone());
        self.access.set_timeout(params.acknowledgment_message_timeout);
        self.params = params;
    }

    /// Sends not yet completed, failed or cancelled.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Active inbound reassembly sessions.
    pub fn reassembly_sessions(&self) -> usize {
        self.lower.session_count()
    }

    /// Take the queued notifications, in the order they were produced.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Earliest deadline of any layer's timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.lower.next_deadline(),
            self.access.next_deadline(),
            self.publications.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Send a message. The outcome is reported through the notifications.
    pub fn send(&mut self, handle: MessageHandle, request: SendRequest, now: Instant) {
        self.dispatch(handle, request, DeviceKeyOwner::Destination, now);
    }

    /// Reply to a message received from `origin` on the local element
    /// `destination`. Device-key replies use the local device key.
    pub fn reply(
        &mut self,
        handle: MessageHandle,
        origin: Address,
        destination: Address,
        message: Arc<dyn MeshMessage>,
        application_key: Option<KeyIndex>,
        now: Instant,
    ) {
        let mut request = SendRequest::from_shared(message, MeshAddress::new(origin)).from_element(destination);
        request.application_key = application_key;
        self.dispatch(handle, request, DeviceKeyOwner::Source, now);
    }

    /// Publish a message from a local model using its publication settings.
    ///
    /// Unacknowledged messages are retransmitted per the model's policy.
    pub fn publish(
        &mut self,
        handle: MessageHandle,
        message: Arc<dyn MeshMessage>,
        element: Address,
        model: ModelId,
        now: Instant,
    ) {
        let publish = match self.network.publication(element, model) {
            Ok(publish) => publish.clone(),
            Err(err) => {
                self.report_failure(handle, message, element, MeshAddress::new(Address::UNASSIGNED), err.into());
                return;
            }
        };

        let ttl = publish.ttl.unwrap_or_else(|| self.network.default_ttl());
        let request = SendRequest::from_shared(message, publish.address)
            .from_element(element)
            .with_application_key(publish.app_key_index)
            .with_ttl(ttl);
        let acknowledged = request.message.is_acknowledged();

        if self.dispatch(handle, request.clone(), DeviceKeyOwner::Destination, now) && !acknowledged {
            self.publications.schedule(handle, request, publish.retransmit, now);
        }
    }

    /// Stop a send: segment retransmissions, the response timeout and any
    /// publication retransmissions. Returns `false` if nothing was active.
    pub fn cancel(&mut self, handle: MessageHandle) -> bool {
        let lower = self.lower.cancel(handle);
        let publication = self.publications.cancel(handle);
        self.access.resolve(handle);

        match self.pending.remove(&handle) {
            Some(send) => {
                debug!(%handle, "Send cancelled");
                self.notifications.push(Notification::Failed {
                    handle,
                    message: send.message,
                    source: send.src,
                    destination: send.dst,
                    error: MeshError::Cancelled,
                });
                true
            }
            None => lower || publication,
        }
    }

    /// Encrypt and send a proxy configuration message.
    pub fn send_proxy_configuration(&mut self, message: &ProxyConfigurationMessage) -> Result<(), MeshError> {
        let bytes = self
            .network_layer
            .encode_proxy_configuration(&self.network, &message.encode())?;
        self.bearer.send(&bytes, PduType::ProxyConfiguration)?;
        debug!(opcode = message.opcode(), "Proxy configuration sent");
        Ok(())
    }

    /// Process a PDU delivered by the bearer.
    pub fn handle_incoming(&mut self, data: &[u8], pdu_type: PduType, now: Instant) {
        match pdu_type {
            PduType::NetworkPdu => self.receive_network_pdu(data, now),
            PduType::MeshBeacon => match SecureNetworkBeacon::decode(data, &self.network) {
                Ok(beacon) => {
                    trace!(iv_index = beacon.iv_index, "Secure network beacon");
                    self.notifications.push(Notification::Beacon(beacon));
                }
                Err(err) => log_drop(&err, "beacon"),
            },
            PduType::ProxyConfiguration => self.receive_proxy_configuration(data),
            PduType::ProvisioningPdu => trace!("Provisioning PDU ignored"),
        }
    }

    /// Fire every timer due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        let events = self.lower.poll_timers(now);
        self.process(events);

        for (handle, _) in self.access.poll_timers(now) {
            self.lower.cancel(handle);
            self.fail(handle, MeshError::AcknowledgmentTimeout);
        }

        for (handle, request) in self.publications.poll_timers(now) {
            self.dispatch(handle, request, DeviceKeyOwner::Destination, now);
        }
    }

    fn dispatch(&mut self, handle: MessageHandle, request: SendRequest, owner: DeviceKeyOwner, now: Instant) -> bool {
        match self.start_send(handle, &request, owner, now) {
            Ok(()) => true,
            Err(err) => {
                self.publications.cancel(handle);
                let src = request.source.unwrap_or_else(|| self.network.local_address());
                self.report_failure(handle, request.message, src, request.destination, err);
                false
            }
        }
    }

    fn start_send(
        &mut self,
        handle: MessageHandle,
        request: &SendRequest,
        owner: DeviceKeyOwner,
        now: Instant,
    ) -> Result<(), MeshError> {
        let network = Arc::clone(&self.network);
        let message = &request.message;

        let src = request.source.unwrap_or_else(|| network.local_address());
        if !network.is_local_element(src) {
            return Err(ConfigError::ElementNotLocal(src).into());
        }
        let dst = request.destination;
        if !dst.address().is_assigned() {
            return Err(ConfigError::InvalidDestination(dst.address()).into());
        }
        let ttl = request
            .ttl
            .unwrap_or(self.params.default_ttl)
            .clamp(TTL_MIN_OUTBOUND, TTL_MAX);

        let segmented =
            message.is_segmented() || message.access_pdu().len() + TRANS_MIC_SIZE_SMALL > UNSEGMENTED_ACCESS_MAX_SIZE;
        let aszmic = segmented && message.security() == MessageSecurity::High;
        let mic = if aszmic { MicSize::Large } else { MicSize::Small };
        let access_pdu = self
            .access
            .encode(message.as_ref(), src, dst.address(), request.retransmit, mic)?;

        let keys = if message.uses_device_key() {
            let node = match owner {
                DeviceKeyOwner::Destination => dst.address(),
                DeviceKeyOwner::Source => src,
            };
            network.device_key_set(node, aszmic)?
        } else {
            let index = request.application_key.unwrap_or(KeyIndex::PRIMARY);
            network.application_key_set(index, aszmic)?
        };

        let seq = self.network_layer.next_sequence(src)?;
        let iv_index = network.iv_index().transmit_index();
        let upper_pdu = upper::encrypt(&access_pdu, &keys, seq, src, &dst, iv_index)?;

        let events = self.lower.send(
            OutboundAccessPdu {
                handle,
                src,
                dst: dst.address(),
                ttl,
                network_key_index: keys.network_key_index,
                seq,
                akf: keys.access_key.akf(),
                aid: keys.access_key.aid(),
                szmic: aszmic,
                segmented,
                upper_pdu,
            },
            now,
        )?;

        debug!(
            %handle,
            %src,
            %dst,
            opcode = %message.opcode(),
            seq,
            segmented,
            retransmit = request.retransmit,
            "Sending message"
        );
        self.pending.insert(
            handle,
            PendingSend {
                message: Arc::clone(message),
                src,
                dst,
            },
        );
        self.access.track(handle, message.as_ref(), src, dst, now);
        self.process(events);
        Ok(())
    }

    fn process(&mut self, events: Vec<LowerEvent>) {
        for event in events {
            match event {
                LowerEvent::Transmit(pdu) => self.transmit(pdu),
                LowerEvent::Deliver(pdu) => self.deliver(pdu),
                LowerEvent::Control {
                    src, dst, opcode, ..
                } => {
                    debug!(%src, %dst, opcode, "Ignoring transport control message");
                }
                LowerEvent::SendCompleted(handle) => self.complete(handle),
                LowerEvent::SendFailed(handle, err) => self.fail(handle, err),
            }
        }
    }

    fn transmit(&mut self, pdu: OutboundPdu) {
        if let Some(handle) = pdu.handle {
            if !self.pending.contains_key(&handle) {
                trace!(%handle, "Skipping PDU of a finished send");
                return;
            }
        }
        if let Err(err) = self.try_transmit(&pdu) {
            match pdu.handle {
                Some(handle) => {
                    self.lower.cancel(handle);
                    self.fail(handle, err);
                }
                None => warn!(%err, dst = %pdu.dst, "Failed to send transport control message"),
            }
        }
    }

    fn try_transmit(&mut self, pdu: &OutboundPdu) -> Result<(), MeshError> {
        let seq = match pdu.sequence {
            Some(seq) => seq,
            None => self.network_layer.next_sequence(pdu.src)?,
        };
        let net_key = self.network.network_key(pdu.network_key_index)?;
        let network_pdu = NetworkPdu {
            ctl: pdu.ctl,
            ttl: pdu.ttl,
            seq,
            src: pdu.src,
            dst: pdu.dst,
            transport_pdu: pdu.transport_pdu.clone(),
        };
        let bytes = self
            .network_layer
            .encode(&self.network, net_key.transmit_material(), &network_pdu)?;
        self.bearer.send(&bytes, PduType::NetworkPdu)?;
        Ok(())
    }

    fn deliver(&mut self, pdu: InboundAccessPdu) {
        let decrypted = match upper::decrypt(&pdu, &self.network) {
            Ok(decrypted) => decrypted,
            Err(err) => return log_drop(&err, "upper transport PDU"),
        };
        let message = match AccessMessage::decode(&decrypted.access_pdu) {
            Ok(message) => message,
            Err(err) => return log_drop(&err.into(), "access PDU"),
        };

        let opcode = message.opcode();
        if let Some((handle, _)) = self.access.on_response(decrypted.src, decrypted.dst.address(), opcode) {
            let still_sending = self.lower.cancel(handle);
            if let Some(send) = self.pending.remove(&handle) {
                if still_sending {
                    self.notifications.push(Notification::Sent {
                        handle,
                        message: send.message,
                        source: send.src,
                        destination: send.dst,
                    });
                }
            }
        }

        debug!(src = %decrypted.src, dst = %decrypted.dst, %opcode, "Message received");
        self.notifications.push(Notification::Received {
            message,
            source: decrypted.src,
            destination: decrypted.dst,
        });
    }

    fn complete(&mut self, handle: MessageHandle) {
        let Some(send) = self.pending.get(&handle) else {
            return;
        };
        self.notifications.push(Notification::Sent {
            handle,
            message: Arc::clone(&send.message),
            source: send.src,
            destination: send.dst,
        });
        if !self.access.is_outstanding(handle) {
            self.pending.remove(&handle);
        }
    }

    fn fail(&mut self, handle: MessageHandle, error: MeshError) {
        self.access.resolve(handle);
        self.publications.cancel(handle);
        if let Some(send) = self.pending.remove(&handle) {
            self.report_failure(handle, send.message, send.src, send.dst, error);
        }
    }

    fn report_failure(
        &mut self,
        handle: MessageHandle,
        message: Arc<dyn MeshMessage>,
        source: Address,
        destination: MeshAddress,
        error: MeshError,
    ) {
        warn!(%handle, %source, %destination, %error, "Send failed");
        self.notifications.push(Notification::Failed {
            handle,
            message,
            source,
            destination,
            error,
        });
    }

    fn receive_network_pdu(&mut self, data: &[u8], now: Instant) {
        let received = match self.network_layer.decode(&self.network, data) {
            Ok(received) => received,
            Err(err) => return log_drop(&err, "network PDU"),
        };
        if !self.network.is_local_destination(received.pdu.dst) {
            trace!(dst = %received.pdu.dst, "Not for a local element");
            return;
        }
        match self.lower.receive(&received, now) {
            Ok(events) => self.process(events),
            Err(err) => log_drop(&err, "lower transport PDU"),
        }
    }

    fn receive_proxy_configuration(&mut self, data: &[u8]) {
        let received = match self.network_layer.decode_proxy_configuration(&self.network, data) {
            Ok(received) => received,
            Err(err) => return log_drop(&err, "proxy configuration PDU"),
        };
        match ProxyConfigurationMessage::decode(&received.pdu.transport_pdu) {
            Ok(message) => {
                debug!(src = %received.pdu.src, opcode = message.opcode(), "Proxy configuration received");
                self.notifications.push(Notification::ProxyConfiguration {
                    message,
                    source: received.pdu.src,
                });
            }
            Err(err) => log_drop(&err.into(), "proxy configuration message"),
        }
    }
}

fn log_drop(err: &MeshError, what: &str) {
    if err.is_silent_drop() {
        trace!(%err, "Dropping {}", what);
    } else {
        debug!(%err, "Dropping {}", what);
    }
}
