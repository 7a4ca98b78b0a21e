//! The protocol endpoint. One instance serves either role: a client
//! originates CONNECT/PUBLISH/SUBSCRIBE and consumes the acknowledgement
//! flow, a broker-side endpoint consumes those and originates
//! CONNACK/SUBACK and the rest. The endpoint owns the transport, the
//! delivery-state store behind the session mutex, the ordered write
//! queue, and the per-packet-type handlers the receive loop dispatches
//! into.

mod dispatch;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{MqttError, Result};
use crate::packet::{build, PacketType};
use crate::session::SessionState;
use crate::store::StoreEntry;
use crate::transport::Transport;
use crate::types::{
    AutoResponse, ConnectRequest, ConnectReturnCode, Decision, PublishEvent, QoS,
    SubscribeReturnCode, Will,
};
use crate::write_queue::{WriteCallback, WriteQueue};

#[derive(Default)]
pub(crate) struct Handlers {
    pub close: Option<Box<dyn FnMut() + Send>>,
    pub error: Option<Box<dyn FnMut(&MqttError) + Send>>,
    pub connect: Option<Box<dyn FnMut(ConnectRequest) -> Decision + Send>>,
    pub connack: Option<Box<dyn FnMut(bool, ConnectReturnCode) -> Decision + Send>>,
    pub publish: Option<Box<dyn FnMut(PublishEvent) -> Decision + Send>>,
    pub puback: Option<Box<dyn FnMut(u16) -> Decision + Send>>,
    pub pubrec: Option<Box<dyn FnMut(u16) -> Decision + Send>>,
    pub pubrel: Option<Box<dyn FnMut(u16) -> Decision + Send>>,
    pub pubcomp: Option<Box<dyn FnMut(u16) -> Decision + Send>>,
    pub pub_res_sent: Option<Box<dyn FnMut(u16) + Send>>,
    pub subscribe: Option<Box<dyn FnMut(u16, Vec<(String, QoS)>) -> Decision + Send>>,
    pub suback: Option<Box<dyn FnMut(u16, Vec<Option<QoS>>) -> Decision + Send>>,
    pub unsubscribe: Option<Box<dyn FnMut(u16, Vec<String>) -> Decision + Send>>,
    pub unsuback: Option<Box<dyn FnMut(u16) -> Decision + Send>>,
    pub pingreq: Option<Box<dyn FnMut() -> Decision + Send>>,
    pub pingresp: Option<Box<dyn FnMut() -> Decision + Send>>,
    pub disconnect: Option<Box<dyn FnMut() + Send>>,
}

pub struct Endpoint<T> {
    pub(crate) conn: T,
    pub(crate) connected: bool,
    clean_session: bool,
    client_id: String,
    user_name: Option<String>,
    password: Option<Vec<u8>>,
    will: Option<Will>,
    pub(crate) auto_pub_response: AutoResponse,
    pub(crate) session: Arc<Mutex<SessionState>>,
    /// Inbound QoS 2 packet ids already delivered upstream; duplicates
    /// are suppressed until PUBREL releases the id.
    pub(crate) qos2_received: BTreeSet<u16>,
    pub(crate) queue: WriteQueue,
    pub(crate) handlers: Handlers,
}

impl<T: Transport> Endpoint<T> {
    /// Wraps an established stream. The transport must already be
    /// connected to the peer; TCP/TLS dialing and accepting live outside
    /// the endpoint.
    pub fn new(conn: T) -> Self {
        Self {
            conn,
            connected: true,
            clean_session: false,
            client_id: String::new(),
            user_name: None,
            password: None,
            will: None,
            auto_pub_response: AutoResponse::default(),
            session: Arc::new(Mutex::new(SessionState::default())),
            qos2_received: BTreeSet::new(),
            queue: WriteQueue::default(),
            handlers: Handlers::default(),
        }
    }

    // --- connection parameters, set before connect() ---

    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        self.client_id = client_id.into();
    }

    pub fn set_clean_session(&mut self, clean_session: bool) {
        self.clean_session = clean_session;
    }

    pub fn set_user_name(&mut self, user_name: impl Into<String>) {
        self.user_name = Some(user_name.into());
    }

    pub fn set_password(&mut self, password: impl Into<Vec<u8>>) {
        self.password = Some(password.into());
    }

    pub fn set_will(&mut self, will: Will) {
        self.will = Some(will);
    }

    /// Controls whether PUBACK/PUBREC/PUBREL/PUBCOMP are synthesized by
    /// the dispatcher. Defaults to [`AutoResponse::Immediate`].
    pub fn set_auto_pub_response(&mut self, mode: AutoResponse) {
        self.auto_pub_response = mode;
    }

    // --- handler registration ---

    /// Called exactly once when the peer closes the stream cleanly.
    pub fn set_close_handler(&mut self, handler: impl FnMut() + Send + 'static) {
        self.handlers.close = Some(Box::new(handler));
    }

    /// Called exactly once when the session dies of anything that is not
    /// a clean close; the close handler does not run afterwards.
    pub fn set_error_handler(&mut self, handler: impl FnMut(&MqttError) + Send + 'static) {
        self.handlers.error = Some(Box::new(handler));
    }

    pub fn set_connect_handler(
        &mut self,
        handler: impl FnMut(ConnectRequest) -> Decision + Send + 'static,
    ) {
        self.handlers.connect = Some(Box::new(handler));
    }

    pub fn set_connack_handler(
        &mut self,
        handler: impl FnMut(bool, ConnectReturnCode) -> Decision + Send + 'static,
    ) {
        self.handlers.connack = Some(Box::new(handler));
    }

    pub fn set_publish_handler(
        &mut self,
        handler: impl FnMut(PublishEvent) -> Decision + Send + 'static,
    ) {
        self.handlers.publish = Some(Box::new(handler));
    }

    pub fn set_puback_handler(&mut self, handler: impl FnMut(u16) -> Decision + Send + 'static) {
        self.handlers.puback = Some(Box::new(handler));
    }

    pub fn set_pubrec_handler(&mut self, handler: impl FnMut(u16) -> Decision + Send + 'static) {
        self.handlers.pubrec = Some(Box::new(handler));
    }

    pub fn set_pubrel_handler(&mut self, handler: impl FnMut(u16) -> Decision + Send + 'static) {
        self.handlers.pubrel = Some(Box::new(handler));
    }

    pub fn set_pubcomp_handler(&mut self, handler: impl FnMut(u16) -> Decision + Send + 'static) {
        self.handlers.pubcomp = Some(Box::new(handler));
    }

    /// Called after a PUBACK or PUBCOMP this endpoint sent is on the
    /// wire, in both immediate and queued auto-response modes.
    pub fn set_pub_res_sent_handler(&mut self, handler: impl FnMut(u16) + Send + 'static) {
        self.handlers.pub_res_sent = Some(Box::new(handler));
    }

    pub fn set_subscribe_handler(
        &mut self,
        handler: impl FnMut(u16, Vec<(String, QoS)>) -> Decision + Send + 'static,
    ) {
        self.handlers.subscribe = Some(Box::new(handler));
    }

    pub fn set_suback_handler(
        &mut self,
        handler: impl FnMut(u16, Vec<Option<QoS>>) -> Decision + Send + 'static,
    ) {
        self.handlers.suback = Some(Box::new(handler));
    }

    pub fn set_unsubscribe_handler(
        &mut self,
        handler: impl FnMut(u16, Vec<String>) -> Decision + Send + 'static,
    ) {
        self.handlers.unsubscribe = Some(Box::new(handler));
    }

    pub fn set_unsuback_handler(&mut self, handler: impl FnMut(u16) -> Decision + Send + 'static) {
        self.handlers.unsuback = Some(Box::new(handler));
    }

    pub fn set_pingreq_handler(&mut self, handler: impl FnMut() -> Decision + Send + 'static) {
        self.handlers.pingreq = Some(Box::new(handler));
    }

    pub fn set_pingresp_handler(&mut self, handler: impl FnMut() -> Decision + Send + 'static) {
        self.handlers.pingresp = Some(Box::new(handler));
    }

    pub fn set_disconnect_handler(&mut self, handler: impl FnMut() + Send + 'static) {
        self.handlers.disconnect = Some(Box::new(handler));
    }

    // --- client actions ---

    /// Sends CONNECT built from the configured parameters.
    pub async fn connect(&mut self, keep_alive: u16) -> Result<()> {
        let bytes = build::connect(
            &self.client_id,
            self.clean_session,
            keep_alive,
            self.will.as_ref(),
            self.user_name.as_deref(),
            self.password.as_deref(),
        )?;
        debug!(client_id = %self.client_id, keep_alive, "sending CONNECT");
        self.write_now(&bytes).await
    }

    /// Publishes with an automatically acquired packet identifier.
    /// Returns the identifier, or zero for QoS 0.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u16> {
        let packet_id = if qos == QoS::AtMostOnce {
            0
        } else {
            self.session.lock().acquire_unique()?
        };
        self.send_publish(topic, qos, retain, false, packet_id, payload)
            .await?;
        Ok(packet_id)
    }

    pub async fn publish_at_most_once(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<()> {
        self.send_publish(topic, QoS::AtMostOnce, retain, false, 0, payload)
            .await
    }

    pub async fn publish_at_least_once(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<u16> {
        let packet_id = self.session.lock().acquire_unique()?;
        self.send_publish(topic, QoS::AtLeastOnce, retain, false, packet_id, payload)
            .await?;
        Ok(packet_id)
    }

    pub async fn publish_exactly_once(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<u16> {
        let packet_id = self.session.lock().acquire_unique()?;
        self.send_publish(topic, QoS::ExactlyOnce, retain, false, packet_id, payload)
            .await?;
        Ok(packet_id)
    }

    /// Publishes under a caller-supplied packet identifier. Returns
    /// false, without publishing, when the identifier is already in
    /// flight (or zero).
    pub async fn publish_with_id(
        &mut self,
        packet_id: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<bool> {
        if !self.session.lock().register(packet_id) {
            return Ok(false);
        }
        self.send_publish(topic, qos, retain, false, packet_id, payload)
            .await?;
        Ok(true)
    }

    /// Like [`publish_with_id`](Self::publish_with_id) with the DUP flag
    /// set, for caller-driven retransmission.
    pub async fn publish_dup(
        &mut self,
        packet_id: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<bool> {
        if !self.session.lock().register(packet_id) {
            return Ok(false);
        }
        self.send_publish(topic, qos, retain, true, packet_id, payload)
            .await?;
        Ok(true)
    }

    pub async fn subscribe(&mut self, entries: &[(&str, QoS)]) -> Result<u16> {
        let packet_id = self.session.lock().acquire_unique()?;
        let bytes = build::subscribe(packet_id, entries)?;
        self.write_now(&bytes).await?;
        Ok(packet_id)
    }

    pub async fn subscribe_with_id(
        &mut self,
        packet_id: u16,
        entries: &[(&str, QoS)],
    ) -> Result<bool> {
        if !self.session.lock().register(packet_id) {
            return Ok(false);
        }
        let bytes = build::subscribe(packet_id, entries)?;
        self.write_now(&bytes).await?;
        Ok(true)
    }

    pub async fn unsubscribe(&mut self, topics: &[&str]) -> Result<u16> {
        let packet_id = self.session.lock().acquire_unique()?;
        let bytes = build::unsubscribe(packet_id, topics)?;
        self.write_now(&bytes).await?;
        Ok(packet_id)
    }

    pub async fn unsubscribe_with_id(&mut self, packet_id: u16, topics: &[&str]) -> Result<bool> {
        if !self.session.lock().register(packet_id) {
            return Ok(false);
        }
        let bytes = build::unsubscribe(packet_id, topics)?;
        self.write_now(&bytes).await?;
        Ok(true)
    }

    pub async fn pingreq(&mut self) -> Result<()> {
        let bytes = build::pingreq()?;
        self.write_now(&bytes).await
    }

    /// Clean disconnect: sends DISCONNECT so the broker discards the
    /// will. The broker closes the stream afterwards.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let bytes = build::disconnect()?;
        self.write_now(&bytes).await
    }

    /// Tears the transport down without DISCONNECT; the broker will
    /// publish the will.
    pub async fn force_disconnect(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.conn.shutdown().await?;
        }
        Ok(())
    }

    // --- broker-side actions ---

    pub async fn connack(
        &mut self,
        session_present: bool,
        return_code: ConnectReturnCode,
    ) -> Result<()> {
        let bytes = build::connack(session_present, return_code)?;
        self.write_now(&bytes).await
    }

    pub async fn puback(&mut self, packet_id: u16) -> Result<()> {
        self.send_puback(packet_id).await
    }

    pub async fn pubrec(&mut self, packet_id: u16) -> Result<()> {
        self.send_pubrec(packet_id).await
    }

    pub async fn pubrel(&mut self, packet_id: u16) -> Result<()> {
        self.send_pubrel(packet_id).await
    }

    pub async fn pubcomp(&mut self, packet_id: u16) -> Result<()> {
        self.send_pubcomp(packet_id).await
    }

    pub async fn suback(
        &mut self,
        packet_id: u16,
        return_codes: &[SubscribeReturnCode],
    ) -> Result<()> {
        let bytes = build::suback(packet_id, return_codes)?;
        self.write_now(&bytes).await
    }

    pub async fn unsuback(&mut self, packet_id: u16) -> Result<()> {
        let bytes = build::unsuback(packet_id)?;
        self.write_now(&bytes).await
    }

    pub async fn pingresp(&mut self) -> Result<()> {
        let bytes = build::pingresp()?;
        self.write_now(&bytes).await
    }

    // --- queued flavors ---

    /// Enqueues CONNECT; `completion` fires once the bytes are written.
    pub fn queue_connect(
        &mut self,
        keep_alive: u16,
        completion: Option<WriteCallback>,
    ) -> Result<()> {
        let bytes = build::connect(
            &self.client_id,
            self.clean_session,
            keep_alive,
            self.will.as_ref(),
            self.user_name.as_deref(),
            self.password.as_deref(),
        )?;
        self.queue.push(bytes, completion);
        Ok(())
    }

    pub fn queue_connack(
        &mut self,
        session_present: bool,
        return_code: ConnectReturnCode,
        completion: Option<WriteCallback>,
    ) -> Result<()> {
        let bytes = build::connack(session_present, return_code)?;
        self.queue.push(bytes, completion);
        Ok(())
    }

    /// Enqueues a publish. The packet identifier is acquired and the
    /// delivery store updated immediately; the bytes leave on the next
    /// [`flush`](Self::flush).
    pub fn queue_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        completion: Option<WriteCallback>,
    ) -> Result<u16> {
        let packet_id = if qos == QoS::AtMostOnce {
            0
        } else {
            self.session.lock().acquire_unique()?
        };
        let bytes = build::publish(topic, qos, retain, false, packet_id, payload)?;
        self.store_outbound_publish(qos, packet_id, &bytes);
        self.queue.push(bytes, completion);
        Ok(packet_id)
    }

    pub fn queue_subscribe(
        &mut self,
        entries: &[(&str, QoS)],
        completion: Option<WriteCallback>,
    ) -> Result<u16> {
        let packet_id = self.session.lock().acquire_unique()?;
        let bytes = build::subscribe(packet_id, entries)?;
        self.queue.push(bytes, completion);
        Ok(packet_id)
    }

    pub fn queue_unsubscribe(
        &mut self,
        topics: &[&str],
        completion: Option<WriteCallback>,
    ) -> Result<u16> {
        let packet_id = self.session.lock().acquire_unique()?;
        let bytes = build::unsubscribe(packet_id, topics)?;
        self.queue.push(bytes, completion);
        Ok(packet_id)
    }

    pub fn queue_puback(&mut self, packet_id: u16, completion: Option<WriteCallback>) -> Result<()> {
        let bytes = build::puback(packet_id)?;
        self.queue.push_response(bytes, completion, packet_id);
        Ok(())
    }

    pub fn queue_pubrec(&mut self, packet_id: u16, completion: Option<WriteCallback>) -> Result<()> {
        let bytes = build::pubrec(packet_id)?;
        self.queue.push(bytes, completion);
        Ok(())
    }

    pub fn queue_pubrel(&mut self, packet_id: u16, completion: Option<WriteCallback>) -> Result<()> {
        let bytes = build::pubrel(packet_id)?;
        self.session
            .lock()
            .store
            .insert(StoreEntry::new(packet_id, PacketType::PubComp, bytes.to_vec()));
        self.queue.push(bytes, completion);
        Ok(())
    }

    pub fn queue_pubcomp(
        &mut self,
        packet_id: u16,
        completion: Option<WriteCallback>,
    ) -> Result<()> {
        let bytes = build::pubcomp(packet_id)?;
        self.queue.push_response(bytes, completion, packet_id);
        Ok(())
    }

    pub fn queue_suback(
        &mut self,
        packet_id: u16,
        return_codes: &[SubscribeReturnCode],
        completion: Option<WriteCallback>,
    ) -> Result<()> {
        let bytes = build::suback(packet_id, return_codes)?;
        self.queue.push(bytes, completion);
        Ok(())
    }

    pub fn queue_unsuback(
        &mut self,
        packet_id: u16,
        completion: Option<WriteCallback>,
    ) -> Result<()> {
        let bytes = build::unsuback(packet_id)?;
        self.queue.push(bytes, completion);
        Ok(())
    }

    pub fn queue_pingreq(&mut self, completion: Option<WriteCallback>) -> Result<()> {
        let bytes = build::pingreq()?;
        self.queue.push(bytes, completion);
        Ok(())
    }

    pub fn queue_pingresp(&mut self, completion: Option<WriteCallback>) -> Result<()> {
        let bytes = build::pingresp()?;
        self.queue.push(bytes, completion);
        Ok(())
    }

    pub fn queue_disconnect(&mut self, completion: Option<WriteCallback>) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let bytes = build::disconnect()?;
        self.queue.push(bytes, completion);
        Ok(())
    }

    /// Drains the write queue in enqueue order, then fires
    /// `pub_res_sent` for responses that reached the wire. The receive
    /// loop calls this after every dispatched packet; callers enqueueing
    /// outside the loop call it themselves.
    pub async fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let mut sent = Vec::new();
        let Self { queue, conn, .. } = &mut *self;
        let result = queue.drain(conn, &mut sent).await;
        for packet_id in sent {
            if let Some(handler) = self.handlers.pub_res_sent.as_mut() {
                handler(packet_id);
            }
        }
        if let Err(err) = result {
            self.connected = false;
            return Err(err);
        }
        Ok(())
    }

    /// Packets waiting in the write queue.
    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    // --- session control ---

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Marks the transport live again; pair with
    /// [`attach_transport`](Self::attach_transport) when reconnecting.
    pub fn mark_connected(&mut self) {
        self.connected = true;
    }

    /// Replaces the transport after a reconnect and marks the endpoint
    /// connected. Stored packets are replayed when the CONNACK for the
    /// resumed session arrives, not here.
    pub fn attach_transport(&mut self, conn: T) {
        self.conn = conn;
        self.connected = true;
    }

    /// Forgets a stored publish: removes every store entry under the
    /// identifier and releases it.
    pub fn clear_stored_publish(&mut self, packet_id: u16) {
        let mut state = self.session.lock();
        state.store.remove_all(packet_id);
        state.release(packet_id);
    }

    /// Visits the serialized bytes of every stored in-flight packet in
    /// send order. Callers persisting the session can write these out
    /// verbatim.
    pub fn for_each_stored(&self, mut f: impl FnMut(&[u8])) {
        let state = self.session.lock();
        for entry in state.store.iter() {
            f(entry.bytes());
        }
    }

    // --- internal senders shared by actions and the dispatcher ---

    pub(crate) async fn write_now(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(err) = self.conn.write_all(bytes).await {
            self.connected = false;
            return Err(err);
        }
        Ok(())
    }

    fn store_outbound_publish(&mut self, qos: QoS, packet_id: u16, bytes: &Bytes) {
        let expected = match qos {
            QoS::AtMostOnce => return,
            QoS::AtLeastOnce => PacketType::PubAck,
            QoS::ExactlyOnce => PacketType::PubRec,
        };
        self.session
            .lock()
            .store
            .insert(StoreEntry::new(packet_id, expected, bytes.to_vec()));
    }

    async fn send_publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        dup: bool,
        packet_id: u16,
        payload: &[u8],
    ) -> Result<()> {
        let bytes = build::publish(topic, qos, retain, dup, packet_id, payload)?;
        // Stored before the write so a torn connection still replays it.
        self.store_outbound_publish(qos, packet_id, &bytes);
        debug!(topic, ?qos, packet_id, len = payload.len(), "sending PUBLISH");
        self.write_now(&bytes).await
    }

    pub(crate) async fn send_puback(&mut self, packet_id: u16) -> Result<()> {
        let bytes = build::puback(packet_id)?;
        self.write_now(&bytes).await?;
        if let Some(handler) = self.handlers.pub_res_sent.as_mut() {
            handler(packet_id);
        }
        Ok(())
    }

    pub(crate) async fn send_pubrec(&mut self, packet_id: u16) -> Result<()> {
        let bytes = build::pubrec(packet_id)?;
        self.write_now(&bytes).await
    }

    pub(crate) async fn send_pubrel(&mut self, packet_id: u16) -> Result<()> {
        let bytes = build::pubrel(packet_id)?;
        self.session
            .lock()
            .store
            .insert(StoreEntry::new(packet_id, PacketType::PubComp, bytes.to_vec()));
        self.write_now(&bytes).await
    }

    /// Records a PUBREL for later replay without touching the wire; used
    /// when a PUBREC is answered while the transport is down.
    pub(crate) fn store_pubrel(&mut self, packet_id: u16) -> Result<()> {
        let bytes = build::pubrel(packet_id)?;
        self.session
            .lock()
            .store
            .insert(StoreEntry::new(packet_id, PacketType::PubComp, bytes.to_vec()));
        Ok(())
    }

    pub(crate) async fn send_pubcomp(&mut self, packet_id: u16) -> Result<()> {
        let bytes = build::pubcomp(packet_id)?;
        self.write_now(&bytes).await?;
        if let Some(handler) = self.handlers.pub_res_sent.as_mut() {
            handler(packet_id);
        }
        Ok(())
    }
}
