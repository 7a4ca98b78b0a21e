//! The receive loop: assemble one control packet off the stream, parse
//! it, run the side effects its type demands, hand it to the registered
//! handler, flush anything the dispatch queued, repeat.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::Endpoint;
use crate::encoding::RemainingLengthDecoder;
use crate::error::{MqttError, Result};
use crate::packet::{parse, FixedHeader, Packet, PacketType};
use crate::transport::Transport;
use crate::types::{AutoResponse, ConnectRequest, ConnectReturnCode, Decision, PublishEvent, QoS};

impl<T: Transport> Endpoint<T> {
    /// Drives the session until the peer disconnects, a handler returns
    /// [`Decision::Stop`], or the session fails.
    ///
    /// On a clean close (EOF, reset, inbound DISCONNECT, handler Stop)
    /// the close handler runs where applicable and `Ok(())` is returned.
    /// Any other failure runs the error handler exactly once and is
    /// returned; parse errors leave the transport to the caller, IO and
    /// framing errors shut it down.
    pub async fn start_session(&mut self) -> Result<()> {
        match self.receive_loop().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_clean_close() => {
                debug!("session closed by peer");
                self.connected = false;
                let _ = self.conn.shutdown().await;
                if let Some(handler) = self.handlers.close.as_mut() {
                    handler();
                }
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "session terminated");
                self.connected = false;
                let parse_error = matches!(
                    err,
                    MqttError::Protocol(_)
                        | MqttError::MalformedPacket(_)
                        | MqttError::InvalidPacketType(_)
                        | MqttError::InvalidReturnCode(_)
                        | MqttError::InvalidQoS(_)
                );
                if !parse_error {
                    let _ = self.conn.shutdown().await;
                }
                if let Some(handler) = self.handlers.error.as_mut() {
                    handler(&err);
                }
                Err(err)
            }
        }
    }

    async fn receive_loop(&mut self) -> Result<()> {
        loop {
            let (header, body) = self.read_packet().await?;
            trace!(packet_type = ?header.packet_type, remaining = body.len(), "packet received");
            let packet = parse::packet(&header, body)?;
            let decision = self.dispatch(packet).await?;
            // Responses queued during dispatch leave before the next
            // read, even when the handler asked to stop.
            self.flush().await?;
            if decision == Decision::Stop {
                return Ok(());
            }
        }
    }

    /// Assembles one packet: type byte, remaining-length varint, then
    /// exactly that many payload bytes.
    async fn read_packet(&mut self) -> Result<(FixedHeader, Bytes)> {
        let mut byte = [0u8; 1];
        self.conn.read_exact(&mut byte).await?;
        let header = FixedHeader::parse(byte[0])?;

        let mut decoder = RemainingLengthDecoder::new();
        let remaining = loop {
            self.conn.read_exact(&mut byte).await?;
            if let Some(value) = decoder.feed(byte[0])? {
                break value as usize;
            }
        };

        if remaining == 0 {
            return Ok((header, Bytes::new()));
        }
        let mut payload = vec![0u8; remaining];
        self.conn.read_exact(&mut payload).await?;
        Ok((header, Bytes::from(payload)))
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<Decision> {
        match packet {
            Packet::Connect(request) => Ok(self.on_connect(request)),
            Packet::ConnAck {
                session_present,
                return_code,
            } => self.on_connack(session_present, return_code).await,
            Packet::Publish(publish) => self.on_publish(publish).await,
            Packet::PubAck { packet_id } => Ok(self.on_puback(packet_id)),
            Packet::PubRec { packet_id } => self.on_pubrec(packet_id).await,
            Packet::PubRel { packet_id } => self.on_pubrel(packet_id).await,
            Packet::PubComp { packet_id } => Ok(self.on_pubcomp(packet_id)),
            Packet::Subscribe { packet_id, entries } => {
                Ok(match self.handlers.subscribe.as_mut() {
                    Some(handler) => handler(packet_id, entries),
                    None => Decision::Continue,
                })
            }
            Packet::SubAck {
                packet_id,
                return_codes,
            } => Ok(self.on_suback(packet_id, return_codes)),
            Packet::Unsubscribe { packet_id, topics } => {
                Ok(match self.handlers.unsubscribe.as_mut() {
                    Some(handler) => handler(packet_id, topics),
                    None => Decision::Continue,
                })
            }
            Packet::UnsubAck { packet_id } => Ok(self.on_unsuback(packet_id)),
            Packet::PingReq => Ok(match self.handlers.pingreq.as_mut() {
                Some(handler) => handler(),
                None => Decision::Continue,
            }),
            Packet::PingResp => Ok(match self.handlers.pingresp.as_mut() {
                Some(handler) => handler(),
                None => Decision::Continue,
            }),
            Packet::Disconnect => {
                if let Some(handler) = self.handlers.disconnect.as_mut() {
                    handler();
                }
                Ok(Decision::Stop)
            }
        }
    }

    fn on_connect(&mut self, request: ConnectRequest) -> Decision {
        match self.handlers.connect.as_mut() {
            Some(handler) => handler(request),
            None => Decision::Continue,
        }
    }

    async fn on_connack(
        &mut self,
        session_present: bool,
        return_code: ConnectReturnCode,
    ) -> Result<Decision> {
        if return_code == ConnectReturnCode::Accepted {
            if self.clean_session {
                self.session.lock().store.clear();
            } else {
                let packets = self.session.lock().store.replay_packets();
                if !packets.is_empty() {
                    debug!(count = packets.len(), "replaying stored session packets");
                }
                for bytes in packets {
                    // Replay is written synchronously: it must be on the
                    // wire, in original send order, before any queued
                    // traffic from the new connection.
                    self.write_now(&bytes).await?;
                }
            }
        }
        Ok(match self.handlers.connack.as_mut() {
            Some(handler) => handler(session_present, return_code),
            None => Decision::Continue,
        })
    }

    async fn on_publish(&mut self, publish: PublishEvent) -> Result<Decision> {
        match publish.qos {
            QoS::AtMostOnce => Ok(self.deliver(publish)),
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(MqttError::MalformedPacket(
                        "PUBLISH QoS 1 without packet identifier".to_string(),
                    ));
                };
                let decision = self.deliver(publish);
                if decision == Decision::Continue {
                    self.auto_respond_puback(packet_id).await?;
                }
                Ok(decision)
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(MqttError::MalformedPacket(
                        "PUBLISH QoS 2 without packet identifier".to_string(),
                    ));
                };
                let decision = if self.qos2_received.contains(&packet_id) {
                    trace!(packet_id, "duplicate QoS 2 publish suppressed");
                    Decision::Continue
                } else {
                    let decision = self.deliver(publish);
                    if decision == Decision::Continue {
                        self.qos2_received.insert(packet_id);
                    }
                    decision
                };
                // PUBREC goes out for every well-formed QoS 2 publish,
                // duplicate or not, whatever the handler decided.
                self.auto_respond_pubrec(packet_id).await?;
                Ok(decision)
            }
        }
    }

    fn deliver(&mut self, publish: PublishEvent) -> Decision {
        match self.handlers.publish.as_mut() {
            Some(handler) => handler(publish),
            None => Decision::Continue,
        }
    }

    fn on_puback(&mut self, packet_id: u16) -> Decision {
        {
            let mut state = self.session.lock();
            state.store.remove(packet_id, PacketType::PubAck);
            state.release(packet_id);
        }
        match self.handlers.puback.as_mut() {
            Some(handler) => handler(packet_id),
            None => Decision::Continue,
        }
    }

    async fn on_pubrec(&mut self, packet_id: u16) -> Result<Decision> {
        // The identifier stays reserved; PUBREL/PUBCOMP reuse it.
        self.session.lock().store.remove(packet_id, PacketType::PubRec);
        let decision = match self.handlers.pubrec.as_mut() {
            Some(handler) => handler(packet_id),
            None => Decision::Continue,
        };
        if decision == Decision::Continue {
            self.auto_respond_pubrel(packet_id).await?;
        }
        Ok(decision)
    }

    async fn on_pubrel(&mut self, packet_id: u16) -> Result<Decision> {
        self.qos2_received.remove(&packet_id);
        let decision = match self.handlers.pubrel.as_mut() {
            Some(handler) => handler(packet_id),
            None => Decision::Continue,
        };
        if decision == Decision::Continue {
            self.auto_respond_pubcomp(packet_id).await?;
        }
        Ok(decision)
    }

    fn on_pubcomp(&mut self, packet_id: u16) -> Decision {
        {
            let mut state = self.session.lock();
            state.store.remove(packet_id, PacketType::PubComp);
            state.release(packet_id);
        }
        match self.handlers.pubcomp.as_mut() {
            Some(handler) => handler(packet_id),
            None => Decision::Continue,
        }
    }

    fn on_suback(&mut self, packet_id: u16, return_codes: Vec<Option<QoS>>) -> Decision {
        self.session.lock().release(packet_id);
        match self.handlers.suback.as_mut() {
            Some(handler) => handler(packet_id, return_codes),
            None => Decision::Continue,
        }
    }

    fn on_unsuback(&mut self, packet_id: u16) -> Decision {
        self.session.lock().release(packet_id);
        match self.handlers.unsuback.as_mut() {
            Some(handler) => handler(packet_id),
            None => Decision::Continue,
        }
    }

    // --- auto responses ---

    async fn auto_respond_puback(&mut self, packet_id: u16) -> Result<()> {
        match self.auto_pub_response {
            AutoResponse::Off => Ok(()),
            AutoResponse::Immediate if self.connected => self.send_puback(packet_id).await,
            AutoResponse::Queued if self.connected => self.queue_puback(packet_id, None),
            _ => Ok(()),
        }
    }

    async fn auto_respond_pubrec(&mut self, packet_id: u16) -> Result<()> {
        match self.auto_pub_response {
            AutoResponse::Off => Ok(()),
            AutoResponse::Immediate if self.connected => self.send_pubrec(packet_id).await,
            AutoResponse::Queued if self.connected => self.queue_pubrec(packet_id, None),
            _ => Ok(()),
        }
    }

    async fn auto_respond_pubrel(&mut self, packet_id: u16) -> Result<()> {
        match self.auto_pub_response {
            AutoResponse::Off => Ok(()),
            AutoResponse::Immediate if self.connected => self.send_pubrel(packet_id).await,
            AutoResponse::Queued if self.connected => self.queue_pubrel(packet_id, None),
            // Not connected: record the PUBREL so the resumed session
            // replays it.
            AutoResponse::Immediate | AutoResponse::Queued => self.store_pubrel(packet_id),
        }
    }

    async fn auto_respond_pubcomp(&mut self, packet_id: u16) -> Result<()> {
        match self.auto_pub_response {
            AutoResponse::Off => Ok(()),
            AutoResponse::Immediate if self.connected => self.send_pubcomp(packet_id).await,
            AutoResponse::Queued if self.connected => self.queue_pubcomp(packet_id, None),
            _ => Ok(()),
        }
    }
}
