//! End-to-end delivery-state scenarios: the QoS 2 handshake, session
//! resumption with DUP replay, inbound exactly-once deduplication, and
//! the ordered write queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use mqtt3::{AutoResponse, ConnectReturnCode, Decision, Endpoint, QoS};

fn pair() -> (Endpoint<DuplexStream>, DuplexStream) {
    let (near, far) = tokio::io::duplex(8192);
    (Endpoint::new(near), far)
}

async fn read_wire(far: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    far.read_exact(&mut buf).await.unwrap();
    buf
}

fn stored_first_bytes(ep: &Endpoint<DuplexStream>) -> Vec<u8> {
    let mut firsts = Vec::new();
    ep.for_each_stored(|bytes| firsts.push(bytes[0]));
    firsts
}

#[tokio::test]
async fn test_qos2_full_handshake() {
    let (mut ep, mut far) = pair();
    let packet_id = ep.publish_exactly_once("t", b"x", false).await.unwrap();
    assert_eq!(packet_id, 1);

    let wire = read_wire(&mut far, 8).await;
    assert_eq!(wire, [0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x01, b'x']);
    assert_eq!(stored_first_bytes(&ep), vec![0x34]);

    let flow = Arc::new(Mutex::new(Vec::new()));
    let flow_rec = Arc::clone(&flow);
    let flow_comp = Arc::clone(&flow);
    ep.set_pubrec_handler(move |packet_id| {
        flow_rec.lock().unwrap().push(("pubrec", packet_id));
        Decision::Continue
    });
    ep.set_pubcomp_handler(move |packet_id| {
        flow_comp.lock().unwrap().push(("pubcomp", packet_id));
        Decision::Stop
    });

    far.write_all(&[0x50, 0x02, 0x00, 0x01]).await.unwrap();
    far.write_all(&[0x70, 0x02, 0x00, 0x01]).await.unwrap();
    ep.start_session().await.unwrap();

    assert_eq!(
        *flow.lock().unwrap(),
        vec![("pubrec", 1), ("pubcomp", 1)]
    );

    // PUBREC swapped the stored publish for a PUBREL; PUBCOMP retired it.
    assert_eq!(stored_first_bytes(&ep), Vec::<u8>::new());
    let wire = read_wire(&mut far, 4).await;
    assert_eq!(wire, [0x62, 0x02, 0x00, 0x01]);

    // PUBCOMP released the identifier.
    assert!(ep
        .publish_with_id(1, "t", b"x", QoS::ExactlyOnce, false)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_pubrec_swaps_store_entry_before_pubcomp() {
    let (mut ep, mut far) = pair();
    ep.publish_exactly_once("t", b"x", false).await.unwrap();
    read_wire(&mut far, 8).await;

    ep.set_pubrec_handler(|_| Decision::Continue);
    ep.set_pingresp_handler(|| Decision::Stop);
    far.write_all(&[0x50, 0x02, 0x00, 0x01]).await.unwrap();
    far.write_all(&[0xD0, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();

    // The stored publish became a stored PUBREL awaiting PUBCOMP.
    assert_eq!(stored_first_bytes(&ep), vec![0x62]);
    // Identifier still reserved until PUBCOMP arrives.
    assert!(!ep
        .publish_with_id(1, "t", b"x", QoS::AtLeastOnce, false)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_session_resume_replays_with_dup() {
    let (mut ep, _far) = pair();
    ep.set_clean_session(false);

    let packet_id = ep.publish_at_least_once("a/b", b"hi", false).await.unwrap();
    assert_eq!(packet_id, 1);

    // Transport drops before the PUBACK arrives.
    ep.force_disconnect().await.unwrap();
    assert!(!ep.connected());

    let (near2, mut far2) = tokio::io::duplex(8192);
    ep.attach_transport(near2);
    assert!(ep.connected());

    let acks = Arc::new(Mutex::new(Vec::new()));
    let acks_clone = Arc::clone(&acks);
    ep.set_connack_handler(move |session_present, return_code| {
        acks_clone.lock().unwrap().push((session_present, return_code));
        Decision::Stop
    });

    // CONNACK with session-present from the resumed session.
    far2.write_all(&[0x20, 0x02, 0x01, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();
    assert_eq!(
        *acks.lock().unwrap(),
        vec![(true, ConnectReturnCode::Accepted)]
    );

    // The unacknowledged publish went out again with DUP set.
    let wire = read_wire(&mut far2, 11).await;
    assert_eq!(
        wire,
        [0x3A, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, b'h', b'i']
    );

    // It stays stored until the PUBACK arrives.
    assert_eq!(stored_first_bytes(&ep), vec![0x3A]);
}

#[tokio::test]
async fn test_replay_preserves_send_order() {
    let (mut ep, _far) = pair();
    ep.set_clean_session(false);

    ep.publish_at_least_once("t1", b"1", false).await.unwrap();
    ep.publish_exactly_once("t2", b"2", false).await.unwrap();
    ep.publish_at_least_once("t3", b"3", false).await.unwrap();

    ep.force_disconnect().await.unwrap();
    let (near2, mut far2) = tokio::io::duplex(8192);
    ep.attach_transport(near2);
    ep.set_connack_handler(|_, _| Decision::Stop);
    far2.write_all(&[0x20, 0x02, 0x01, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();

    // Three publishes, replayed in the order they were first sent.
    let wire = read_wire(&mut far2, 27).await;
    assert_eq!(
        wire,
        [
            0x3A, 0x07, 0x00, 0x02, b't', b'1', 0x00, 0x01, b'1', // QoS 1, DUP
            0x3C, 0x07, 0x00, 0x02, b't', b'2', 0x00, 0x02, b'2', // QoS 2, DUP
            0x3A, 0x07, 0x00, 0x02, b't', b'3', 0x00, 0x03, b'3', // QoS 1, DUP
        ]
    );
}

#[tokio::test]
async fn test_clean_session_connack_clears_store() {
    let (mut ep, mut far) = pair();
    ep.set_clean_session(true);
    ep.publish_at_least_once("t", b"x", false).await.unwrap();
    assert_eq!(stored_first_bytes(&ep).len(), 1);
    read_wire(&mut far, 8).await;

    ep.set_connack_handler(|_, _| Decision::Stop);
    far.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();

    assert!(stored_first_bytes(&ep).is_empty());
}

#[tokio::test]
async fn test_refused_connack_leaves_store_alone() {
    let (mut ep, mut far) = pair();
    ep.set_clean_session(false);
    ep.publish_at_least_once("t", b"x", false).await.unwrap();
    read_wire(&mut far, 8).await;

    let acks = Arc::new(Mutex::new(Vec::new()));
    let acks_clone = Arc::clone(&acks);
    ep.set_connack_handler(move |session_present, return_code| {
        acks_clone.lock().unwrap().push((session_present, return_code));
        Decision::Stop
    });
    far.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
    ep.start_session().await.unwrap();

    assert_eq!(
        *acks.lock().unwrap(),
        vec![(false, ConnectReturnCode::NotAuthorized)]
    );
    // No replay, no clearing, no DUP.
    assert_eq!(stored_first_bytes(&ep), vec![0x32]);
}

#[tokio::test]
async fn test_duplicate_inbound_qos2_delivers_once() {
    let (mut ep, mut far) = pair();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let deliveries_clone = Arc::clone(&deliveries);
    ep.set_publish_handler(move |publish| {
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        assert_eq!(publish.packet_id, Some(9));
        deliveries_clone.fetch_add(1, Ordering::SeqCst);
        Decision::Continue
    });

    let res_sent = Arc::new(Mutex::new(Vec::new()));
    let res_sent_clone = Arc::clone(&res_sent);
    ep.set_pub_res_sent_handler(move |packet_id| {
        res_sent_clone.lock().unwrap().push(packet_id);
    });

    ep.set_pingresp_handler(|| Decision::Stop);

    let publish = [0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x09, b'x'];
    // Retransmit before PUBREL: delivered once, PUBREC sent both times.
    far.write_all(&publish).await.unwrap();
    far.write_all(&publish).await.unwrap();
    // PUBREL completes the flow and forgets the identifier.
    far.write_all(&[0x62, 0x02, 0x00, 0x09]).await.unwrap();
    // A fresh publish under the same identifier is a new message.
    far.write_all(&publish).await.unwrap();
    far.write_all(&[0xD0, 0x00]).await.unwrap();

    ep.start_session().await.unwrap();
    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
    // PUBCOMP is the only packet announced through pub_res_sent.
    assert_eq!(*res_sent.lock().unwrap(), vec![9]);

    let wire = read_wire(&mut far, 16).await;
    assert_eq!(
        wire,
        [
            0x50, 0x02, 0x00, 0x09, // PUBREC for the first copy
            0x50, 0x02, 0x00, 0x09, // PUBREC for the retransmit
            0x70, 0x02, 0x00, 0x09, // PUBCOMP answering PUBREL
            0x50, 0x02, 0x00, 0x09, // PUBREC for the new message
        ]
    );
}

#[tokio::test]
async fn test_duplicate_inbound_qos2_acks_every_copy() {
    let (mut ep, mut far) = pair();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let deliveries_clone = Arc::clone(&deliveries);
    ep.set_publish_handler(move |_| {
        deliveries_clone.fetch_add(1, Ordering::SeqCst);
        Decision::Continue
    });
    ep.set_pingresp_handler(|| Decision::Stop);

    let publish = [0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x09, b'x'];
    far.write_all(&publish).await.unwrap();
    far.write_all(&publish).await.unwrap();
    far.write_all(&[0xD0, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();

    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    let wire = read_wire(&mut far, 8).await;
    assert_eq!(wire, [0x50, 0x02, 0x00, 0x09, 0x50, 0x02, 0x00, 0x09]);
}

#[tokio::test]
async fn test_inbound_qos1_auto_puback_and_res_sent() {
    let (mut ep, mut far) = pair();

    ep.set_publish_handler(|publish| {
        assert_eq!(publish.topic, "a/b");
        assert_eq!(&publish.payload[..], b"hi");
        Decision::Continue
    });
    let res_sent = Arc::new(Mutex::new(Vec::new()));
    let res_sent_clone = Arc::clone(&res_sent);
    ep.set_pub_res_sent_handler(move |packet_id| {
        res_sent_clone.lock().unwrap().push(packet_id);
    });
    ep.set_pingresp_handler(|| Decision::Stop);

    far.write_all(&[0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x05, b'h', b'i'])
        .await
        .unwrap();
    far.write_all(&[0xD0, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();

    let wire = read_wire(&mut far, 4).await;
    assert_eq!(wire, [0x40, 0x02, 0x00, 0x05]);
    assert_eq!(*res_sent.lock().unwrap(), vec![5]);
}

#[tokio::test]
async fn test_queued_auto_response_mode() {
    let (mut ep, mut far) = pair();
    ep.set_auto_pub_response(AutoResponse::Queued);

    ep.set_publish_handler(|_| Decision::Continue);
    let res_sent = Arc::new(Mutex::new(Vec::new()));
    let res_sent_clone = Arc::clone(&res_sent);
    ep.set_pub_res_sent_handler(move |packet_id| {
        res_sent_clone.lock().unwrap().push(packet_id);
    });
    ep.set_pingresp_handler(|| Decision::Stop);

    far.write_all(&[0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x05, b'h', b'i'])
        .await
        .unwrap();
    far.write_all(&[0xD0, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();

    let wire = read_wire(&mut far, 4).await;
    assert_eq!(wire, [0x40, 0x02, 0x00, 0x05]);
    assert_eq!(*res_sent.lock().unwrap(), vec![5]);
    assert_eq!(ep.pending_writes(), 0);
}

#[tokio::test]
async fn test_auto_response_off_sends_nothing() {
    let (mut ep, mut far) = pair();
    ep.set_auto_pub_response(AutoResponse::Off);
    ep.set_publish_handler(|_| Decision::Continue);
    ep.set_pingresp_handler(|| Decision::Stop);

    far.write_all(&[0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x05, b'h', b'i'])
        .await
        .unwrap();
    far.write_all(&[0xD0, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();

    // The next write is the first thing on the wire: no PUBACK was sent.
    ep.pingreq().await.unwrap();
    let wire = read_wire(&mut far, 2).await;
    assert_eq!(wire, [0xC0, 0x00]);
}

#[tokio::test]
async fn test_queued_writes_preserve_order() {
    let (mut ep, mut far) = pair();

    let order = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&order);
    let second = Arc::clone(&order);
    ep.queue_publish(
        "t",
        b"1",
        QoS::AtMostOnce,
        false,
        Some(Box::new(move |result| {
            assert!(result.is_ok());
            first.lock().unwrap().push(1);
        })),
    )
    .unwrap();
    ep.queue_pingreq(None).unwrap();
    ep.queue_publish(
        "t",
        b"2",
        QoS::AtMostOnce,
        false,
        Some(Box::new(move |result| {
            assert!(result.is_ok());
            second.lock().unwrap().push(2);
        })),
    )
    .unwrap();
    assert_eq!(ep.pending_writes(), 3);

    ep.flush().await.unwrap();
    assert_eq!(ep.pending_writes(), 0);
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);

    let wire = read_wire(&mut far, 14).await;
    assert_eq!(
        wire,
        [
            0x30, 0x04, 0x00, 0x01, b't', b'1', // first publish
            0xC0, 0x00, // pingreq between them
            0x30, 0x04, 0x00, 0x01, b't', b'2', // second publish
        ]
    );
}

#[tokio::test]
async fn test_handler_stop_leaves_rest_of_stream_unread() {
    let (mut ep, mut far) = pair();

    let pings = Arc::new(AtomicUsize::new(0));
    let pings_clone = Arc::clone(&pings);
    ep.set_pingresp_handler(move || {
        pings_clone.fetch_add(1, Ordering::SeqCst);
        Decision::Stop
    });

    far.write_all(&[0xD0, 0x00, 0xD0, 0x00]).await.unwrap();
    ep.start_session().await.unwrap();
    assert_eq!(pings.load(Ordering::SeqCst), 1);
}
