//! Channel state machine: join/push/reply flows, buffering, duplicate-topic
//! eviction, stale-message filtering, push timeouts and rejoin behavior.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Value, json};

use support::{FakeTransportFactory, VirtualScheduler};
use tether::channel::ChannelState;
use tether::{Socket, SocketOptions};

fn connected_socket() -> (Socket, Arc<FakeTransportFactory>, Arc<VirtualScheduler>) {
    let scheduler = VirtualScheduler::new();
    let factory = FakeTransportFactory::new(true);
    let socket = Socket::with_transport(
        "ws://example.com/socket",
        SocketOptions::new().scheduler(scheduler.clone()),
        factory.factory(),
    );
    socket.connect().unwrap();
    (socket, factory, scheduler)
}

#[test]
fn test_happy_join_push_reply() {
    let (socket, factory, _scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("rooms:lobby", json!({"one": "two"}));
    assert_eq!(channel.state(), ChannelState::Closed);

    let join = channel.join();
    assert_eq!(channel.state(), ChannelState::Joining);
    assert_eq!(
        transport.sent_frames(),
        vec![json!(["1", "1", "rooms:lobby", "phx_join", {"one": "two"}])]
    );

    let joined = Arc::new(AtomicBool::new(false));
    let joined_flag = joined.clone();
    join.receive("ok", move |_resp| {
        joined_flag.store(true, Ordering::SeqCst);
    });

    transport.server_reply("1", "rooms:lobby", "ok", json!({}));
    assert!(joined.load(Ordering::SeqCst));
    assert_eq!(channel.state(), ChannelState::Joined);
    assert_eq!(channel.join_ref(), Some("1".to_string()));

    let ack = Arc::new(Mutex::new(None::<Value>));
    let ack_slot = ack.clone();
    channel
        .push("new_msg", json!({"body": "hi"}))
        .receive("ok", move |resp| {
            *ack_slot.lock().unwrap() = Some(resp.clone());
        });

    assert_eq!(
        transport.sent_frames()[1],
        json!(["1", "2", "rooms:lobby", "new_msg", {"body": "hi"}])
    );

    transport.server_reply("2", "rooms:lobby", "ok", json!({"ack": true}));
    assert_eq!(ack.lock().unwrap().clone(), Some(json!({"ack": true})));
}

#[test]
#[should_panic(expected = "multiple times")]
fn test_join_twice_panics() {
    let (socket, _factory, _scheduler) = connected_socket();
    let channel = socket.channel("t", json!({}));
    channel.join();
    channel.join();
}

#[test]
#[should_panic(expected = "before joining")]
fn test_push_before_join_panics() {
    let (socket, _factory, _scheduler) = connected_socket();
    let channel = socket.channel("t", json!({}));
    channel.push("e", json!({}));
}

#[test]
fn test_pushes_while_joining_flush_in_order_after_join() {
    let (socket, factory, _scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();

    // Still joining: these are deferred.
    channel.push("a", json!({"n": 1}));
    channel.push("b", json!({"n": 2}));
    channel.push("c", json!({"n": 3}));
    assert_eq!(transport.sent_events(), vec!["phx_join"]);

    transport.server_reply("1", "t", "ok", json!({}));
    assert_eq!(transport.sent_events(), vec!["phx_join", "a", "b", "c"]);

    // A push submitted after the flush goes out after the buffered ones.
    channel.push("d", json!({"n": 4}));
    assert_eq!(transport.sent_events(), vec!["phx_join", "a", "b", "c", "d"]);
}

#[test]
fn test_outbound_frames_carry_current_join_ref() {
    let (socket, factory, _scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();
    transport.server_reply("1", "t", "ok", json!({}));

    channel.push("e1", json!({}));
    channel.push("e2", json!({}));

    let join_ref = channel.join_ref().unwrap();
    for frame in transport.sent_frames() {
        assert_eq!(frame[0].as_str().unwrap(), join_ref);
    }
}

#[test]
fn test_duplicate_topic_evicted_on_rejoin() {
    let (socket, factory, _scheduler) = connected_socket();
    let transport = factory.latest();

    let a = socket.channel("t", json!({}));
    let b = socket.channel("t", json!({}));

    a.join();
    transport.server_reply("1", "t", "ok", json!({}));
    b.join();
    transport.server_reply("2", "t", "ok", json!({}));
    assert!(a.is_joined() && b.is_joined());

    a.rejoin();

    // B was told to leave before A's fresh join went out.
    let events = transport.sent_events();
    let leave_at = events.iter().position(|e| e == "phx_leave").unwrap();
    let rejoin_at = events.iter().rposition(|e| e == "phx_join").unwrap();
    assert!(leave_at < rejoin_at, "leave must precede the new join: {events:?}");
    assert_eq!(b.state(), ChannelState::Closed);
    assert_eq!(a.state(), ChannelState::Joining);

    // A's rejoin allocated a fresh join_ref.
    let frames = transport.frames_for_event("phx_join");
    let first = frames.first().unwrap()[0].as_str().unwrap().to_string();
    let last = frames.last().unwrap()[0].as_str().unwrap().to_string();
    assert_ne!(first, last);
    assert_eq!(a.join_ref().as_deref(), Some(last.as_str()));
}

#[test]
fn test_stale_lifecycle_event_is_dropped() {
    let (socket, factory, _scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();
    transport.server_reply("1", "t", "ok", json!({}));
    assert_eq!(channel.join_ref(), Some("1".to_string()));

    let observed = Arc::new(AtomicUsize::new(0));
    let observed_count = observed.clone();
    channel.on("phx_close", move |_msg| {
        observed_count.fetch_add(1, Ordering::SeqCst);
    });

    // phx_close stamped with a foreign join_ref: a prior incarnation.
    transport.server_message(r#"["3",null,"t","phx_close",{}]"#);
    assert_eq!(channel.state(), ChannelState::Joined);
    assert_eq!(observed.load(Ordering::SeqCst), 0);

    // The same event with the current join_ref closes the channel.
    transport.server_message(r#"["1",null,"t","phx_close",{}]"#);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_push_timeout_fires_and_cannot_be_resurrected() {
    let (socket, factory, scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();
    transport.server_reply("1", "t", "ok", json!({}));

    let timeouts = Arc::new(Mutex::new(None::<Value>));
    let oks = Arc::new(AtomicUsize::new(0));

    let timeout_slot = timeouts.clone();
    let ok_count = oks.clone();
    let push = channel.push_with_timeout("e", json!({}), Duration::from_millis(100));
    push.receive("timeout", move |resp| {
        *timeout_slot.lock().unwrap() = Some(resp.clone());
    })
    .receive("ok", move |_resp| {
        ok_count.fetch_add(1, Ordering::SeqCst);
    });

    let push_ref = push.msg_ref().unwrap();
    scheduler.advance(Duration::from_millis(100));

    // The timeout carries the event and sent payload for diagnostics.
    assert_eq!(
        timeouts.lock().unwrap().clone(),
        Some(json!({"event": "e", "payload": {}}))
    );
    assert!(push.has_received("timeout"));

    // A late reply finds no receiver: the first completion wins.
    transport.server_reply(&push_ref, "t", "ok", json!({}));
    assert_eq!(oks.load(Ordering::SeqCst), 0);
}

#[test]
fn test_zero_timeout_never_times_out() {
    let scheduler = VirtualScheduler::new();
    let factory = FakeTransportFactory::new(true);
    let socket = Socket::with_transport(
        "ws://example.com/socket",
        SocketOptions::new()
            .no_heartbeat()
            .scheduler(scheduler.clone()),
        factory.factory(),
    );
    socket.connect().unwrap();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();
    transport.server_reply("1", "t", "ok", json!({}));

    let push = channel.push_with_timeout("e", json!({}), Duration::ZERO);
    scheduler.advance(Duration::from_secs(3600));
    assert!(!push.has_received("timeout"));
}

#[test]
fn test_channel_error_fanout_fails_in_flight_pushes() {
    let (socket, factory, scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();
    transport.server_reply("1", "t", "ok", json!({}));

    let failure = Arc::new(Mutex::new(None::<Value>));
    let failure_slot = failure.clone();
    channel.push("e", json!({})).receive("error", move |resp| {
        *failure_slot.lock().unwrap() = Some(resp.clone());
    });

    transport.server_close(1006);

    assert_eq!(channel.state(), ChannelState::Errored);
    assert_eq!(
        failure.lock().unwrap().clone(),
        Some(json!({"reason": "push_failed"}))
    );

    // The socket reconnects and the channel rejoins on open.
    scheduler.advance(Duration::from_millis(10));
    assert_eq!(factory.count(), 2);
    let rejoins = factory.nth(1).frames_for_event("phx_join");
    assert_eq!(rejoins.len(), 1);
    assert_eq!(channel.state(), ChannelState::Joining);
}

#[test]
fn test_rejoin_scheduled_after_server_error_while_joined() {
    let (socket, factory, scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();
    transport.server_reply("1", "t", "ok", json!({}));

    // Server-side crash of the channel process.
    transport.server_message(r#"["1",null,"t","phx_error",{}]"#);
    assert_eq!(channel.state(), ChannelState::Errored);
    assert_eq!(transport.frames_for_event("phx_join").len(), 1);

    // rejoin_after(1) = 1s; a fresh join with a fresh ref goes out.
    scheduler.advance(Duration::from_secs(1));
    let joins = transport.frames_for_event("phx_join");
    assert_eq!(joins.len(), 2);
    assert_ne!(joins[0][0], joins[1][0]);
    assert_eq!(channel.state(), ChannelState::Joining);
}

#[test]
fn test_error_while_joining_drops_buffered_join_frame() {
    let scheduler = VirtualScheduler::new();
    let factory = FakeTransportFactory::new(false);
    let socket = Socket::with_transport(
        "ws://example.com/socket",
        SocketOptions::new().scheduler(scheduler.clone()),
        factory.factory(),
    );
    socket.connect().unwrap();
    let transport = factory.latest();

    // Joining while the handshake is still in flight: the join frame sits
    // in the socket's send buffer.
    let channel = socket.channel("t", json!({}));
    channel.join();
    assert_eq!(channel.state(), ChannelState::Joining);
    assert_eq!(transport.sent_count(), 0);

    // A transport error while joining must evict the stale join frame so it
    // is not retransmitted verbatim on open.
    transport.server_error("handshake stalled");
    assert_eq!(channel.state(), ChannelState::Errored);

    transport.open();

    // Exactly one join goes out: the rejoin with a fresh ref, not the
    // buffered original.
    let joins = transport.frames_for_event("phx_join");
    assert_eq!(joins.len(), 1);
    assert_ne!(joins[0][1], "1");
    assert_eq!(channel.state(), ChannelState::Joining);
}

#[test]
fn test_leave_closes_and_unregisters() {
    let (socket, factory, _scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();
    transport.server_reply("1", "t", "ok", json!({}));

    let left = Arc::new(AtomicBool::new(false));
    let left_flag = left.clone();
    channel.leave().receive("ok", move |_resp| {
        left_flag.store(true, Ordering::SeqCst);
    });

    // The phx_leave went out, and the close completed locally without
    // waiting for the server (first completion wins; the eventual real
    // reply finds no receiver).
    let leaves = transport.frames_for_event("phx_leave");
    assert_eq!(leaves.len(), 1);
    assert!(left.load(Ordering::SeqCst));
    assert_eq!(channel.state(), ChannelState::Closed);

    let leave_ref = leaves[0][1].as_str().unwrap().to_string();
    transport.server_reply(&leave_ref, "t", "ok", json!({}));
    assert_eq!(channel.state(), ChannelState::Closed);

    // Removed from the registry: broadcasts for the topic no longer reach it.
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_count = seen.clone();
    channel.on("new_msg", move |_msg| {
        seen_count.fetch_add(1, Ordering::SeqCst);
    });
    transport.server_message(r#"[null,null,"t","new_msg",{}]"#);
    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[test]
fn test_leave_when_not_pushable_completes_locally() {
    let scheduler = VirtualScheduler::new();
    let factory = FakeTransportFactory::new(true);
    let socket = Socket::with_transport(
        "ws://example.com/socket",
        SocketOptions::new().scheduler(scheduler.clone()),
        factory.factory(),
    );

    // Never connected.
    let channel = socket.channel("t", json!({}));
    channel.join();

    let left = Arc::new(AtomicBool::new(false));
    let left_flag = left.clone();
    channel.leave().receive("ok", move |_resp| {
        left_flag.store(true, Ordering::SeqCst);
    });

    // The ok was synthesized locally; the caller still observes completion.
    assert!(left.load(Ordering::SeqCst));
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[test]
fn test_set_params_updates_next_join_payload() {
    let (socket, factory, scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({"token": "old"}));
    channel.join();
    assert_eq!(
        transport.frames_for_event("phx_join")[0][4],
        json!({"token": "old"})
    );
    transport.server_reply("1", "t", "ok", json!({}));

    channel.set_params(json!({"token": "new"}));
    transport.server_message(r#"["1",null,"t","phx_error",{}]"#);
    scheduler.advance(Duration::from_secs(1));

    let joins = transport.frames_for_event("phx_join");
    assert_eq!(joins.last().unwrap()[4], json!({"token": "new"}));
}

#[test]
fn test_channel_off_removes_subscription() {
    let (socket, factory, _scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    channel.join();
    transport.server_reply("1", "t", "ok", json!({}));

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_count = seen.clone();
    let binding = channel.on("news", move |_msg| {
        seen_count.fetch_add(1, Ordering::SeqCst);
    });

    transport.server_message(r#"[null,null,"t","news",{}]"#);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    channel.off_ref(binding);
    transport.server_message(r#"[null,null,"t","news",{}]"#);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_join_timeout_errors_then_rejoin_succeeds() {
    let (socket, factory, scheduler) = connected_socket();
    let transport = factory.latest();

    let channel = socket.channel("t", json!({}));
    let timed_out = Arc::new(AtomicBool::new(false));
    let timed_out_flag = timed_out.clone();
    channel
        .join_with_timeout(Duration::from_secs(5))
        .receive("timeout", move |_resp| {
            timed_out_flag.store(true, Ordering::SeqCst);
        });

    // No reply: the join times out and the channel errors.
    scheduler.advance(Duration::from_secs(5));
    assert!(timed_out.load(Ordering::SeqCst));
    assert_eq!(channel.state(), ChannelState::Errored);

    // The dead attempt is abandoned server-side.
    assert_eq!(transport.frames_for_event("phx_leave").len(), 1);

    // The rejoin timer drives a fresh attempt that succeeds.
    scheduler.advance(Duration::from_secs(1));
    assert_eq!(channel.state(), ChannelState::Joining);
    let joins = transport.frames_for_event("phx_join");
    assert_eq!(joins.len(), 2);
    let new_ref = joins[1][1].as_str().unwrap().to_string();
    transport.server_reply(&new_ref, "t", "ok", json!({}));
    assert_eq!(channel.state(), ChannelState::Joined);
}
