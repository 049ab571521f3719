use framescope::domain::ProtocolError;
use framescope::viewer::ViewerSession;
use framescope::{Client, ClientConfig, ConnectError, SessionState};
use framescope_common::{
    read_frame, write_frame, ClientMessage, DataFrame, ServerHello, ServerMessage, PROTOCOL_MAJOR,
};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn client() -> Client {
    Client::new(ClientConfig::default().with_program("session-test"))
}

fn accept(listener: &TcpListener) -> ViewerSession<TcpStream> {
    let (stream, _) = listener.accept().expect("accept");
    ViewerSession::accept(stream, "test-viewer").expect("handshake")
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_nested_collectors_arrive_in_one_frame() {
    let (listener, port) = listen();
    let viewer = thread::spawn(move || {
        let mut session = accept(&listener);
        let frame = session.next_data_frame().unwrap().expect("data frame");
        let render = session.collector_index("render").expect("render defined");
        let cull = session.collector_index("render:cull").expect("cull defined");
        let cull_parent = session.collector(cull).and_then(|d| d.parent);
        (frame, render, cull, cull_parent)
    });

    let client = client();
    assert!(client.connect("127.0.0.1", port));
    assert!(client.is_connected());
    assert_eq!(client.viewer_name().as_deref(), Some("test-viewer"));

    let render = client.collector("render").unwrap();
    let cull = client.collector("render:cull").unwrap();
    client.start(render).unwrap();
    client.start(cull).unwrap();
    thread::sleep(Duration::from_millis(2));
    client.stop(cull).unwrap();
    client.stop(render).unwrap();
    client.tick_current().unwrap();

    let (frame, render_index, cull_index, cull_parent): (DataFrame, u32, u32, Option<u32>) =
        viewer.join().unwrap();
    assert_eq!(frame.times.len(), 2);
    assert_eq!(frame.frame_number, 0);
    assert_eq!(cull_parent, Some(render_index));

    let outer = frame.elapsed_ns(render_index).unwrap();
    let inner = frame.elapsed_ns(cull_index).unwrap();
    assert!(inner >= 2_000_000);
    assert!(outer >= inner);

    client.disconnect();
}

#[test]
fn test_viewer_going_away_leaves_client_running() {
    let (listener, port) = listen();
    let viewer = thread::spawn(move || drop(accept(&listener)));

    let client = client();
    assert!(client.connect("127.0.0.1", port));
    viewer.join().unwrap();

    let c = client.collector("update").unwrap();
    let lost = wait_until(Duration::from_secs(5), || {
        client.start(c).unwrap();
        client.stop(c).unwrap();
        client.tick_current().unwrap();
        client.state() == SessionState::Disconnected
    });
    assert!(lost, "client never noticed the viewer left");
    assert_eq!(client.stats().connections_lost, 1);

    let thread = client.current_thread_index().unwrap();
    let before = client.frame_number(thread).unwrap();
    client.tick(thread).unwrap();
    assert_eq!(client.frame_number(thread).unwrap(), before + 1);
}

#[test]
fn test_disconnect_sends_goodbye_and_stops_traffic() {
    let (listener, port) = listen();
    let viewer = thread::spawn(move || {
        let mut session = accept(&listener);
        let mut messages = Vec::new();
        while let Some(msg) = session.next_message().unwrap() {
            messages.push(msg);
        }
        messages
    });

    let client = client();
    assert!(client.connect("127.0.0.1", port));
    let c = client.collector("io").unwrap();
    client.start(c).unwrap();
    client.stop(c).unwrap();
    client.tick_current().unwrap();

    client.disconnect();
    assert_eq!(client.state(), SessionState::Disconnected);

    client.start(c).unwrap();
    client.stop(c).unwrap();
    client.tick_current().unwrap();
    client.disconnect();

    let messages = viewer.join().unwrap();
    let data = messages.iter().filter(|m| matches!(m, ClientMessage::Data(_))).count();
    assert_eq!(data, 1);
    assert!(matches!(messages.last(), Some(ClientMessage::Goodbye)));
}

#[test]
fn test_definitions_precede_data() {
    let (listener, port) = listen();
    let viewer = thread::spawn(move || {
        let mut session = accept(&listener);
        let mut kinds = Vec::new();
        while let Some(msg) = session.next_message().unwrap() {
            kinds.push(match msg {
                ClientMessage::CollectorDef(_) => "collector",
                ClientMessage::ThreadDef(_) => "thread",
                ClientMessage::Data(_) => "data",
                ClientMessage::Goodbye => "goodbye",
                ClientMessage::Hello(_) => "hello",
            });
        }
        kinds
    });

    let client = client();
    let early = client.collector("early").unwrap();
    assert!(client.connect("127.0.0.1", port));

    client.start(early).unwrap();
    client.stop(early).unwrap();
    client.tick_current().unwrap();

    // registered after the first frame went out
    let late = client.collector("late").unwrap();
    client.add_level(late, 4.0).unwrap();
    client.tick_current().unwrap();
    client.disconnect();

    let kinds = viewer.join().unwrap();
    assert_eq!(
        kinds,
        vec!["collector", "thread", "data", "collector", "data", "goodbye"]
    );
}

#[test]
fn test_viewer_can_disable_a_collector() {
    let (listener, port) = listen();
    let viewer = thread::spawn(move || {
        let mut session = accept(&listener);
        let physics = loop {
            match session.next_message().unwrap() {
                Some(ClientMessage::CollectorDef(def)) if def.name == "physics" => break def.index,
                Some(_) => {}
                None => panic!("client left before defining physics"),
            }
        };
        session.set_active(physics, false).unwrap();
        let frame = session.next_data_frame().unwrap().expect("data frame");
        (physics, frame)
    });

    let client = client();
    let physics = client.collector("physics").unwrap();
    let ai = client.collector("ai").unwrap();
    assert!(client.connect("127.0.0.1", port));

    let handle = client.collectors().get(physics).unwrap();
    let default_active = client.collectors().default_active();
    assert!(wait_until(Duration::from_secs(5), || !handle.definition(default_active).is_active()));

    for c in [physics, ai] {
        client.start(c).unwrap();
        client.stop(c).unwrap();
    }
    client.add_level(physics, 1.0).unwrap();
    client.tick_current().unwrap();

    let (physics_index, frame) = viewer.join().unwrap();
    assert_eq!(physics_index, physics.0);
    assert!(frame.elapsed_ns(physics.0).is_none());
    assert!(frame.level(physics.0).is_none());
    assert!(frame.elapsed_ns(ai.0).is_some());
    client.disconnect();
}

#[test]
fn test_major_version_mismatch_is_refused() {
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let hello: Option<ClientMessage> = read_frame(&mut stream).unwrap();
        assert!(matches!(hello, Some(ClientMessage::Hello(_))));
        write_frame(
            &mut stream,
            &ServerMessage::Hello(ServerHello {
                major: PROTOCOL_MAJOR + 1,
                minor: 0,
                server: "future".into(),
            }),
        )
        .unwrap();
    });

    let client = client();
    let err = client.try_connect("127.0.0.1", port).unwrap_err();
    server.join().unwrap();
    assert!(matches!(
        err,
        ConnectError::Protocol(ProtocolError::VersionMismatch { remote, .. }) if remote == PROTOCOL_MAJOR + 1
    ));
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[test]
fn test_rejected_hello_is_reported() {
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _: Option<ClientMessage> = read_frame(&mut stream).unwrap();
        write_frame(&mut stream, &ServerMessage::Reject { reason: "busy".into() }).unwrap();
    });

    let client = client();
    let err = client.try_connect("127.0.0.1", port).unwrap_err();
    server.join().unwrap();
    assert!(matches!(err, ConnectError::Protocol(ProtocolError::Rejected(reason)) if reason == "busy"));
}

#[test]
fn test_frames_ticked_while_paused_are_delivered() {
    let (listener, port) = listen();
    let viewer = thread::spawn(move || {
        let mut session = accept(&listener);
        let paused = session.next_data_frame().unwrap().expect("paused frame");
        let resumed = session.next_data_frame().unwrap().expect("resumed frame");
        (paused, resumed)
    });

    let client = client();
    assert!(client.connect("127.0.0.1", port));

    client.pause();
    assert_eq!(client.state(), SessionState::Paused);
    client.tick_current().unwrap();
    assert_eq!(client.stats().frames_queued, 1);

    thread::sleep(Duration::from_millis(20));
    let gap = client.resume_after_pause();
    assert!(gap.as_millis() >= 20.0);
    assert!(client.is_connected());
    client.tick_current().unwrap();

    let (paused, resumed) = viewer.join().unwrap();
    assert_eq!(paused.frame_number, 0);
    assert_eq!(resumed.frame_number, 1);
    assert_eq!(resumed.start_ns, paused.end_ns);
    assert!(resumed.end_ns.saturating_sub(resumed.start_ns) < 20_000_000);
    assert_eq!(client.stats().frames_dropped, 0);
    client.disconnect();
}

#[test]
fn test_non_finite_level_does_not_break_the_session() {
    let (listener, port) = listen();
    let viewer = thread::spawn(move || {
        let mut session = accept(&listener);
        let first = session.next_data_frame().unwrap().expect("first frame");
        let second = session.next_data_frame().unwrap().expect("second frame");
        (first, second)
    });

    let client = client();
    let load = client.collector("load").unwrap();
    assert!(client.connect("127.0.0.1", port));

    client.set_level(load, f64::INFINITY).unwrap();
    client.add_level(load, f64::NAN).unwrap();
    client.tick_current().unwrap();
    client.set_level(load, 0.5).unwrap();
    client.tick_current().unwrap();

    let (first, second) = viewer.join().unwrap();
    assert!(first.level(load.0).is_none());
    assert_eq!(second.level(load.0), Some(0.5));
    client.disconnect();
}

#[test]
fn test_concurrent_resolution_agrees_on_indices() {
    let client = Arc::new(client());
    let names = ["a", "a:b", "a:b:c", "d", "d:e"];

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let client = Arc::clone(&client);
            thread::spawn(move || names.map(|name| client.collector(name).unwrap()))
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(client.collectors().count(), names.len());
    for (name, index) in names.iter().zip(results[0]) {
        assert_eq!(client.collectors().get(index).unwrap().name(), *name);
    }
}
