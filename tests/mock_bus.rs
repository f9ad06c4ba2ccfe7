//! Integration tests against an in-process mock bus daemon speaking over a
//! unix socket: server side of the handshake, `Hello`, `Properties.Get`,
//! `AddMatch`, `Introspect` and signal emission.

use bytes::{Buf, BytesMut};
use dbus_lite::{
    BusAddress, Connection, EventLoop, LoopState, Proxy, ProxyError, ReceiveError,
};
use dbus_message_parser::decode::DecodeError;
use dbus_message_parser::message::{Message, MessageType};
use dbus_message_parser::value::{Array, Type, Value};
use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const SERVICE: &str = "net.sourceforge.cmus";
const PATH: &str = "/net/sourceforge/cmus";

const INTROSPECT_XML: &str = r#"<node>
  <interface name="net.sourceforge.cmus">
    <method name="status">
      <arg name="status" type="s" direction="out"/>
    </method>
    <property name="artist" type="as" access="read"/>
    <signal name="track_change"/>
  </interface>
</node>"#;

struct MockBus {
    _dir: TempDir,
    address: BusAddress,
    emit: mpsc::UnboundedSender<Message>,
    properties: Arc<Mutex<HashMap<String, Value>>>,
}

impl MockBus {
    fn start() -> MockBus {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("bus");
        let listener = UnixListener::bind(&socket).unwrap();
        let address = BusAddress::Address(format!("unix:path={}", socket.display()));
        let mut initial = HashMap::new();
        initial.insert("artist".to_string(), artist_value());
        let properties = Arc::new(Mutex::new(initial));
        let served = properties.clone();
        let (emit, emit_receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                serve(stream, emit_receiver, served).await;
            }
        });
        MockBus {
            _dir: dir,
            address,
            emit,
            properties,
        }
    }

    /// Queue a signal frame from the mock service towards the client.
    fn emit_signal(&self, member: &str, args: Vec<Value>) {
        let mut msg = Message::signal(
            PATH.try_into().unwrap(),
            SERVICE.try_into().unwrap(),
            member.try_into().unwrap(),
        );
        for value in args {
            msg.add_value(value);
        }
        self.emit.send(msg).unwrap();
    }
}

async fn server_handshake(stream: &mut BufStream<UnixStream>) -> std::io::Result<()> {
    let mut nul = [0u8; 1];
    stream.read_exact(&mut nul).await?;
    let mut line = String::new();
    loop {
        line.clear();
        stream.read_line(&mut line).await?;
        let command = line.trim_end();
        if command == "AUTH" {
            stream.write_all(b"REJECTED EXTERNAL\r\n").await?;
        } else if command.starts_with("AUTH EXTERNAL") {
            stream
                .write_all(b"OK 3c3f4d1b616e2d9a9c2b1f2a4d5e6f70\r\n")
                .await?;
        } else if command == "NEGOTIATE_UNIX_FD" {
            stream.write_all(b"AGREE_UNIX_FD\r\n").await?;
        } else if command == "BEGIN" {
            return Ok(());
        }
        stream.flush().await?;
    }
}

async fn send_frame(stream: &mut BufStream<UnixStream>, msg: Message) {
    if let Ok(bytes) = msg.encode() {
        let _ = stream.write_all(&bytes).await;
        let _ = stream.flush().await;
    }
}

/// One connection worth of mock daemon. Ends when the client hangs up or the
/// test drops its `MockBus` (closing the emit channel).
async fn serve(
    stream: UnixStream,
    mut emit: mpsc::UnboundedReceiver<Message>,
    properties: Arc<Mutex<HashMap<String, Value>>>,
) {
    let mut stream = BufStream::new(stream);
    if server_handshake(&mut stream).await.is_err() {
        return;
    }
    let mut serial = 0u32;
    let mut buffer = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        tokio::select! {
            read = stream.read(&mut chunk[..]) => {
                let read = match read {
                    Ok(0) | Err(_) => return,
                    Ok(read) => read,
                };
                buffer.extend_from_slice(&chunk[..read]);
                while !buffer.is_empty() {
                    match Message::decode(buffer.clone().freeze()) {
                        Ok((msg, read)) => {
                            buffer.advance(read);
                            if let Some(mut reply) = handle_request(&msg, &properties) {
                                serial += 1;
                                reply.set_serial(serial);
                                send_frame(&mut stream, reply).await;
                            }
                        }
                        Err(DecodeError::NotEnoughBytes(_, _)) => break,
                        Err(_) => return,
                    }
                }
            }
            signal = emit.recv() => {
                match signal {
                    Some(mut msg) => {
                        serial += 1;
                        msg.set_serial(serial);
                        send_frame(&mut stream, msg).await;
                    }
                    // Emit handle dropped: close the socket.
                    None => return,
                }
            }
        }
    }
}

fn artist_value() -> Value {
    let values = vec![Value::String("Radiohead".to_string())];
    let array = Array::new(values, Type::String).unwrap();
    Value::Array(array)
}

fn handle_request(msg: &Message, properties: &Mutex<HashMap<String, Value>>) -> Option<Message> {
    if msg.get_type() != MessageType::MethodCall {
        return None;
    }
    let member = msg.get_member()?;
    match member.as_ref() {
        "Hello" => {
            let mut reply = msg.method_return().ok()?;
            reply.add_value(Value::String(":1.42".to_string()));
            Some(reply)
        }
        "AddMatch" => msg.method_return().ok(),
        "Get" => {
            let property = match msg.get_body().get(1) {
                Some(Value::String(property)) => property.clone(),
                _ => return Some(msg.invalid_args("missing property name".to_string())),
            };
            match properties.lock().unwrap().get(&property) {
                Some(value) => {
                    let mut reply = msg.method_return().ok()?;
                    reply.add_value(Value::Variant(Box::new(value.clone())));
                    Some(reply)
                }
                None => Some(msg.error(
                    "org.freedesktop.DBus.Error.UnknownProperty".try_into().unwrap(),
                    format!("no such property: {}", property),
                )),
            }
        }
        "GetAll" => {
            let entries = properties
                .lock()
                .unwrap()
                .iter()
                .map(|(name, value)| {
                    Value::DictEntry(Box::new((
                        Value::String(name.clone()),
                        Value::Variant(Box::new(value.clone())),
                    )))
                })
                .collect();
            let entry_type = Type::DictEntry(Box::new((Type::String, Type::Variant)));
            let array = Array::new(entries, entry_type).unwrap();
            let mut reply = msg.method_return().ok()?;
            reply.add_value(Value::Array(array));
            Some(reply)
        }
        "Set" => match (msg.get_body().get(1), msg.get_body().get(2)) {
            (Some(Value::String(property)), Some(Value::Variant(value))) => {
                properties
                    .lock()
                    .unwrap()
                    .insert(property.clone(), (**value).clone());
                msg.method_return().ok()
            }
            _ => Some(msg.invalid_args("malformed Set call".to_string())),
        },
        "Introspect" => {
            let mut reply = msg.method_return().ok()?;
            reply.add_value(Value::String(INTROSPECT_XML.to_string()));
            Some(reply)
        }
        "status" => {
            let mut reply = msg.method_return().ok()?;
            reply.add_value(Value::String("playing".to_string()));
            Some(reply)
        }
        _ => msg.unknown_member(),
    }
}

async fn connect(bus: &MockBus) -> Connection {
    timeout(Duration::from_secs(5), Connection::connect(&bus.address))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn connect_registers_with_the_daemon() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    assert_eq!(connection.unique_name(), Some(":1.42"));
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn get_property_returns_the_mock_value() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let value = proxy
        .get_property(SERVICE.try_into().unwrap(), "artist")
        .await
        .unwrap();
    match *value {
        Value::Array(ref values) => match values.as_ref() {
            [Value::String(artist)] => assert_eq!(artist, "Radiohead"),
            other => panic!("expected one artist, got {:?}", other),
        },
        ref other => panic!("expected an array, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_property_is_no_such_property() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let result = proxy
        .get_property(SERVICE.try_into().unwrap(), "genre")
        .await;
    match result {
        Err(ProxyError::NoSuchProperty(property)) => assert_eq!(property, "genre"),
        other => panic!("expected NoSuchProperty, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn get_properties_lists_every_property() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let properties = proxy
        .get_properties(SERVICE.try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(properties.len(), 1);
    let artist = properties.get("artist").expect("artist is listed");
    match **artist {
        Value::Array(ref values) => match values.as_ref() {
            [Value::String(artist)] => assert_eq!(artist, "Radiohead"),
            other => panic!("expected one artist, got {:?}", other),
        },
        ref other => panic!("expected an array, got {:?}", other),
    }
}

#[tokio::test]
async fn set_property_round_trips() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    proxy
        .set_property(
            SERVICE.try_into().unwrap(),
            "artist",
            Value::String("Idles".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(
        bus.properties.lock().unwrap().get("artist"),
        Some(&Value::String("Idles".to_string()))
    );

    let value = proxy
        .get_property(SERVICE.try_into().unwrap(), "artist")
        .await
        .unwrap();
    match *value {
        Value::String(ref artist) => assert_eq!(artist, "Idles"),
        ref other => panic!("expected a string, got {:?}", other),
    }
}

#[tokio::test]
async fn method_call_returns_the_reply_body() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let reply = proxy
        .method_call(
            SERVICE.try_into().unwrap(),
            "status".try_into().unwrap(),
            [],
        )
        .await
        .unwrap();
    match reply.get_body().get(0) {
        Some(Value::String(status)) => assert_eq!(status, "playing"),
        other => panic!("expected a status string, got {:?}", other),
    }
}

#[tokio::test]
async fn signals_dispatch_once_per_emission_in_order() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let mut event_loop = EventLoop::new(connection.clone());
    let handle = event_loop.handle();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_callback = seen.clone();
    let _subscription = proxy
        .subscribe(SERVICE.try_into().unwrap(), "track_change", move |msg| {
            if let Some(Value::Uint32(n)) = msg.get_body().get(0) {
                let mut seen = seen_in_callback.lock().unwrap();
                seen.push(*n);
                if seen.len() == 3 {
                    handle.stop();
                }
            }
            Ok(())
        })
        .await
        .unwrap();

    for n in 1..=3 {
        bus.emit_signal("track_change", vec![Value::Uint32(n)]);
    }

    timeout(Duration::from_secs(5), event_loop.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), [1, 2, 3]);
    assert_eq!(event_loop.state(), LoopState::Stopped);
}

#[tokio::test]
async fn stop_inside_a_callback_halts_before_the_next_frame() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let mut event_loop = EventLoop::new(connection.clone());
    let handle = event_loop.handle();
    let dispatched = Arc::new(Mutex::new(0u32));
    let dispatched_in_callback = dispatched.clone();
    let _subscription = proxy
        .subscribe(SERVICE.try_into().unwrap(), "track_change", move |_msg| {
            *dispatched_in_callback.lock().unwrap() += 1;
            handle.stop();
            Ok(())
        })
        .await
        .unwrap();

    // Both frames are on the wire before the loop starts. The stop request
    // from the first callback must win over the already-buffered second one.
    bus.emit_signal("track_change", Vec::new());
    bus.emit_signal("track_change", Vec::new());

    timeout(Duration::from_secs(5), event_loop.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*dispatched.lock().unwrap(), 1);
    assert_eq!(event_loop.state(), LoopState::Stopped);
}

#[tokio::test]
async fn cancelled_subscription_gets_nothing() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let mut event_loop = EventLoop::new(connection.clone());
    let handle = event_loop.handle();
    let kept = Arc::new(Mutex::new(0u32));
    let kept_in_callback = kept.clone();
    let _kept_subscription = proxy
        .subscribe(SERVICE.try_into().unwrap(), "track_change", move |_msg| {
            *kept_in_callback.lock().unwrap() += 1;
            handle.stop();
            Ok(())
        })
        .await
        .unwrap();

    let cancelled = Arc::new(Mutex::new(0u32));
    let cancelled_in_callback = cancelled.clone();
    let subscription = proxy
        .subscribe(SERVICE.try_into().unwrap(), "track_change", move |_msg| {
            *cancelled_in_callback.lock().unwrap() += 1;
            Ok(())
        })
        .await
        .unwrap();
    subscription.cancel();

    bus.emit_signal("track_change", Vec::new());
    timeout(Duration::from_secs(5), event_loop.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*kept.lock().unwrap(), 1);
    assert_eq!(*cancelled.lock().unwrap(), 0);
}

#[tokio::test]
async fn callback_errors_do_not_stop_the_loop() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let mut event_loop = EventLoop::new(connection.clone());
    let handle = event_loop.handle();
    let seen = Arc::new(Mutex::new(0u32));
    let seen_in_callback = seen.clone();
    let _subscription = proxy
        .subscribe(SERVICE.try_into().unwrap(), "track_change", move |_msg| {
            let mut seen = seen_in_callback.lock().unwrap();
            *seen += 1;
            if *seen == 2 {
                handle.stop();
                Ok(())
            } else {
                Err("first dispatch fails".into())
            }
        })
        .await
        .unwrap();

    bus.emit_signal("track_change", Vec::new());
    bus.emit_signal("track_change", Vec::new());

    timeout(Duration::from_secs(5), event_loop.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), 2);
}

#[tokio::test]
async fn close_fails_a_blocked_receive() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;

    let receiver = connection.clone();
    let blocked = tokio::spawn(async move { receiver.receive_next().await });
    // Let the receiver task block on the socket first.
    tokio::task::yield_now().await;

    connection.close();
    let result = timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ReceiveError::Closed)));
    assert!(connection.is_closed());
}

#[tokio::test]
async fn event_loop_ends_when_the_connection_closes() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;

    let mut event_loop = EventLoop::new(connection.clone());
    assert_eq!(event_loop.state(), LoopState::Idle);

    let running = tokio::spawn(async move {
        let result = event_loop.run().await;
        (event_loop, result)
    });
    tokio::task::yield_now().await;

    connection.close();
    let (event_loop, result) = timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    result.unwrap();
    assert_eq!(event_loop.state(), LoopState::Stopped);
}

#[tokio::test]
async fn introspection_describes_the_object() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;
    let proxy = Proxy::new(
        SERVICE.try_into().unwrap(),
        PATH.try_into().unwrap(),
        &connection,
    );

    let node = proxy.introspect().await.unwrap();
    let interface = node
        .interfaces
        .iter()
        .find(|interface| interface.name == SERVICE)
        .expect("mock interface is described");
    assert!(interface.properties.iter().any(|p| p.name == "artist"));
    assert!(interface.signals.iter().any(|s| s.name == "track_change"));
    assert!(interface.methods.iter().any(|m| m.name == "status"));
}

#[tokio::test]
async fn second_run_is_rejected() {
    let bus = MockBus::start();
    let connection = connect(&bus).await;

    let mut event_loop = EventLoop::new(connection.clone());
    event_loop.handle().stop();
    timeout(Duration::from_secs(5), event_loop.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event_loop.state(), LoopState::Stopped);
    assert!(event_loop.run().await.is_err());
}
