use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apache_avro::types::Value;
use bytes::Bytes;

use super::*;

const MATH: &str = r#"{
    "protocol": "Math",
    "messages": {
        "neg": {
            "request": [{"name": "n", "type": "int"}],
            "response": "int"
        },
        "log": {
            "request": [{"name": "line", "type": "string"}],
            "response": "null",
            "one-way": true
        }
    }
}"#;

fn math_service() -> Arc<Service> {
    Arc::new(Service::compile(MATH).unwrap())
}

fn neg_request(n: i32) -> Value {
    Value::Record(vec![("n".into(), Value::Int(n))])
}

/// Client and server for `MATH` joined by an in-memory transport pair, with
/// the negation handler installed.
fn negation_pair(client_opts: ClientOptions, channel_opts: ChannelOptions) -> (Client, Server) {
    let service = math_service();
    let client = service.create_client(client_opts);
    let server = service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, request| async move {
        let n = match request_field(&request, "n") {
            Some(Value::Int(n)) => *n,
            _ => return Err(RemoteError::from("bad request")),
        };
        Ok(Value::Int(-n))
    });

    let (near, far) = memory_pair(32);
    server.channel(far, channel_opts.clone());
    client.channel(near, channel_opts);
    (client, server)
}

#[tokio::test]
async fn negation_round_trips() {
    let (client, _server) = negation_pair(ClientOptions::default(), ChannelOptions::default());
    let response = client
        .emit_message("neg", neg_request(10), EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(response, Value::Int(-10));
}

#[tokio::test]
async fn no_ping_handshake_rides_first_call() {
    let (client, _server) = negation_pair(
        ClientOptions::default(),
        ChannelOptions {
            no_ping: true,
            ..ChannelOptions::default()
        },
    );
    let channel = client.channels().pop().unwrap();
    assert_eq!(channel.state(), ChannelState::Pending);

    let response = client
        .emit_message("neg", neg_request(3), EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(response, Value::Int(-3));
    assert_eq!(channel.state(), ChannelState::Open);
}

#[tokio::test]
async fn handler_errors_surface_as_application_errors() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, _request| async move {
        Err::<Value, _>(RemoteError::from("bar"))
    });

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());

    let err = client
        .emit_message("neg", neg_request(1), EmitOptions::default())
        .await
        .unwrap_err();
    match err {
        ServiceError::Application(value) => {
            assert_eq!(value, Value::Union(0, Box::new(Value::String("bar".into()))));
        }
        other => panic!("expected application error, got {other}"),
    }
}

#[tokio::test]
async fn unimplemented_message_reports_an_error() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());

    let err = client
        .emit_message("neg", neg_request(1), EmitOptions::default())
        .await
        .unwrap_err();
    match err {
        ServiceError::Application(Value::Union(0, inner)) => match *inner {
            Value::String(text) => assert!(text.contains("unimplemented"), "{text}"),
            other => panic!("expected string error, got {other:?}"),
        },
        other => panic!("expected application error, got {other}"),
    }
}

#[tokio::test]
async fn unknown_message_fails_locally() {
    let (client, _server) = negation_pair(ClientOptions::default(), ChannelOptions::default());
    let err = client
        .emit_message("plus", neg_request(1), EmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::System);
}

#[tokio::test]
async fn middleware_phases_run_in_stack_order() {
    let (client, server) = negation_pair(ClientOptions::default(), ChannelOptions::default());

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    for label in ["outer", "inner"] {
        let forward_order = order.clone();
        let reverse_order = order.clone();
        client.use_middleware(Arc::new(
            FnMiddleware::new(move |_cx, _wreq| {
                forward_order.lock().unwrap().push(label);
                Ok(())
            })
            .with_reverse(move |_cx, _wres, err| {
                reverse_order.lock().unwrap().push(label);
                err
            }),
        ));
    }

    // Server-side middleware stamps a response header the client can see.
    server.use_middleware(Arc::new(
        FnMiddleware::new(|_cx, wreq| {
            assert!(wreq.headers.contains_key("stamp"));
            Ok(())
        })
        .with_reverse(|_cx, wres, err| {
            wres.headers.insert("echoed".into(), b"yes".to_vec());
            err
        }),
    ));
    let seen = Arc::new(Mutex::new(None));
    let seen_in_reverse = seen.clone();
    client.use_middleware(Arc::new(
        FnMiddleware::new(|_cx, wreq| {
            wreq.headers.insert("stamp".into(), b"on".to_vec());
            Ok(())
        })
        .with_reverse(move |_cx, wres, err| {
            *seen_in_reverse.lock().unwrap() = wres.headers.get("echoed").cloned();
            err
        }),
    ));

    client
        .emit_message("neg", neg_request(5), EmitOptions::default())
        .await
        .unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec!["outer", "inner", "inner", "outer"]
    );
    assert_eq!(seen.lock().unwrap().as_deref(), Some(&b"yes"[..]));
}

#[tokio::test]
async fn forward_error_skips_later_frames_and_own_reverse() {
    let (client, _server) = negation_pair(ClientOptions::default(), ChannelOptions::default());

    let reversed = Arc::new(AtomicUsize::new(0));
    let first_reversed = reversed.clone();
    client.use_middleware(Arc::new(
        FnMiddleware::new(|_cx, _wreq| Ok(())).with_reverse(move |_cx, _wres, err| {
            first_reversed.fetch_add(1, Ordering::SeqCst);
            err
        }),
    ));
    client.use_middleware(Arc::new(FnMiddleware::new(|_cx, _wreq| {
        Err(ServiceError::Middleware("refused".into()))
    })));
    let unreached = Arc::new(AtomicUsize::new(0));
    let unreached_forward = unreached.clone();
    let unreached_reverse = unreached.clone();
    client.use_middleware(Arc::new(
        FnMiddleware::new(move |_cx, _wreq| {
            unreached_forward.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .with_reverse(move |_cx, _wres, err| {
            unreached_reverse.fetch_add(1, Ordering::SeqCst);
            err
        }),
    ));

    let err = client
        .emit_message("neg", neg_request(5), EmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Middleware("refused".into()));
    assert_eq!(reversed.load(Ordering::SeqCst), 1);
    assert_eq!(unreached.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reverse_frame_can_swallow_an_error() {
    let (client, _server) = negation_pair(ClientOptions::default(), ChannelOptions::default());

    client.use_middleware(Arc::new(
        FnMiddleware::new(|_cx, _wreq| Ok(())).with_reverse(|_cx, wres, err| {
            assert!(err.is_some());
            // Swallow: supply a response and clear the error.
            wres.error = None;
            wres.response = Some(Value::Int(0));
            None
        }),
    ));
    client.use_middleware(Arc::new(FnMiddleware::new(|_cx, _wreq| {
        Err(ServiceError::Middleware("boom".into()))
    })));

    let response = client
        .emit_message("neg", neg_request(5), EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(response, Value::Int(0));
}

#[tokio::test]
async fn timeout_fires_at_the_terminal_boundary() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, _request| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Int(0))
    });

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());

    let err = client
        .emit_message(
            "neg",
            neg_request(1),
            EmitOptions::timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Timeout);
}

#[tokio::test]
async fn destroy_aborts_pending_calls_with_a_transport_error() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, _request| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Int(0))
    });

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());

    let emitter = client.clone();
    let pending = tokio::spawn(async move {
        emitter
            .emit_message("neg", neg_request(1), EmitOptions::default())
            .await
    });
    // Let the call reach the server before tearing the channel down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.destroy_channels().await;

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn buffering_queues_until_a_channel_appears() {
    let service = math_service();
    let client = service.create_client(ClientOptions {
        buffering: true,
        ..ClientOptions::default()
    });
    let server = service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, request| async move {
        match request_field(&request, "n") {
            Some(Value::Int(n)) => Ok(Value::Int(-n)),
            _ => Err(RemoteError::from("bad request")),
        }
    });

    let emitter = client.clone();
    let queued = tokio::spawn(async move {
        emitter
            .emit_message("neg", neg_request(4), EmitOptions::default())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());

    assert_eq!(queued.await.unwrap().unwrap(), Value::Int(-4));
}

#[tokio::test]
async fn without_buffering_emissions_fail_fast() {
    let client = math_service().create_client(ClientOptions::default());
    let err = client
        .emit_message("neg", neg_request(4), EmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Transport("no available channel".into())
    );
}

#[tokio::test]
async fn one_way_messages_resolve_at_flush() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel(1);
    server.on_message("log", move |_cx, request| {
        let seen_tx = seen_tx.clone();
        async move {
            let line = match request_field(&request, "line") {
                Some(Value::String(line)) => line.clone(),
                _ => String::new(),
            };
            let _ = seen_tx.send(line).await;
            Ok(Value::Null)
        }
    });

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());

    let request = Value::Record(vec![("line".into(), Value::String("hello".into()))]);
    let response = client
        .emit_message("log", request, EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(response, Value::Null);
    assert_eq!(seen_rx.recv().await.unwrap(), "hello");
}

#[tokio::test]
async fn responses_correlate_by_id_not_arrival_order() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, request| async move {
        let n = match request_field(&request, "n") {
            Some(Value::Int(n)) => *n,
            _ => 0,
        };
        // The first call sleeps longest; completion order inverts issue order.
        tokio::time::sleep(Duration::from_millis(120 - 40 * n as u64)).await;
        Ok(Value::Int(-n))
    });

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());

    let first = client.emit_message("neg", neg_request(1), EmitOptions::default());
    let second = client.emit_message("neg", neg_request(2), EmitOptions::default());
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), Value::Int(-1));
    assert_eq!(second.unwrap(), Value::Int(-2));
}

#[tokio::test]
async fn stateless_transport_round_trips() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, request| async move {
        match request_field(&request, "n") {
            Some(Value::Int(n)) => Ok(Value::Int(-n)),
            _ => Err(RemoteError::from("bad request")),
        }
    });

    // One fresh "sink" per call: each exchange hands the framed request to
    // the server's stateless entry point.
    let stateless_server = server.clone();
    let transport = move |request: Bytes| -> BoxFuture<'static, std::io::Result<Bytes>> {
        let server = stateless_server.clone();
        Box::pin(async move { Ok(Bytes::from(server.handle_stateless(&request).await)) })
    };
    client.stateless_channel(transport, ChannelOptions::default());

    for n in [7, -3] {
        let response = client
            .emit_message("neg", neg_request(n), EmitOptions::default())
            .await
            .unwrap();
        assert_eq!(response, Value::Int(-n));
    }
}

#[tokio::test]
async fn differing_protocols_reconcile_via_full_handshake() {
    // The client's document has an extra message, so the hashes differ and
    // the server must learn the client protocol through the NONE retry.
    let client_doc = MATH.replace(
        r#""messages": {"#,
        r#""messages": {
        "extra": {"request": [], "response": "null"},"#,
    );
    let client_service = Arc::new(Service::compile(&client_doc).unwrap());
    let server_service = math_service();
    assert_ne!(client_service.hash(), server_service.hash());

    let client = client_service.create_client(ClientOptions::default());
    let server = server_service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, request| async move {
        match request_field(&request, "n") {
            Some(Value::Int(n)) => Ok(Value::Int(-n)),
            _ => Err(RemoteError::from("bad request")),
        }
    });

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    let channel = client.channel(near, ChannelOptions::default());

    let response = client
        .emit_message("neg", neg_request(9), EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(response, Value::Int(-9));

    // The handshake carried the server protocol back.
    let remote = channel.remote_protocol().expect("remote protocol learned");
    assert_eq!(remote.hash(), server_service.hash());
}

#[tokio::test]
async fn scopes_isolate_channels_sharing_one_socket() {
    let service = math_service();
    let math_server = service.create_server(ServerOptions::default());
    math_server.on_message("neg", |_cx, _request| async move { Ok(Value::Int(-1)) });
    let log_server = service.create_server(ServerOptions::default());
    log_server.on_message("neg", |_cx, _request| async move { Ok(Value::Int(-2)) });

    let scopes = vec!["math".to_string(), "log".to_string()];
    let (near, far) = memory_pair(32);

    let mut server_ends = scope_mux(far, &scopes);
    log_server.channel(server_ends.pop().unwrap(), ChannelOptions::scoped("log"));
    math_server.channel(server_ends.pop().unwrap(), ChannelOptions::scoped("math"));

    let client = service.create_client(ClientOptions::default());
    let mut client_ends = scope_mux(near, &scopes);
    client.channel(client_ends.pop().unwrap(), ChannelOptions::scoped("log"));
    client.channel(client_ends.pop().unwrap(), ChannelOptions::scoped("math"));

    let math_response = client
        .emit_message(
            "neg",
            neg_request(0),
            EmitOptions {
                scope: Some("math".into()),
                ..EmitOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(math_response, Value::Int(-1));

    let log_response = client
        .emit_message(
            "neg",
            neg_request(0),
            EmitOptions {
                scope: Some("log".into()),
                ..EmitOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(log_response, Value::Int(-2));
}

#[tokio::test]
async fn channel_events_fire_on_install() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let installed = Arc::new(AtomicUsize::new(0));
    let counter = installed.clone();
    client.on_channel(move |channel| {
        assert_eq!(channel.scope(), "math");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (near, _far) = memory_pair(8);
    client.channel(
        near,
        ChannelOptions {
            no_ping: true,
            ..ChannelOptions::scoped("math")
        },
    );
    assert_eq!(installed.load(Ordering::SeqCst), 1);
}
