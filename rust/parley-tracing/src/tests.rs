use std::sync::Arc;

use apache_avro::types::Value;
use parley_session::{
    memory_pair, request_field, ChannelOptions, Client, ClientOptions, EmitOptions, ErrorKind,
    RemoteError, Server, ServerOptions, Service, ServiceError, ServiceExt,
};
use uuid::Uuid;

use super::*;

const MATH: &str = r#"{
    "protocol": "Math",
    "messages": {
        "neg": {
            "request": [{"name": "n", "type": "int"}],
            "response": "int"
        }
    }
}"#;

fn math_service() -> Arc<Service> {
    Arc::new(Service::compile(MATH).unwrap())
}

fn neg_request(n: i32) -> Value {
    Value::Record(vec![("n".into(), Value::Int(n))])
}

fn traced_pair() -> (Client, Server) {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());
    enable_tracing(TracingTarget::Client(&client), TracingOptions::default());
    enable_tracing(TracingTarget::Server(&server), TracingOptions::default());

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());
    (client, server)
}

fn emit_opts_with(trace: &Trace) -> EmitOptions {
    let mut opts = EmitOptions::default();
    opts.locals.insert(trace.clone());
    opts
}

#[test]
fn trace_wire_form_round_trips() {
    let trace = Trace::new();
    trace.push_call(CallRecord {
        state: CallState::Success,
        name: "neg".into(),
        request_time: 1_000,
        response_time: Some(1_050),
        downstream_calls: vec![CallRecord {
            state: CallState::Error,
            name: "plus".into(),
            request_time: 1_010,
            response_time: Some(1_020),
            downstream_calls: Vec::new(),
        }],
    });

    let decoded = Trace::decode(&trace.encode().unwrap()).unwrap();
    assert_eq!(decoded, trace.snapshot());
}

#[test]
fn outbound_wire_form_carries_only_the_uuid() {
    let uuid = Uuid::new_v4();
    let trace = Trace::with_uuid(uuid);
    trace.push_call(CallRecord {
        state: CallState::Pending,
        name: "neg".into(),
        request_time: 1,
        response_time: None,
        downstream_calls: Vec::new(),
    });

    let decoded = Trace::decode(&trace.encode_outbound().unwrap()).unwrap();
    assert_eq!(decoded.uuid, uuid);
    assert!(decoded.calls.is_empty());
}

#[tokio::test]
async fn direct_negation_round_trip() {
    let (client, server) = traced_pair();
    server.on_message("neg", |_cx, request| async move {
        match request_field(&request, "n") {
            Some(Value::Int(n)) => Ok(Value::Int(-n)),
            _ => Err(RemoteError::from("bad request")),
        }
    });

    let trace = Trace::new();
    let response = client
        .emit_message("neg", neg_request(10), emit_opts_with(&trace))
        .await
        .unwrap();
    assert_eq!(response, Value::Int(-10));

    let calls = trace.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].state, CallState::Success);
    assert!(calls[0].downstream_calls.is_empty());
    assert!(calls[0].response_time.is_some());
    assert!(calls[0].response_time.unwrap() >= calls[0].request_time);
}

#[tokio::test]
async fn single_hop_trace_stitching() {
    // Server A's handler calls server B, then fails with "bar".
    let service = math_service();

    let server_b = service.create_server(ServerOptions::default());
    enable_tracing(TracingTarget::Server(&server_b), TracingOptions::default());
    server_b.on_message("neg", |_cx, request| async move {
        match request_field(&request, "n") {
            Some(Value::Int(n)) => Ok(Value::Int(-n)),
            _ => Err(RemoteError::from("bad request")),
        }
    });

    let client_b = service.create_client(ClientOptions::default());
    enable_tracing(TracingTarget::Client(&client_b), TracingOptions::default());
    let (near_b, far_b) = memory_pair(32);
    server_b.channel(far_b, ChannelOptions::default());
    client_b.channel(near_b, ChannelOptions::default());

    let server_a = service.create_server(ServerOptions::default());
    enable_tracing(TracingTarget::Server(&server_a), TracingOptions::default());
    server_a.on_message("neg", move |cx, request| {
        let client_b = client_b.clone();
        async move {
            let trace = cx.locals().get::<Trace>().expect("server trace seeded");
            let mut opts = EmitOptions::default();
            opts.locals.insert(trace);
            client_b
                .emit_message("neg", request, opts)
                .await
                .map_err(|e| RemoteError::from(format!("downstream failed: {e}")))?;
            Err(RemoteError::from("bar"))
        }
    });

    let client_a = service.create_client(ClientOptions::default());
    enable_tracing(TracingTarget::Client(&client_a), TracingOptions::default());
    let (near_a, far_a) = memory_pair(32);
    server_a.channel(far_a, ChannelOptions::default());
    client_a.channel(near_a, ChannelOptions::default());

    let trace = Trace::new();
    let err = client_a
        .emit_message("neg", neg_request(10), emit_opts_with(&trace))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Application);

    let calls = trace.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].state, CallState::Error);
    assert_eq!(calls[0].downstream_calls.len(), 1);
    assert_eq!(calls[0].downstream_calls[0].state, CallState::Success);
    assert!(calls[0].downstream_calls[0].response_time.is_some());
}

#[tokio::test]
async fn duplicate_trace_fails_the_call() {
    let (client, server) = traced_pair();
    server.on_message("neg", |_cx, _request| async move { Ok(Value::Int(0)) });

    // Pre-populate the call's locals through the incoming-call hook, as a
    // reverse-direction tracer would; the client's header then collides.
    server.on_incoming_call(|cx| {
        cx.locals().insert(Trace::new());
    });

    let err = client
        .emit_message("neg", neg_request(1), emit_opts_with(&Trace::new()))
        .await
        .unwrap_err();
    match err {
        ServiceError::Application(Value::Union(0, inner)) => match *inner {
            Value::String(text) => assert!(text.contains("duplicate trace"), "{text}"),
            other => panic!("expected string error, got {other:?}"),
        },
        other => panic!("expected application error, got {other}"),
    }
}

#[tokio::test]
async fn missing_outgoing_trace_fails_the_call() {
    let (client, server) = traced_pair();
    server.on_message("neg", |_cx, _request| async move { Ok(Value::Int(0)) });

    let err = client
        .emit_message("neg", neg_request(1), EmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Tracing("missing outgoing trace".into())
    );
}

#[tokio::test]
async fn create_missing_outgoing_mints_a_trace() {
    let service = math_service();
    let client = service.create_client(ClientOptions::default());
    let server = service.create_server(ServerOptions::default());
    enable_tracing(
        TracingTarget::Client(&client),
        TracingOptions {
            create_missing_outgoing: true,
            ..TracingOptions::default()
        },
    );
    enable_tracing(TracingTarget::Server(&server), TracingOptions::default());
    server.on_message("neg", |_cx, _request| async move { Ok(Value::Int(0)) });

    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    client.channel(near, ChannelOptions::default());

    let response = client
        .emit_message("neg", neg_request(1), EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(response, Value::Int(0));
}

#[tokio::test]
async fn missing_incoming_trace_is_tolerated_when_configured() {
    // The server is not instrumented, so no trace header comes back.
    let service = math_service();
    let server = service.create_server(ServerOptions::default());
    server.on_message("neg", |_cx, _request| async move { Ok(Value::Int(0)) });

    let strict = service.create_client(ClientOptions::default());
    enable_tracing(TracingTarget::Client(&strict), TracingOptions::default());
    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    strict.channel(near, ChannelOptions::default());

    let err = strict
        .emit_message("neg", neg_request(1), emit_opts_with(&Trace::new()))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Tracing("missing incoming trace".into())
    );

    let lenient = service.create_client(ClientOptions::default());
    enable_tracing(
        TracingTarget::Client(&lenient),
        TracingOptions {
            ignore_missing_incoming: true,
            ..TracingOptions::default()
        },
    );
    let (near, far) = memory_pair(32);
    server.channel(far, ChannelOptions::default());
    lenient.channel(near, ChannelOptions::default());

    let trace = Trace::new();
    lenient
        .emit_message("neg", neg_request(1), emit_opts_with(&trace))
        .await
        .unwrap();
    let calls = trace.calls();
    assert_eq!(calls[0].state, CallState::Success);
    assert!(calls[0].downstream_calls.is_empty());
}
