//! The `avro/json` POST bridge.
//!
//! A JSON body `{"message", "headers"?, "request"}` is transcoded to Avro,
//! emitted through an ephemeral client joined to the bound server over an
//! in-memory duplex pair, and the outcome is transcoded back as
//! `{"headers", "response"}` or `{"headers", "error"}`. Binary header
//! values use the bytes JSON encoding (code-point strings) in both
//! directions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use parley_core::transcode;
use parley_session::{
    Channel, ChannelOptions, Client, ClientOptions, EmitOptions, ErrorKind, FnMiddleware,
    LengthPrefixed, Metadata, Server, ServiceError,
};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

const DUPLEX_CAPACITY: usize = 64 * 1024;

pub(crate) async fn handle_json_post(
    server: &Server,
    body: &[u8],
    timeout: Option<Duration>,
) -> Result<(Vec<u8>, Vec<Channel>), (StatusCode, String)> {
    let parsed: JsonValue = serde_json::from_slice(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")))?;
    let parsed = parsed
        .as_object()
        .ok_or((StatusCode::BAD_REQUEST, "body is not an object".to_owned()))?;

    let message_name = parsed
        .get("message")
        .and_then(JsonValue::as_str)
        .ok_or((StatusCode::BAD_REQUEST, "missing \"message\"".to_owned()))?;
    let service = server.service().clone();
    let message = service.message(message_name).cloned().ok_or((
        StatusCode::BAD_REQUEST,
        format!("unknown message: {message_name}"),
    ))?;

    let request_json = parsed.get("request").cloned().unwrap_or(json!({}));
    let request = transcode::json_to_avro(&request_json, message.request(), service.names())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("bad request: {e}")))?;

    // Binary headers from their JSON form.
    let mut request_headers = Metadata::new();
    if let Some(headers) = parsed.get("headers") {
        let headers = headers
            .as_object()
            .ok_or((StatusCode::BAD_REQUEST, "bad headers".to_owned()))?;
        for (key, value) in headers {
            let bytes = transcode::json_to_bytes(value)
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("bad header {key}: {e}")))?;
            request_headers.insert(key.clone(), bytes);
        }
    }

    // Ephemeral pair: client on one end of an in-memory duplex, the bound
    // server on the other.
    let (client_io, server_io) = tokio::io::duplex(DUPLEX_CAPACITY);
    let server_channel = server.channel(
        LengthPrefixed::new(server_io),
        ChannelOptions::default(),
    );
    let client = Client::new(service.clone(), ClientOptions::default());
    let client_channel = client.channel(LengthPrefixed::new(client_io), ChannelOptions::default());

    // Bridge: JSON headers onto the binary request, binary response
    // headers back out as JSON.
    let response_headers: Arc<Mutex<HashMap<String, JsonValue>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let captured = response_headers.clone();
    client.use_middleware(Arc::new(
        FnMiddleware::new(move |_cx, wreq| {
            wreq.headers.extend(request_headers.clone());
            Ok(())
        })
        .with_reverse(move |_cx, wres, err| {
            let mut captured = captured.lock().expect("headers poisoned");
            for (key, value) in &wres.headers {
                captured.insert(key.clone(), transcode::bytes_to_json(value));
            }
            err
        }),
    ));

    let outcome = client
        .emit_message(
            message_name,
            request,
            EmitOptions {
                timeout,
                ..EmitOptions::default()
            },
        )
        .await;
    let channels = vec![client_channel, server_channel];

    let headers_json = {
        let captured = response_headers.lock().expect("headers poisoned");
        JsonValue::Object(
            captured
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<JsonMap<_, _>>(),
        )
    };

    let body = match outcome {
        Ok(response) => {
            transcode::avro_to_json(&response, message.response(), service.names())
                .map(|response_json| json!({"headers": headers_json, "response": response_json}))
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("bad response: {e}")))
        }
        Err(ServiceError::Application(error)) => {
            transcode::avro_to_json(&error, message.errors(), service.names())
                .map(|error_json| json!({"headers": headers_json, "error": error_json}))
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("bad error: {e}")))
        }
        Err(err) if err.kind() == ErrorKind::Codec => {
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    };

    match body {
        Ok(body) => Ok((serde_json::to_vec(&body).expect("response JSON"), channels)),
        Err(failure) => {
            for channel in channels {
                channel.destroy().await;
            }
            Err(failure)
        }
    }
}
