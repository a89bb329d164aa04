//! URL-scheme dialing.
//!
//! One call surface over every supported transport:
//!
//! | Scheme | Transport |
//! |---|---|
//! | `http://` | stateless HTTP POST (`avro/binary`), handshake per call |
//! | `tcp://` | stateful TCP byte stream ([`DEFAULT_TCP_PORT`] if omitted) |
//! | `file://` | stateful Unix domain socket at the given path |
//! | `ws://`, `wss://` | stateful object-mode WebSocket |
//!
//! `https://` is not dialable: the dependency set carries no standalone TLS
//! stack (`wss://` TLS comes from `tokio-tungstenite` when one of its TLS
//! features is enabled).

use std::io;

use parley_proxy::HttpTransport;
use parley_session::{Channel, ChannelOptions, Client, LengthPrefixed};
use tokio::net::TcpStream;

/// Default port for bare `tcp://` URLs.
pub const DEFAULT_TCP_PORT: u16 = 24950;

/// Open a channel on `client` for the transport named by `url`.
pub async fn dial(client: &Client, url: &str, opts: ChannelOptions) -> io::Result<Channel> {
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("missing scheme: {url}"))
    })?;
    match scheme {
        "http" => {
            let transport = HttpTransport::new(url)?;
            Ok(client.stateless_channel(transport, opts))
        }
        "tcp" => {
            let (host, port) = host_port(rest, DEFAULT_TCP_PORT)?;
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            Ok(client.channel(LengthPrefixed::new(stream), opts))
        }
        #[cfg(unix)]
        "file" => {
            let stream = tokio::net::UnixStream::connect(rest).await?;
            Ok(client.channel(LengthPrefixed::new(stream), opts))
        }
        "ws" | "wss" => {
            let transport = parley_websocket::connect(url).await?;
            Ok(client.channel(transport, opts))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported scheme: {other}"),
        )),
    }
}

fn host_port(authority: &str, default_port: u16) -> io::Result<(String, u16)> {
    let authority = authority.split('/').next().unwrap_or_default();
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("bad port: {port}"))
            })?,
        ),
        None => (authority, default_port),
    };
    if host.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "missing host"));
    }
    Ok((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::types::Value;
    use parley_session::{
        request_field, ClientOptions, EmitOptions, RemoteError, ServerOptions, ServiceExt,
    };
    use parley_session::Service;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const MATH: &str = r#"{
        "protocol": "Math",
        "messages": {
            "neg": {"request": [{"name": "n", "type": "int"}], "response": "int"}
        }
    }"#;

    #[test]
    fn host_port_defaults() {
        assert_eq!(
            host_port("example", 24950).unwrap(),
            ("example".into(), 24950)
        );
        assert_eq!(host_port("example:80", 1).unwrap(), ("example".into(), 80));
        assert!(host_port(":80", 1).is_err());
    }

    #[tokio::test]
    async fn unsupported_schemes_are_rejected() {
        let service = Arc::new(Service::compile(MATH).unwrap());
        let client = service.create_client(ClientOptions::default());
        let err = dial(&client, "https://example", ChannelOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn tcp_dial_round_trips() {
        let service = Arc::new(Service::compile(MATH).unwrap());
        let server = service.create_server(ServerOptions::default());
        server.on_message("neg", |_cx, request| async move {
            match request_field(&request, "n") {
                Some(Value::Int(n)) => Ok(Value::Int(-n)),
                _ => Err(RemoteError::from("bad request")),
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                acceptor.channel(LengthPrefixed::new(stream), ChannelOptions::default());
            }
        });

        let client = service.create_client(ClientOptions::default());
        dial(&client, &format!("tcp://{addr}"), ChannelOptions::default())
            .await
            .unwrap();

        let response = client
            .emit_message(
                "neg",
                Value::Record(vec![("n".into(), Value::Int(6))]),
                EmitOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response, Value::Int(-6));
    }
}
