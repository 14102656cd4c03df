//! Shared test helpers for rokudrive-core integration tests.
//!
//! Provides a stand-in for the on-device component: a TCP listener that reads
//! request frames and answers them according to a script.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use rokudrive_core::client::DeviceClient;
use rokudrive_core::config::DeviceConfig;
use rokudrive_core::protocol::{
    encode_frame, encode_response, read_frame_header, ResponseEnvelope, HEADER_LEN,
};

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

/// A request frame as the device saw it.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub id: String,
    pub request_type: String,
    pub args: Value,
    pub settings: Value,
    pub binary_payload: Vec<u8>,
}

/// Read one request frame. Returns `None` once the client hangs up.
pub async fn read_request(stream: &mut TcpStream) -> Option<ReceivedRequest> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.ok()?;
    let (string_len, binary_len) = read_frame_header(&header);

    let mut json = vec![0u8; string_len as usize];
    stream.read_exact(&mut json).await.ok()?;
    let mut binary_payload = vec![0u8; binary_len as usize];
    stream.read_exact(&mut binary_payload).await.ok()?;

    let json: Value = serde_json::from_slice(&json).unwrap();
    Some(ReceivedRequest {
        id: json["id"].as_str().unwrap().to_string(),
        request_type: json["type"].as_str().unwrap().to_string(),
        args: json["args"].clone(),
        settings: json["settings"].clone(),
        binary_payload,
    })
}

pub async fn write_response(stream: &mut TcpStream, envelope: &ResponseEnvelope, binary: &[u8]) {
    let bytes = encode_response(envelope, binary).unwrap();
    let _ = stream.write_all(&bytes).await;
    let _ = stream.flush().await;
}

/// Successful envelope carrying the fields of a JSON object.
pub fn ok(id: &str, fields: Value) -> ResponseEnvelope {
    let fields = match fields {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => panic!("response fields must be an object, got {other}"),
    };
    ResponseEnvelope::ok(id, fields)
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub fn config_for(addr: SocketAddr) -> DeviceConfig {
    let mut config = DeviceConfig::new(addr.ip().to_string()).with_port(addr.port());
    config.reconnect_delay_ms = 10;
    config
}

pub fn client_for(addr: SocketAddr) -> DeviceClient {
    DeviceClient::new(config_for(addr)).unwrap()
}

// ---------------------------------------------------------------------------
// Programmable mock device
// ---------------------------------------------------------------------------

/// What the mock device does with one incoming request.
pub enum MockBehavior {
    /// Succeed with these response fields.
    Respond(Value),
    /// Succeed with fields and a binary segment.
    RespondBinary(Value, Vec<u8>),
    /// Answer with `success: false` and this message.
    Fail(String),
    /// Sleep, then succeed with these fields.
    Delay(Duration, Value),
    /// Read the request and never answer it.
    Ignore,
    /// Read the request, then close the socket. The next connection picks up
    /// the remaining behaviors.
    Drop,
    /// Read the request and answer with a frame whose JSON is invalid.
    SendGarbage,
}

/// Start a mock device that runs `behaviors` in order, one per request, across
/// as many connections as the client makes.
///
/// Every request read is also forwarded on the returned channel.
pub async fn programmable_mock_device(
    behaviors: Vec<MockBehavior>,
) -> (SocketAddr, mpsc::UnboundedReceiver<ReceivedRequest>) {
    let (listener, addr) = bind().await;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut behaviors: VecDeque<MockBehavior> = behaviors.into();

        'accept: while let Ok((mut stream, _)) = listener.accept().await {
            while let Some(behavior) = behaviors.pop_front() {
                let Some(request) = read_request(&mut stream).await else {
                    behaviors.push_front(behavior);
                    continue 'accept;
                };
                let id = request.id.clone();
                let _ = tx.send(request);

                match behavior {
                    MockBehavior::Respond(fields) => {
                        write_response(&mut stream, &ok(&id, fields), &[]).await;
                    }
                    MockBehavior::RespondBinary(fields, binary) => {
                        write_response(&mut stream, &ok(&id, fields), &binary).await;
                    }
                    MockBehavior::Fail(message) => {
                        write_response(&mut stream, &ResponseEnvelope::failure(&id, message), &[])
                            .await;
                    }
                    MockBehavior::Delay(duration, fields) => {
                        tokio::time::sleep(duration).await;
                        write_response(&mut stream, &ok(&id, fields), &[]).await;
                    }
                    MockBehavior::Ignore => {}
                    MockBehavior::Drop => continue 'accept,
                    MockBehavior::SendGarbage => {
                        let _ = stream.write_all(&encode_frame("{not json", &[])).await;
                    }
                }
            }

            // Script exhausted: keep the socket open until the client leaves.
            while read_request(&mut stream).await.is_some() {}
        }
    });

    (addr, rx)
}
