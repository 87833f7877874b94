// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use stonerpc::{
    setup_local_tracing, AppError, AppResult, DecodedFrame, ExchangeClient, ExchangeConfig,
    ExchangeServer, Invoker, LazyClient, Message, NoService, RpcInvocation, RpcResult,
    SerializationRegistry, SharedClient, SharedClientPool, Status, TcpTransporter, Transporter,
};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

/// Serves `echo` (returns the first argument), `fail` (raises), `big`
/// (returns a 1 KiB value) and `slow` (answers after 300 ms), counting
/// every invocation.
#[derive(Debug, Default)]
struct EchoInvoker {
    calls: AtomicU64,
}

impl EchoInvoker {
    fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }
}

impl Invoker for EchoInvoker {
    fn invoke(
        &self,
        invocation: RpcInvocation,
    ) -> Pin<Box<dyn Future<Output = AppResult<RpcResult>> + Send + '_>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::AcqRel);
            match invocation.method.as_str() {
                "echo" => Ok(RpcResult::value(
                    invocation.arguments.first().cloned().unwrap_or_default(),
                )),
                "fail" => Err(AppError::ServiceError("deliberate failure".to_string())),
                "big" => Ok(RpcResult::value(Bytes::from(vec![0x42u8; 1024]))),
                "slow" => {
                    time::sleep(Duration::from_millis(300)).await;
                    Ok(RpcResult::value(Bytes::from_static(b"slow")))
                }
                other => Err(AppError::ServiceError(format!("unknown method {}", other))),
            }
        })
    }
}

fn transporter() -> Arc<dyn Transporter> {
    Arc::new(TcpTransporter)
}

fn registry() -> Arc<SerializationRegistry> {
    Arc::new(SerializationRegistry::new())
}

fn quiet_config() -> ExchangeConfig {
    let mut config = ExchangeConfig::default();
    config.client.request_timeout_ms = 2000;
    config.dispatch_pool.num_channels = 2;
    config.dispatch_pool.monitor_interval_secs = 1;
    config
}

async fn start_server(config: ExchangeConfig, invoker: Arc<EchoInvoker>) -> ExchangeServer {
    ExchangeServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        config,
        transporter(),
        registry(),
        invoker,
    )
    .await
    .expect("server should bind")
}

async fn connect_client(remote_addr: SocketAddr, config: ExchangeConfig) -> ExchangeClient {
    ExchangeClient::connect(
        remote_addr,
        config,
        transporter(),
        registry(),
        Arc::new(NoService),
    )
    .await
    .expect("client should connect")
}

fn echo_invocation(payload: &'static [u8]) -> RpcInvocation {
    RpcInvocation::new("demo.EchoService", "echo").with_argument(Bytes::from_static(payload))
}

#[rstest]
#[tokio::test]
async fn test_request_response_round_trip(_setup: ()) {
    let invoker = Arc::new(EchoInvoker::default());
    let server = start_server(quiet_config(), invoker.clone()).await;
    let client = connect_client(server.local_addr(), quiet_config()).await;

    let future = client.request(echo_invocation(b"hello")).await.unwrap();
    let response = future.wait().await.unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(
        response.result.unwrap().value,
        Some(Bytes::from_static(b"hello"))
    );
    assert_eq!(invoker.calls(), 1);

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_handler_error_becomes_service_error(_setup: ()) {
    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;
    let client = connect_client(server.local_addr(), quiet_config()).await;

    let future = client
        .request(RpcInvocation::new("demo.EchoService", "fail"))
        .await
        .unwrap();
    match future.wait().await {
        Err(AppError::ServiceError(message)) => assert!(message.contains("deliberate failure")),
        other => panic!("expected a service error, got {:?}", other),
    }

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_one_way_reaches_the_handler(_setup: ()) {
    let invoker = Arc::new(EchoInvoker::default());
    let server = start_server(quiet_config(), invoker.clone()).await;
    let client = connect_client(server.local_addr(), quiet_config()).await;

    client
        .send_one_way(echo_invocation(b"fire-and-forget"), true)
        .await
        .unwrap();
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(invoker.calls(), 1);

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_server_response_timeout(_setup: ()) {
    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;
    let client = connect_client(server.local_addr(), quiet_config()).await;

    let future = client
        .request_with_timeout(
            RpcInvocation::new("demo.EchoService", "slow"),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    match future.wait().await {
        Err(AppError::Timeout { sent, .. }) => {
            // the request reached the wire, this is the server-side
            // timeout variant
            assert!(sent);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_heartbeats_keep_an_idle_channel_alive(_setup: ()) {
    let mut server_config = quiet_config();
    server_config.server.idle_timeout_ms = 900;
    let invoker = Arc::new(EchoInvoker::default());
    let server = start_server(server_config, invoker.clone()).await;

    let mut client_config = quiet_config();
    client_config.client.heartbeat_ms = 200;
    client_config.client.reconnect = false;
    let client = connect_client(server.local_addr(), client_config).await;

    // without heartbeats the server would have idle-closed this channel
    time::sleep(Duration::from_millis(2000)).await;
    assert!(client.is_connected());
    assert_eq!(server.channel_count(), 1);
    // heartbeats never touch business dispatch
    assert_eq!(invoker.calls(), 0);

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_server_closes_idle_channel(_setup: ()) {
    let mut server_config = quiet_config();
    server_config.server.idle_timeout_ms = 400;
    let server = start_server(server_config, Arc::new(EchoInvoker::default())).await;

    let mut client_config = quiet_config();
    client_config.client.heartbeat_ms = 0;
    client_config.client.reconnect = false;
    let client = connect_client(server.local_addr(), client_config).await;
    assert!(client.is_connected());

    time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.channel_count(), 0);
    assert!(!client.is_connected());

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_client_reconnects_after_server_idle_close(_setup: ()) {
    let mut server_config = quiet_config();
    server_config.server.idle_timeout_ms = 300;
    let invoker = Arc::new(EchoInvoker::default());
    let server = start_server(server_config, invoker.clone()).await;

    let mut client_config = quiet_config();
    client_config.client.heartbeat_ms = 0;
    client_config.client.reconnect = true;
    client_config.client.idle_timeout_ms = 1500;
    let client = connect_client(server.local_addr(), client_config).await;

    // let the server idle-close the first channel
    time::sleep(Duration::from_millis(700)).await;

    // the reconnect task re-establishes the connection and calls work
    // again
    let mut recovered = false;
    for _ in 0..50 {
        if let Ok(future) = client.request(echo_invocation(b"back")).await {
            if future.wait().await.is_ok() {
                recovered = true;
                break;
            }
        }
        time::sleep(Duration::from_millis(100)).await;
    }
    assert!(recovered, "client never recovered after the idle close");

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_overload_is_reported_not_dropped(_setup: ()) {
    let mut server_config = quiet_config();
    server_config.dispatch_pool.num_channels = 1;
    server_config.dispatch_pool.channel_capacity = 1;
    let server = start_server(server_config, Arc::new(EchoInvoker::default())).await;
    let client = connect_client(server.local_addr(), quiet_config()).await;

    let mut futures = Vec::new();
    for _ in 0..4 {
        futures.push(
            client
                .request(RpcInvocation::new("demo.EchoService", "slow"))
                .await
                .unwrap(),
        );
    }
    let mut ok = 0;
    let mut overloaded = 0;
    for future in futures {
        match future.wait().await {
            Ok(_) => ok += 1,
            Err(AppError::Overloaded(_)) => overloaded += 1,
            Err(other) => panic!("unexpected outcome: {:?}", other),
        }
    }
    // every caller got an answer, the excess was rejected explicitly
    assert!(ok >= 1, "no request made it through");
    assert!(overloaded >= 1, "no request was rejected as overloaded");

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_oversized_response_degrades_to_bad_response(_setup: ()) {
    let mut server_config = quiet_config();
    server_config.protocol.max_payload_size = 64;
    let server = start_server(server_config, Arc::new(EchoInvoker::default())).await;
    let client = connect_client(server.local_addr(), quiet_config()).await;

    let future = client
        .request(RpcInvocation::new("demo.EchoService", "big"))
        .await
        .unwrap();
    match future.wait().await {
        Err(AppError::BadResponse(message)) => assert!(message.contains("payload limit")),
        other => panic!("expected a bad response, got {:?}", other),
    }
    // the connection survived the degraded response
    let future = client.request(echo_invocation(b"still here")).await.unwrap();
    assert!(future.wait().await.is_ok());

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_oversized_request_is_rejected_by_the_server(_setup: ()) {
    let mut server_config = quiet_config();
    server_config.protocol.max_payload_size = 64;
    let server = start_server(server_config, Arc::new(EchoInvoker::default())).await;
    let client = connect_client(server.local_addr(), quiet_config()).await;

    let invocation = RpcInvocation::new("demo.EchoService", "echo")
        .with_argument(Bytes::from(vec![0u8; 512]));
    let future = client.request(invocation).await.unwrap();
    // the server rejects the declared length before buffering the body
    // and drops the connection, which fails the pending call
    assert!(future.wait().await.is_err());

    client.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_shared_client_demotes_on_last_release(_setup: ()) {
    let invoker = Arc::new(EchoInvoker::default());
    let server = start_server(quiet_config(), invoker.clone()).await;

    let shared = SharedClient::connect(
        server.local_addr(),
        quiet_config(),
        transporter(),
        registry(),
        Arc::new(NoService),
    )
    .await
    .unwrap();

    // three logical invokers share the one physical connection
    shared.acquire();
    shared.acquire();
    shared.acquire();
    assert_eq!(shared.ref_count(), 3);

    let future = shared.request(echo_invocation(b"one")).await.unwrap();
    assert!(future.wait().await.is_ok());

    shared.release(Duration::from_millis(500)).await;
    shared.release(Duration::from_millis(500)).await;
    // two released, the connection stays open for the third
    assert_eq!(shared.ref_count(), 1);
    assert!(shared.is_connected().await);
    assert_eq!(server.channel_count(), 1);

    shared.release(Duration::from_millis(500)).await;
    assert_eq!(shared.ref_count(), 0);
    // demoted to lazy, the physical connection is gone but not leaked
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.channel_count(), 0);

    // next genuine use reopens transparently
    let future = shared.request(echo_invocation(b"again")).await.unwrap();
    assert!(future.wait().await.is_ok());
    assert_eq!(server.channel_count(), 1);

    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_lazy_client_defers_the_physical_connect(_setup: ()) {
    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;

    let lazy = LazyClient::new(
        server.local_addr(),
        quiet_config(),
        transporter(),
        registry(),
        Arc::new(NoService),
    );
    // nothing has dialed yet, the optimistic initial state holds
    assert!(lazy.is_connected());
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.channel_count(), 0);

    let future = lazy.request(echo_invocation(b"first use")).await.unwrap();
    assert!(future.wait().await.is_ok());
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.channel_count(), 1);

    lazy.close(Duration::from_millis(500)).await;
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_pool_shares_one_client_per_address(_setup: ()) {
    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;

    let pool = SharedClientPool::new(
        quiet_config(),
        transporter(),
        registry(),
        Arc::new(NoService),
    );
    let first = pool.fetch(server.local_addr()).await.unwrap();
    let second = pool.fetch(server.local_addr()).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    // both logical references ride the same physical client
    assert!(Arc::ptr_eq(&first[0], &second[0]));
    assert_eq!(first[0].ref_count(), 2);
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.channel_count(), 1);

    let future = second[0].request(echo_invocation(b"pooled")).await.unwrap();
    assert!(future.wait().await.is_ok());

    for client in first.iter().chain(second.iter()) {
        client.release(Duration::from_millis(500)).await;
    }
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_pool_builds_dedicated_clients_when_configured(_setup: ()) {
    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;

    let mut config = quiet_config();
    config.client.connections = 2;
    let pool = SharedClientPool::new(config, transporter(), registry(), Arc::new(NoService));
    let clients = pool.fetch(server.local_addr()).await.unwrap();
    assert_eq!(clients.len(), 2);
    assert!(!Arc::ptr_eq(&clients[0], &clients[1]));
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.channel_count(), 2);

    for client in &clients {
        client.release(Duration::from_millis(500)).await;
    }
    server.close(Duration::from_millis(500)).await;
}

#[rstest]
#[tokio::test]
async fn test_graceful_server_close_stops_new_requests(_setup: ()) {
    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;

    let mut client_config = quiet_config();
    client_config.client.reconnect = false;
    let client = connect_client(server.local_addr(), client_config).await;

    let future = client.request(echo_invocation(b"before")).await.unwrap();
    assert!(future.wait().await.is_ok());

    server.close(Duration::from_millis(500)).await;
    time::sleep(Duration::from_millis(300)).await;

    // the channel saw the readonly notice or the close, either way no
    // new two-way request goes out
    match client.request(echo_invocation(b"after")).await {
        Err(AppError::ChannelInactive(_)) => {}
        Ok(future) => assert!(future.wait().await.is_err()),
        Err(other) => panic!("unexpected error: {:?}", other),
    }

    client.close(Duration::from_millis(500)).await;
}

/// Drives the documented wire scenario against a live server with a
/// raw socket: a 16-byte header with the request flag, two-way flag
/// and serialization id, request id 7, followed by the body, answered
/// by an OK response frame with id 7.
#[rstest]
#[tokio::test]
async fn test_fixed_wire_bytes_against_live_server(_setup: ()) {
    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;

    let serialization = registry().by_name("binary").unwrap();
    let mut body = BytesMut::new();
    serialization
        .encode_invocation(&echo_invocation(b"ok"), &mut body)
        .unwrap();

    let mut frame = BytesMut::new();
    frame.put_slice(&[0xda, 0xbb]);
    frame.put_u8(0x80 | 0x40 | serialization.content_type_id());
    frame.put_u8(0x00);
    frame.put_u64(7);
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);

    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
    socket.write_all(&frame).await.unwrap();
    socket.flush().await.unwrap();

    // read the response frame back: header first, then the body
    let mut header = [0u8; 16];
    socket.read_exact(&mut header).await.unwrap();
    assert_eq!(&header[0..2], &[0xda, 0xbb]);
    let flag = header[2];
    assert_eq!(flag & 0x80, 0, "responses carry no request flag");
    assert_eq!(header[3], 20, "status byte should be OK");
    let id = u64::from_be_bytes(header[4..12].try_into().unwrap());
    assert_eq!(id, 7);
    let body_len = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;
    let mut response_body = vec![0u8; body_len];
    socket.read_exact(&mut response_body).await.unwrap();

    let mut remaining = BytesMut::from(&response_body[..]);
    let result = serialization.decode_result(&mut remaining).unwrap();
    assert_eq!(result.value, Some(Bytes::from_static(b"ok")));

    server.close(Duration::from_millis(500)).await;
}

/// Junk bytes ahead of a valid frame are skipped by the magic resync
/// and the frame still gets its response.
#[rstest]
#[tokio::test]
async fn test_text_garbage_then_frame_on_one_connection(_setup: ()) {
    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;

    let serialization = registry().by_name("binary").unwrap();
    let mut body = BytesMut::new();
    serialization
        .encode_invocation(&echo_invocation(b"ok"), &mut body)
        .unwrap();

    let mut bytes = BytesMut::new();
    bytes.put_slice(b"status\r\n");
    bytes.put_slice(&[0xda, 0xbb]);
    bytes.put_u8(0x80 | 0x40 | serialization.content_type_id());
    bytes.put_u8(0x00);
    bytes.put_u64(11);
    bytes.put_u32(body.len() as u32);
    bytes.put_slice(&body);

    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
    socket.write_all(&bytes).await.unwrap();
    socket.flush().await.unwrap();

    let mut header = [0u8; 16];
    socket.read_exact(&mut header).await.unwrap();
    let id = u64::from_be_bytes(header[4..12].try_into().unwrap());
    assert_eq!(id, 11);
    assert_eq!(header[3], 20);

    server.close(Duration::from_millis(500)).await;
}

/// Decoding a response stream through the public codec surface, the
/// way a foreign client implementation would.
#[rstest]
#[tokio::test]
async fn test_codec_reads_live_response_stream(_setup: ()) {
    use stonerpc::{ExchangeCodec, ProtocolConfig};

    let server = start_server(quiet_config(), Arc::new(EchoInvoker::default())).await;
    let codec = ExchangeCodec::new(&ProtocolConfig::default(), registry()).unwrap();

    let serialization = registry().by_name("binary").unwrap();
    let mut body = BytesMut::new();
    serialization
        .encode_invocation(&echo_invocation(b"ok"), &mut body)
        .unwrap();
    let mut frame = BytesMut::new();
    frame.put_slice(&[0xda, 0xbb]);
    frame.put_u8(0x80 | 0x40 | serialization.content_type_id());
    frame.put_u8(0x00);
    frame.put_u64(21);
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);

    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
    socket.write_all(&frame).await.unwrap();

    let mut buffer = BytesMut::with_capacity(4 * 1024);
    let response = loop {
        if let Some(DecodedFrame::Message(Message::Response(response))) =
            codec.decode(&mut buffer).unwrap()
        {
            break response;
        }
        if socket.read_buf(&mut buffer).await.unwrap() == 0 {
            panic!("server closed before answering");
        }
    };
    assert_eq!(response.id, 21);
    assert_eq!(response.status, Status::Ok);
    assert!(buffer.remaining() == 0);

    server.close(Duration::from_millis(500)).await;
}
