use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tunnel_relay::executor::TokioExecutor;
use tunnel_relay::messages::{self, ClientToServer, ServerToClient};
use tunnel_relay::reactor::EventRegistrar;
use tunnel_relay::{dispatch, ListenContext, ListenRegistry, ListenService, TcpListenConfig};

struct Relay {
	registry: Arc<ListenRegistry>,
	service: Arc<ListenService>,
	service_addr: SocketAddr,
}

async fn relay(registrar: Option<Arc<dyn EventRegistrar>>) -> Relay {
	let registry = ListenRegistry::new();
	let context = ListenContext {
		executor: Arc::new(TokioExecutor::current()),
		registrar: registrar.clone(),
		registry: registry.clone(),
	};
	let config = TcpListenConfig {
		bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
		multiplexable: registrar.is_some(),
		sweep_interval: Duration::from_millis(200),
		part_wait_timeout: Duration::from_secs(5),
		runtime: tokio::runtime::Handle::current(),
	};
	let service = ListenService::create(Arc::new(config), context).expect("create listen service");

	let service_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind service port");
	let service_addr = service_listener.local_addr().expect("service port addr");
	tokio::spawn(dispatch::serve(service_listener, registry.clone()));

	Relay { registry, service, service_addr }
}

async fn send_line(conn: &mut TcpStream, message: &ClientToServer) {
	conn.write_all(&messages::encode_line(message).expect("encode")).await.expect("send line");
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
	for _ in 0..300 {
		if condition() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	false
}

/// Plays the tunnel client: dials back for `key` and echoes upper-cased bytes.
async fn dial_back(service_addr: SocketAddr, listen_port: u16, key: String) {
	let mut back = TcpStream::connect(service_addr).await.expect("dial back");
	send_line(&mut back, &ClientToServer::Connect { listen_port, socket_part_key: key }).await;
	let mut buf = [0_u8; 5];
	back.read_exact(&mut buf).await.expect("read relayed bytes");
	back.write_all(&buf.to_ascii_uppercase()).await.expect("write reply");
}

async fn full_round_trip(relay: &Relay) {
	let listen_port = relay.service.listen_port();
	let mut control = TcpStream::connect(relay.service_addr).await.expect("connect control");
	send_line(&mut control, &ClientToServer::Control { listen_port }).await;
	assert!(eventually(|| relay.service.is_alive() && relay.service.has_control()).await);
	let mut control = BufReader::new(control);

	let mut external = TcpStream::connect((Ipv4Addr::LOCALHOST, listen_port)).await.expect("connect external");

	let mut line = String::new();
	control.read_line(&mut line).await.expect("read client wait");
	let ServerToClient::ClientWait { socket_part_key } = messages::decode_line(&line).expect("decode client wait");
	assert!(socket_part_key.starts_with(&format!("SK-{}-", listen_port)));

	let client = tokio::spawn(dial_back(relay.service_addr, listen_port, socket_part_key.clone()));
	external.write_all(b"hello").await.expect("external write");
	let mut reply = [0_u8; 5];
	external.read_exact(&mut reply).await.expect("external read");
	assert_eq!(&reply, b"HELLO");
	client.await.expect("tunnel client");
	assert!(relay.service.socket_part_keys().contains(&socket_part_key));

	drop(external);
	assert!(eventually(|| relay.service.socket_part_keys().is_empty()).await);

	drop(control);
	assert!(eventually(|| !relay.service.is_alive()).await);
	assert!(!relay.service.has_control());
	assert!(relay.registry.contains(listen_port));

	let registry = relay.registry.clone();
	tokio::task::spawn_blocking(move || registry.cancel_all()).await.expect("cancel all");
	assert!(relay.service.is_canceled());
	assert!(relay.registry.ports().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relays_through_accept_thread() {
	let relay = relay(None).await;
	full_round_trip(&relay).await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relays_through_event_registrar() {
	let reactor = tunnel_relay::reactor::Reactor::start().expect("start reactor");
	let registrar: Arc<dyn EventRegistrar> = reactor.clone();
	let relay = relay(Some(registrar)).await;
	full_round_trip(&relay).await;
	reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_connection_without_tunnel_client_is_closed() {
	let relay = relay(None).await;
	relay.service.start().expect("start");

	let mut external = TcpStream::connect((Ipv4Addr::LOCALHOST, relay.service.listen_port()))
		.await
		.expect("connect external");
	let mut buf = [0_u8; 1];
	let read = tokio::time::timeout(Duration::from_secs(5), external.read(&mut buf))
		.await
		.expect("closed in time");
	assert!(matches!(read, Ok(0) | Err(_)));
	assert!(relay.service.socket_part_keys().is_empty());
	assert!(relay.service.is_alive());

	let service = relay.service.clone();
	tokio::task::spawn_blocking(move || service.cancel()).await.expect("cancel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_key_is_refused() {
	let relay = relay(None).await;
	let listen_port = relay.service.listen_port();

	let mut back = TcpStream::connect(relay.service_addr).await.expect("dial back");
	send_line(&mut back, &ClientToServer::Connect { listen_port, socket_part_key: format!("SK-{}-99-0", listen_port) }).await;
	let mut buf = [0_u8; 1];
	let read = tokio::time::timeout(Duration::from_secs(5), back.read(&mut buf))
		.await
		.expect("closed in time");
	assert!(matches!(read, Ok(0) | Err(_)));
	assert!(relay.service.socket_part_keys().is_empty());

	let service = relay.service.clone();
	tokio::task::spawn_blocking(move || service.cancel()).await.expect("cancel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_dial_back_leaves_the_relay_alone() {
	let relay = relay(None).await;
	let listen_port = relay.service.listen_port();
	let mut control = TcpStream::connect(relay.service_addr).await.expect("connect control");
	send_line(&mut control, &ClientToServer::Control { listen_port }).await;
	assert!(eventually(|| relay.service.is_alive() && relay.service.has_control()).await);
	let mut control = BufReader::new(control);

	let mut external = TcpStream::connect((Ipv4Addr::LOCALHOST, listen_port)).await.expect("connect external");
	let mut line = String::new();
	control.read_line(&mut line).await.expect("read client wait");
	let ServerToClient::ClientWait { socket_part_key } = messages::decode_line(&line).expect("decode client wait");

	let mut back = TcpStream::connect(relay.service_addr).await.expect("dial back");
	send_line(&mut back, &ClientToServer::Connect { listen_port, socket_part_key: socket_part_key.clone() }).await;
	external.write_all(b"first").await.expect("external write");
	let mut buf = [0_u8; 5];
	back.read_exact(&mut buf).await.expect("relayed before duplicate");
	assert_eq!(&buf, b"first");

	let mut duplicate = TcpStream::connect(relay.service_addr).await.expect("dial back again");
	send_line(&mut duplicate, &ClientToServer::Connect { listen_port, socket_part_key: socket_part_key.clone() }).await;
	let mut closed = [0_u8; 1];
	let read = tokio::time::timeout(Duration::from_secs(5), duplicate.read(&mut closed))
		.await
		.expect("duplicate closed in time");
	assert!(matches!(read, Ok(0) | Err(_)));

	external.write_all(b"again").await.expect("external write after duplicate");
	back.read_exact(&mut buf).await.expect("relayed after duplicate");
	assert_eq!(&buf, b"again");
	back.write_all(b"reply").await.expect("client reply");
	external.read_exact(&mut buf).await.expect("external read");
	assert_eq!(&buf, b"reply");
	assert!(relay.service.socket_part_keys().contains(&socket_part_key));

	let service = relay.service.clone();
	tokio::task::spawn_blocking(move || service.cancel()).await.expect("cancel");
}
