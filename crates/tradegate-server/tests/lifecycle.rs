use std::{
    collections::HashMap,
    io::Write,
    net::TcpListener,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::{Builder, Runtime};
use tonic::{
    Code, Status,
    transport::{Certificate, Channel, ClientTlsConfig},
};
use tonic_health::pb::{
    HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
};
use tradegate_core::{
    Error,
    proto::{
        CallRequest, PingRequest, PingResponse, Value, control_service_client::ControlServiceClient,
    },
};
use tradegate_server::{
    EchoController, ServerCredentials, ServiceServer, ServiceServerBuilder, TransportSecurity,
    TransportState, WorkerPool,
};

const WAIT: Duration = Duration::from_secs(5);

fn builder() -> ServiceServerBuilder {
    ServiceServer::builder(EchoController::new())
        .host("127.0.0.1")
        .max_workers(4)
        .config(HashMap::<String, String>::new())
        .probe_window(Duration::from_millis(100))
}

/// Blocking gRPC client on its own runtime. Every call opens a fresh
/// connection so calls made after a restart reach the new transport.
struct Client {
    rt: Runtime,
    endpoint: String,
}

impl Client {
    fn new(server: &ServiceServer) -> Self {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let endpoint = format!("http://{}", server.local_addr().unwrap());
        Self { rt, endpoint }
    }

    async fn connect(endpoint: String) -> Result<ControlServiceClient<Channel>, Status> {
        ControlServiceClient::connect(endpoint)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))
    }

    fn call(&self, function: &str, arguments: Vec<Value>) -> Result<Value, Status> {
        let request = CallRequest {
            function: function.to_string(),
            arguments,
        };
        self.rt.block_on(async {
            let mut client = Self::connect(self.endpoint.clone()).await?;
            let response = client.call(request).await?.into_inner();
            Ok(response.return_value.unwrap_or_default())
        })
    }

    fn ping(&self) -> Result<PingResponse, Status> {
        self.rt.block_on(async {
            let mut client = Self::connect(self.endpoint.clone()).await?;
            let response = client
                .ping(PingRequest {
                    payload: "ping".to_string(),
                })
                .await?;
            Ok(response.into_inner())
        })
    }
}

#[test]
fn start_makes_the_server_reachable() {
    let mut server = builder().build().unwrap();
    assert_eq!(server.state(), TransportState::Bound);
    assert_eq!(server.generation(), 1);

    server.start().unwrap();
    assert!(server.is_running());
    assert_eq!(server.state(), TransportState::Running);

    let client = Client::new(&server);
    let pong = client.ping().unwrap();
    assert_eq!(pong.payload, "ping");
    assert_eq!(pong.controller, "echo");
    assert_eq!(pong.generation, 1);

    let echoed = client.call("Echo", vec![Value::from("hello")]).unwrap();
    assert_eq!(echoed.as_str(), Some("hello"));

    server.shutdown(None).unwrap();
}

#[test]
fn start_is_idempotent() {
    let mut server = builder().build().unwrap();
    server.start().unwrap();
    server.start().unwrap();

    assert_eq!(server.generation(), 1);
    assert_eq!(server.state(), TransportState::Running);
    assert!(Client::new(&server).ping().is_ok());

    server.shutdown(None).unwrap();
}

#[test]
fn stopped_server_drains_and_reports_not_running() {
    let mut server = builder().build().unwrap();
    server.start().unwrap();
    assert!(!server.wait_for_termination(Some(Duration::from_millis(50))));

    let handle = server.stop(None);
    assert!(handle.wait(Some(WAIT)));
    assert!(server.wait_for_termination(Some(Duration::ZERO)));
    assert!(!server.is_running());
    assert_eq!(server.state(), TransportState::Stopped);

    // A second stop observes the same termination.
    assert!(server.stop(None).is_terminated());

    server.shutdown(None).unwrap();
}

#[test]
fn restart_keeps_the_address_and_advances_the_generation() {
    let mut server = builder().port(0).build().unwrap();
    let port = server.port();
    let address = server.address().to_string();
    assert_ne!(port, 0);

    for generation in 1..=3 {
        server.start().unwrap();
        assert_eq!(server.generation(), generation);
        assert_eq!(server.port(), port);
        assert_eq!(server.address(), address);
        assert_eq!(Client::new(&server).ping().unwrap().generation, generation);
        assert!(server.stop(None).wait(Some(WAIT)));
    }

    server.shutdown(None).unwrap();
}

#[test]
fn port_in_use_fails_construction() {
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let err = builder().port(port).build().unwrap_err();
    assert!(matches!(err, Error::Bind { ref address, .. } if address == &format!("127.0.0.1:{port}")));
}

#[test]
fn garbage_tls_material_fails_construction() {
    let err = builder()
        .credentials(ServerCredentials::from_pem("not a certificate", "not a key"))
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Tls { .. }));
}

#[test]
fn tls_server_serves_across_restarts() {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.pem();

    let mut server = builder()
        .credentials(ServerCredentials::from_pem(&cert_pem, key_pair.serialize_pem()))
        .build()
        .unwrap();
    assert_eq!(server.transport_security(), Some(TransportSecurity::Tls));

    let rt = Builder::new_current_thread().enable_all().build().unwrap();
    let endpoint = format!("https://{}", server.local_addr().unwrap());
    let ping = |endpoint: String| -> Result<PingResponse, Status> {
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&cert_pem))
            .domain_name("localhost");
        rt.block_on(async {
            let channel = Channel::from_shared(endpoint)
                .unwrap()
                .tls_config(tls)
                .unwrap()
                .connect()
                .await
                .map_err(|e| Status::unavailable(e.to_string()))?;
            let response = ControlServiceClient::new(channel)
                .ping(PingRequest {
                    payload: "secure".to_string(),
                })
                .await?;
            Ok(response.into_inner())
        })
    };

    for generation in 1..=2 {
        server.start().unwrap();
        assert_eq!(server.transport_security(), Some(TransportSecurity::Tls));
        let pong = ping(endpoint.clone()).unwrap();
        assert_eq!(pong.payload, "secure");
        assert_eq!(pong.generation, generation);
        assert!(server.stop(None).wait(Some(WAIT)));
    }

    server.shutdown(None).unwrap();
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn build_capturing_logs(builder: ServiceServerBuilder) -> (ServiceServer, String) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let server = tracing::subscriber::with_default(subscriber, || builder.build()).unwrap();
    let logs = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
    (server, logs)
}

#[test]
fn insecure_bind_to_all_interfaces_warns() {
    let (mut server, logs) = build_capturing_logs(builder().host("0.0.0.0"));
    assert_eq!(
        server.transport_security(),
        Some(TransportSecurity::Insecure { private: false })
    );
    assert!(logs.contains("WARN"));
    assert!(logs.contains(&format!(
        "Adding insecure port {} to server, but the address is not private",
        server.address()
    )));
    server.shutdown(None).unwrap();
}

#[test]
fn insecure_bind_to_loopback_does_not_warn() {
    let (mut server, logs) = build_capturing_logs(builder());
    assert_eq!(
        server.transport_security(),
        Some(TransportSecurity::Insecure { private: true })
    );
    assert!(!logs.contains("not private"));
    server.shutdown(None).unwrap();
}

#[test]
fn auto_port_is_logged() {
    let (mut server, logs) = build_capturing_logs(builder());
    assert!(logs.contains(&format!(
        "Using one of the free ports, final address would be {}",
        server.address()
    )));
    server.shutdown(None).unwrap();
}

#[test]
fn request_errors_reach_the_client() {
    let mut server = builder().build().unwrap();
    server.start().unwrap();
    let client = Client::new(&server);

    let status = client.call("DoesNotExist", vec![]).unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let status = client.call("", vec![]).unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let sum = client
        .call("Sum", vec![Value::from(1i64), Value::from(2.5)])
        .unwrap();
    assert_eq!(sum.as_f64(), Some(3.5));

    server.shutdown(None).unwrap();
}

#[test]
fn stop_cancels_calls_that_outlive_the_grace_period() {
    let mut server = builder().build().unwrap();
    server.start().unwrap();

    let endpoint = format!("http://{}", server.local_addr().unwrap());
    let in_flight = thread::spawn(move || {
        let client = Client {
            rt: Builder::new_current_thread().enable_all().build().unwrap(),
            endpoint,
        };
        client.call("Delay", vec![Value::from(1_500i64)])
    });

    // Let the call reach the controller.
    thread::sleep(Duration::from_millis(300));
    let started = Instant::now();
    let handle = server.stop(Some(Duration::from_millis(200)));

    // New connections are refused once the transport is stopping.
    assert!(Client::new(&server).ping().is_err());

    let status = in_flight.join().unwrap().unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
    assert!(handle.wait(Some(WAIT)));
    assert!(started.elapsed() < Duration::from_millis(1_500));

    server.shutdown(None).unwrap();
}

#[test]
fn stop_lets_short_calls_finish_within_the_grace_period() {
    let mut server = builder().build().unwrap();
    server.start().unwrap();

    let endpoint = format!("http://{}", server.local_addr().unwrap());
    let in_flight = thread::spawn(move || {
        let client = Client {
            rt: Builder::new_current_thread().enable_all().build().unwrap(),
            endpoint,
        };
        client.call("Delay", vec![Value::from(300i64)])
    });

    thread::sleep(Duration::from_millis(100));
    let handle = server.stop(Some(WAIT));

    let value = in_flight.join().unwrap().unwrap();
    assert_eq!(value.as_i64(), Some(300));
    assert!(handle.wait(Some(WAIT)));

    server.shutdown(None).unwrap();
}

#[test]
fn health_service_tracks_the_lifecycle() {
    let mut server = builder().build().unwrap();
    server.start().unwrap();

    let rt = Builder::new_current_thread().enable_all().build().unwrap();
    let endpoint = format!("http://{}", server.local_addr().unwrap());
    let status = rt.block_on(async {
        let channel = Channel::from_shared(endpoint).unwrap().connect().await.unwrap();
        let mut client = HealthClient::new(channel);
        let deadline = Instant::now() + WAIT;
        loop {
            let status = client
                .check(HealthCheckRequest {
                    service: "tradegate.ControlService".to_string(),
                })
                .await
                .map(|r| r.into_inner().status);
            match status {
                Ok(s) if s == ServingStatus::Serving as i32 => break s,
                _ if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => panic!("service never became healthy: {other:?}"),
            }
        }
    });
    assert_eq!(status, ServingStatus::Serving as i32);

    server.shutdown(None).unwrap();
}

#[test]
fn servers_can_share_an_external_pool() {
    let pool = WorkerPool::new(4).unwrap();
    let mut first = builder().worker_pool(pool.clone()).build().unwrap();
    let mut second = builder().worker_pool(pool.clone()).build().unwrap();
    first.start().unwrap();
    second.start().unwrap();

    assert!(first.stop(None).wait(Some(WAIT)));
    first.shutdown(None).unwrap();
    drop(first);

    assert!(!pool.is_shutdown());
    assert!(second.is_running());
    assert_eq!(Client::new(&second).ping().unwrap().generation, 1);

    second.shutdown(None).unwrap();
    drop(second);
    assert!(!pool.is_shutdown());
    assert!(pool.shutdown(true));
}

#[test]
fn dropping_a_running_server_releases_its_port() {
    let mut server = builder().build().unwrap();
    server.start().unwrap();
    let port = server.port();
    drop(server);

    let deadline = Instant::now() + WAIT;
    loop {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(_) => break,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("port {port} was never released: {e}"),
        }
    }
}
