use core::{fmt, hint::black_box};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream::{FuturesUnordered, StreamExt};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::runtime::Builder;
use tonic::{codec::CompressionEncoding, transport::Channel};
use tradegate_core::proto::{CallRequest, Value, control_service_client::ControlServiceClient};
use tradegate_server::{EchoController, ServiceServer};

#[derive(Clone, Copy, Debug)]
enum Compression {
    None,
    Gzip,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl From<Compression> for Option<CompressionEncoding> {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => None,
            Compression::Gzip => Some(CompressionEncoding::Gzip),
            Compression::Zstd => Some(CompressionEncoding::Zstd),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CallBenchParams {
    concurrency: usize,
    compression: Compression,
}

fn server(max_workers: usize) -> ServiceServer {
    ServiceServer::builder(EchoController::new())
        .host("127.0.0.1")
        .max_workers(max_workers)
        .config(HashMap::<String, String>::new())
        .build()
        .expect("failed to build server")
}

fn restart_bench(c: &mut Criterion) {
    let mut server = server(4);
    server.start().expect("failed to start server");

    let mut group = c.benchmark_group("lifecycle");
    group.bench_function("stop_start", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                assert!(server.stop(None).wait(Some(Duration::from_secs(5))));
                server.start().expect("restart failed");
            }
            start.elapsed()
        });
    });
    group.finish();

    black_box(server.generation());
    server.shutdown(None).expect("teardown failed");
}

fn call_bench(c: &mut Criterion) {
    let mut server = server(32);
    server.start().expect("failed to start server");
    let endpoint = format!("http://{}", server.address());

    let concurrency_cases = [1, 8, 32];
    let compression_cases = [Compression::None, Compression::Zstd, Compression::Gzip];

    let mut cases = Vec::new();
    for &concurrency in &concurrency_cases {
        for &compression in &compression_cases {
            cases.push(CallBenchParams {
                concurrency,
                compression,
            });
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for params in &cases {
        let mut group = c.benchmark_group("grpc/call");
        group.throughput(Throughput::Elements(params.concurrency as u64));

        group.bench_function(
            format!(
                "conc/{}/comp/{}",
                params.concurrency, params.compression
            ),
            |b| {
                b.to_async(&rt).iter_custom(|iters| {
                    let endpoint = endpoint.clone();
                    async move {
                        let channel = Channel::from_shared(endpoint)
                            .expect("invalid endpoint")
                            .connect()
                            .await
                            .expect("Failed to connect to server");

                        let start = Instant::now();

                        for _ in 0..iters {
                            run_call_bench(&channel, params).await;
                        }

                        start.elapsed()
                    }
                });
            },
        );

        group.finish();
    }

    drop(rt);
    server.shutdown(None).expect("teardown failed");
}

async fn run_call_bench(channel: &Channel, params: &CallBenchParams) {
    let mut tasks = FuturesUnordered::new();

    for i in 0..params.concurrency {
        let channel = channel.clone();
        let compression = params.compression;

        tasks.push(tokio::spawn(async move {
            let mut client = ControlServiceClient::new(channel);
            if let Some(encoding) = compression.into() {
                client = client.accept_compressed(encoding).send_compressed(encoding)
            }

            let response = client
                .call(CallRequest {
                    function: "Sum".to_string(),
                    arguments: vec![Value::from(i as i64), Value::from(1i64)],
                })
                .await
                .expect("call failed")
                .into_inner();
            black_box(response.return_value);
        }));
    }

    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

criterion_group!(benches, restart_bench, call_bench);
criterion_main!(benches);
