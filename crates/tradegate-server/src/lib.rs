#![doc = include_str!("../README.md")]

pub mod server;

pub use server::{
    config::{ConfigStore, EnvConfig},
    credentials::ServerCredentials,
    lifecycle::{
        DEFAULT_PROBE_WINDOW, DrainEscalation, DrainPolicy, ServiceServer, ServiceServerBuilder,
    },
    net::{find_free_port, is_private},
    pool::manager::WorkerPool,
    service::controller::{Controller, EchoController},
    transport::{StopHandle, TransportSecurity, TransportState},
};
