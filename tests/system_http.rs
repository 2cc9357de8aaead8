//! Live coverage for the administrative HTTP surface.

#![cfg(unix)]

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use seawire::{
    config::ServerConfig,
    module::ModuleLoader,
    outbound::FrameQueues,
    profile::Profiler,
    registry::{ConnectionId, ConnectionInfo, SessionRegistry},
    system_http::{SystemContext, SystemHttpServer},
};

async fn start_server(registry: Arc<SessionRegistry>) -> SystemHttpServer {
    let config = ServerConfig {
        system_http_bind: "127.0.0.1".to_owned(),
        system_http_port: 0,
        ..ServerConfig::default()
    };
    SystemHttpServer::start(
        &config,
        SystemContext {
            loader: ModuleLoader::new(),
            connections: registry,
            profiler: Arc::new(Profiler::new()),
        },
    )
    .await
    .expect("bind admin server")
}

async fn request(server: &SystemHttpServer, head: &str) -> String {
    let mut stream = TcpStream::connect(server.local_addr())
        .await
        .expect("connect");
    stream.write_all(head.as_bytes()).await.expect("send");
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("response within deadline")
        .expect("read response");
    response
}

async fn get(server: &SystemHttpServer, target: &str) -> String {
    request(
        server,
        &format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n"),
    )
    .await
}

#[tokio::test]
async fn modules_listing_is_csv_with_a_header_row() {
    let server = start_server(Arc::new(SessionRegistry::new())).await;
    let response = get(&server, "/sys/modules").await;

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("Content-Type: text/csv; charset=utf-8"));
    assert!(response.contains("real_path,base_addr,ref_count\r\n"));
}

#[tokio::test]
async fn connections_listing_reports_live_endpoints() {
    let registry = Arc::new(SessionRegistry::new());
    let (_queues, handle) = FrameQueues::bounded(1, 1);
    registry.insert(
        ConnectionId::from(1),
        ConnectionInfo {
            remote: "192.0.2.9:5555".parse().expect("addr"),
            local: "127.0.0.1:8900".parse().expect("addr"),
            connected_at: tokio::time::Instant::now(),
        },
        &handle,
    );

    let server = start_server(registry).await;
    let response = get(&server, "/sys/connections").await;

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("remote_ip,remote_port,local_ip,local_port,us_online\r\n"));
    assert!(response.contains("192.0.2.9,5555,127.0.0.1,8900,"));
}

#[tokio::test]
async fn non_get_verbs_are_rejected() {
    let server = start_server(Arc::new(SessionRegistry::new())).await;
    let response = request(
        &server,
        "POST /sys/modules HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed"), "{response}");
}

#[tokio::test]
async fn unknown_suffixes_and_foreign_paths_are_not_found() {
    let server = start_server(Arc::new(SessionRegistry::new())).await;
    assert!(get(&server, "/sys/reticulate").await.starts_with("HTTP/1.1 404"));
    assert!(get(&server, "/other/modules").await.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn load_module_without_a_name_is_a_bad_request() {
    let server = start_server(Arc::new(SessionRegistry::new())).await;
    assert!(get(&server, "/sys/load_module").await.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn load_module_with_a_bogus_name_is_not_found() {
    let server = start_server(Arc::new(SessionRegistry::new())).await;
    let response = get(&server, "/sys/load_module?name=%2Fnonexistent%2Flibnope.so").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
}

#[tokio::test]
async fn unload_module_of_an_unloaded_path_is_not_found() {
    let server = start_server(Arc::new(SessionRegistry::new())).await;
    let response = get(&server, "/sys/unload_module?real_path=/nonexistent/libnope.so").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
}

#[tokio::test]
async fn set_log_mask_accepts_numeric_parameters() {
    let server = start_server(Arc::new(SessionRegistry::new())).await;
    let before = seawire::logging::mask();
    let response = get(&server, "/sys/set_log_mask?to_disable=0&to_enable=0").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert_eq!(seawire::logging::mask(), before);

    let response = get(&server, "/sys/set_log_mask?to_enable=notanumber").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}

#[tokio::test]
async fn profile_listing_carries_recorded_sites() {
    let profiler = Arc::new(Profiler::new());
    {
        let _guard = profiler.enter("handle_request");
    }
    let config = ServerConfig {
        system_http_bind: "127.0.0.1".to_owned(),
        system_http_port: 0,
        ..ServerConfig::default()
    };
    let server = SystemHttpServer::start(
        &config,
        SystemContext {
            loader: ModuleLoader::new(),
            connections: Arc::new(SessionRegistry::new()),
            profiler,
        },
    )
    .await
    .expect("bind admin server");

    let response = get(&server, "/sys/profile").await;
    assert!(response.contains("file,line,func,samples,us_total,us_exclusive\r\n"));
    assert!(response.contains("handle_request"));
}
