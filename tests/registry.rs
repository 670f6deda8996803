use std::sync::Arc;
use std::time::{Duration, Instant};

mod support;

use myrpc::registry::{self, DEFAULT_PATH, SERVERS_HEADER, SERVER_HEADER};
use myrpc::{
    Discovery, MultiServersDiscovery, Options, Registry, RegistryDiscovery, SelectMode, XClient,
};

use support::{start_server, Args};

async fn start_registry(timeout: Duration) -> (String, Arc<Registry>) {
    support::init_tracing();
    let reg = Arc::new(Registry::new(timeout));
    let router = reg.http_router(DEFAULT_PATH);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{addr}{DEFAULT_PATH}"), reg)
}

#[tokio::test]
async fn post_then_get_round_trips_a_server() {
    let (url, _registry) = start_registry(Duration::from_secs(60)).await;
    let http = reqwest::Client::new();

    let response = http
        .post(&url)
        .header(SERVER_HEADER, "tcp@127.0.0.1:9001")
        .send()
        .await
        .expect("heartbeat POST");
    assert_eq!(response.status().as_u16(), 200);

    let response = http.get(&url).send().await.expect("GET alive servers");
    assert_eq!(response.status().as_u16(), 200);
    let servers = response
        .headers()
        .get(SERVERS_HEADER)
        .expect("servers header")
        .to_str()
        .expect("header text");
    assert!(servers.contains("tcp@127.0.0.1:9001"), "unexpected header: {servers:?}");
}

#[tokio::test]
async fn post_without_the_server_header_is_a_500() {
    let (url, _registry) = start_registry(Duration::from_secs(60)).await;
    let response = reqwest::Client::new().post(&url).send().await.expect("bare POST");
    assert_eq!(response.status().as_u16(), 500);
}

#[tokio::test]
async fn other_methods_are_rejected_with_405() {
    let (url, _registry) = start_registry(Duration::from_secs(60)).await;
    let response = reqwest::Client::new().delete(&url).send().await.expect("DELETE");
    assert_eq!(response.status().as_u16(), 405);
}

#[tokio::test]
async fn discovery_refreshes_its_endpoints_from_the_registry() {
    let (url, registry) = start_registry(Duration::from_secs(60)).await;
    registry.put_server("tcp@127.0.0.1:9001");
    registry.put_server("tcp@127.0.0.1:9002");

    let discovery = RegistryDiscovery::new(&url, Duration::ZERO);
    let mut all = discovery.get_all().await.expect("get_all");
    all.sort();
    assert_eq!(
        all,
        vec!["tcp@127.0.0.1:9001".to_string(), "tcp@127.0.0.1:9002".to_string()]
    );
}

#[tokio::test]
async fn xclient_balances_calls_over_a_static_endpoint_set() {
    let (addr1, _server1) = start_server().await;
    let (addr2, _server2) = start_server().await;
    let discovery =
        MultiServersDiscovery::new(vec![format!("tcp@{addr1}"), format!("tcp@{addr2}")]);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    for i in 0..4 {
        let reply: i32 = xclient.call("Foo.Sum", &Args { num1: i, num2: i }).await.expect("call");
        assert_eq!(reply, i + i);
    }
    xclient.close().await.expect("close");
}

#[tokio::test]
async fn heartbeating_servers_are_visible_to_broadcast() {
    let (url, _registry) = start_registry(Duration::from_secs(60)).await;
    let (addr1, _server1) = start_server().await;
    let (addr2, _server2) = start_server().await;
    registry::heartbeat(&url, &format!("tcp@{addr1}"), Duration::ZERO)
        .await
        .expect("first heartbeat");
    registry::heartbeat(&url, &format!("tcp@{addr2}"), Duration::ZERO)
        .await
        .expect("second heartbeat");

    let discovery = RegistryDiscovery::new(&url, Duration::ZERO);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let reply: i32 =
        xclient.broadcast("Foo.Sum", &Args { num1: 2, num2: 4 }).await.expect("broadcast");
    assert_eq!(reply, 6);
    xclient.close().await.expect("close");
}

#[tokio::test]
async fn broadcast_deadline_cancels_the_remaining_sub_calls() {
    let (url, _registry) = start_registry(Duration::from_secs(60)).await;
    let (addr1, _server1) = start_server().await;
    let (addr2, _server2) = start_server().await;
    registry::heartbeat(&url, &format!("tcp@{addr1}"), Duration::ZERO)
        .await
        .expect("first heartbeat");
    registry::heartbeat(&url, &format!("tcp@{addr2}"), Duration::ZERO)
        .await
        .expect("second heartbeat");

    let discovery = RegistryDiscovery::new(&url, Duration::ZERO);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    // Foo.Sleep(5) runs well past the shared deadline on every endpoint
    let started = Instant::now();
    let err = xclient
        .broadcast_timeout::<_, i32>(
            Some(Duration::from_secs(2)),
            "Foo.Sleep",
            &Args { num1: 5, num2: 25 },
        )
        .await
        .expect_err("expected the shared deadline to fire");
    assert!(err.to_string().contains("deadline has elapsed"), "unexpected error: {err:?}");
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "broadcast should cancel promptly, took {:?}",
        started.elapsed()
    );
    xclient.close().await.expect("close");
}
