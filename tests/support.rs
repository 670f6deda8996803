use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use myrpc::{Server, Service};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Args {
    pub num1: i32,
    pub num2: i32,
}

/// Installs a stderr subscriber once per test binary so server-side logs
/// show up under `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn foo_service() -> Service {
    Service::new("Foo")
        .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
        .method("Sleep", |args: Args| async move {
            tokio::time::sleep(Duration::from_secs(args.num1 as u64)).await;
            Ok(args.num1 + args.num2)
        })
}

pub fn bar_service() -> Service {
    Service::new("Bar").method("Timeout", |_: i32| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(0_i32)
    })
}

/// Starts a server with the demo services on a loopback port and serves
/// it in the background for the rest of the test.
pub async fn start_server() -> (SocketAddr, Arc<Server>) {
    init_tracing();
    let server = Arc::new(Server::new());
    server.register(foo_service()).expect("register Foo");
    server.register(bar_service()).expect("register Bar");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    let accepting = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = accepting.accept(listener).await;
    });
    (addr, server)
}
