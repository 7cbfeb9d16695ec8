use greytrap_rs::config::Config;
use greytrap_rs::daemon::Daemon;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// A daemon configuration suitable for tests: loopback only, ephemeral
/// ports, in-memory store, no stutter so dialogues finish quickly.
pub async fn test_config() -> Config {
    let mut config = Config::default();
    config.server.bind_address = Some("127.0.0.1".to_string());
    config.server.port = free_port().await;
    config.server.config_port = free_port().await;
    config.server.hostname = Some("greytrap.test".to_string());
    config.server.stutter = 0;
    config.grey.stutter = 0;
    config.store.driver = "memory".to_string();
    config
}

/// Spawn a fully wired daemon and wait for its SMTP port to answer.
pub async fn spawn_daemon(config: Config) -> SocketAddr {
    let addr: SocketAddr = format!("127.0.0.1:{}", config.server.port)
        .parse()
        .unwrap();

    tokio::spawn(async move {
        if let Err(e) = Daemon::new(config).run().await {
            eprintln!("daemon exited with error: {e}");
        }
    });

    for _ in 0..100 {
        match TcpStream::connect(addr).await {
            Ok(probe) => {
                drop(probe);
                return addr;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }

    panic!("daemon did not start listening on {addr}");
}

/// Reserve an ephemeral port by binding and releasing it.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
