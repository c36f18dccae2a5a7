//! Test utilities and fixtures for bci-hub
//!
//! Hubs started here bind an ephemeral port and use a short clock sync so
//! the integration tests stay fast.

#![allow(dead_code)]

use bci_hub::hub::frame::encode_frame;
use bci_hub::hub::{ClientConfig, HubClient, HubConfig, HubServer};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const TEST_KEY: &str = "12345678";

/// Hub configuration with a quick echo exchange
pub fn hub_config() -> HubConfig {
    HubConfig {
        port: 0,
        key: TEST_KEY.to_string(),
        echo_probes: 3,
        echo_interval_ms: 1,
        echo_timeout_ms: 200,
        handshake_timeout_ms: 2000,
        response_timeout_ms: 300,
        ..HubConfig::default()
    }
}

pub async fn start_hub(config: HubConfig) -> HubServer {
    HubServer::start(config).await.expect("Failed to start hub")
}

/// Client configuration pointing at `hub`, keep-alives off
pub fn client_config(hub: &HubServer, path: &str, uid: &str) -> ClientConfig {
    ClientConfig {
        port: hub.local_addr().port(),
        key: TEST_KEY.to_string(),
        keep_alive_secs: 0,
        sync_timeout_ms: 5000,
        response_timeout_ms: 300,
        ..ClientConfig::new(path, uid)
    }
}

pub async fn connect(hub: &HubServer, path: &str, uid: &str) -> HubClient {
    HubClient::connect(client_config(hub, path, uid))
        .await
        .expect("Failed to connect client")
}

/// Raw TCP connection that has written `secret` and one identity frame
pub async fn raw_hello(hub: &HubServer, secret: &[u8], identity: &str) -> TcpStream {
    let mut stream = TcpStream::connect(hub.local_addr())
        .await
        .expect("Failed to connect");
    stream.write_all(secret).await.unwrap();
    stream
        .write_all(&encode_frame(identity.as_bytes()))
        .await
        .unwrap();
    stream.flush().await.unwrap();
    stream
}

/// True when the peer closed the stream without sending a single byte
pub async fn closed_silently(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

/// Wait for an async condition with timeout
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_config_is_valid() {
        assert!(hub_config().validate().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let ok = wait_for(|| async { false }, Duration::from_millis(50)).await;
        assert!(!ok);
        assert!(wait_for(|| async { true }, Duration::from_millis(50)).await);
    }
}
