//! cgminer-style JSON-over-TCP client
//!
//! One request per connection: connect, write the JSON request, read until
//! the miner closes the socket. Responses are usually NUL-terminated, and
//! some Antminer firmware concatenates objects without a separator
//! (`}{`), so the raw bytes are cleaned up before parsing.

use super::{AsicApi, AsicEndpoint, AsicKind};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Miner API client with a per-request time bound
#[derive(Debug, Clone)]
pub struct CgminerClient {
    timeout: Duration,
}

impl CgminerClient {
    /// Create a new client
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Encode a request for the given miner kind
    pub fn encode_request(kind: AsicKind, command: &str) -> String {
        let mut request = Map::new();
        request.insert(kind.request_key().to_string(), Value::from(command));
        Value::Object(request).to_string()
    }

    /// Decode a raw response into JSON
    pub fn decode_response(bytes: &[u8]) -> Result<Value> {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());

        if text.is_empty() {
            return Err(Error::protocol("empty response"));
        }

        match serde_json::from_str::<Value>(text) {
            Ok(value) => Ok(value),
            Err(first) => serde_json::from_str(&text.replace("}{", "},{"))
                .map_err(|_| Error::protocol(format!("invalid JSON response: {}", first))),
        }
    }

    async fn exchange(&self, address: &str, request: &str) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::network(format!("cannot connect to {}: {}", address, e)))?;

        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(response)
    }
}

#[async_trait]
impl AsicApi for CgminerClient {
    #[instrument(skip(self, endpoint), fields(asic = %endpoint.name))]
    async fn query(&self, endpoint: &AsicEndpoint, command: &str) -> Result<Value> {
        let address = endpoint.address();
        let request = Self::encode_request(endpoint.kind, command);

        let bytes = timeout(self.timeout, self.exchange(&address, &request))
            .await
            .map_err(|_| Error::timeout(format!("{} request to {}", command, address)))??;

        debug!("Received {} bytes for {}", bytes.len(), command);
        Self::decode_response(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    fn endpoint(kind: AsicKind, port: u16) -> AsicEndpoint {
        AsicEndpoint {
            name: "test".to_string(),
            kind,
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Accept one connection, capture the request, answer with `response`
    async fn serve_once(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (port, handle)
    }

    #[test]
    fn test_encode_request() {
        assert_eq!(
            CgminerClient::encode_request(AsicKind::Antminer, "stats"),
            r#"{"command":"stats"}"#
        );
        assert_eq!(
            CgminerClient::encode_request(AsicKind::Whatsminer, "summary"),
            r#"{"cmd":"summary"}"#
        );
    }

    #[test]
    fn test_decode_strips_nul_terminator() {
        let value = CgminerClient::decode_response(b"{\"STATUS\":[{\"STATUS\":\"S\"}]}\0").unwrap();
        assert_eq!(value["STATUS"][0]["STATUS"], "S");
    }

    #[test]
    fn test_decode_repairs_concatenated_objects() {
        let raw = b"{\"STATS\":[{\"BMMiner\":\"2.0.0\"}{\"ID\":\"BC50\",\"temp1\":62}],\"id\":1}\0";
        let value = CgminerClient::decode_response(raw).unwrap();
        assert_eq!(value["STATS"][1]["temp1"], 62);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_matches!(CgminerClient::decode_response(b"\0\0"), Err(Error::Protocol { .. }));
        assert_matches!(CgminerClient::decode_response(b"not json"), Err(Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let (port, server) = serve_once(b"{\"SUMMARY\":[{\"MHS av\":110000000.0}]}\0").await;
        let client = CgminerClient::new(Duration::from_secs(2));

        let value = client
            .query(&endpoint(AsicKind::Whatsminer, port), "summary")
            .await
            .unwrap();

        assert_eq!(value["SUMMARY"][0]["MHS av"], 110000000.0);
        assert_eq!(server.await.unwrap(), r#"{"cmd":"summary"}"#);
    }

    #[tokio::test]
    async fn test_query_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = CgminerClient::new(Duration::from_secs(2));
        let result = client.query(&endpoint(AsicKind::Antminer, port), "stats").await;
        assert_matches!(result, Err(Error::Network { .. }));
    }

    #[tokio::test]
    async fn test_query_times_out_on_silent_miner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = CgminerClient::new(Duration::from_millis(100));
        let result = client.query(&endpoint(AsicKind::Antminer, port), "devs").await;
        assert_matches!(result, Err(Error::Timeout { .. }));
    }
}
