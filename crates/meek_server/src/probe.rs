//! Network stream prober. The worker-side media stack is out of scope,
//! so liveness is judged at the protocol level: an RTSP OPTIONS exchange
//! for rtsp:// sources, an HTTP GET for http(s) sources, a bare TCP
//! connect for anything else with a host:port.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use meek_core::ports::StreamProber;

pub struct NetworkStreamProber {
    http: reqwest::Client,
    timeout: Duration,
}

impl NetworkStreamProber {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, timeout }
    }

    async fn probe_rtsp(&self, url: &str) -> bool {
        let Some(addr) = rtsp_addr(url) else {
            return false;
        };
        let connect = tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await;
        let Ok(Ok(mut stream)) = connect else {
            return false;
        };
        let request = format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\nUser-Agent: meek\r\n\r\n");
        if stream.write_all(request.as_bytes()).await.is_err() {
            return false;
        }
        let mut buf = [0u8; 64];
        match tokio::time::timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => buf.starts_with(b"RTSP/"),
            _ => false,
        }
    }

    async fn probe_http(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
            Err(_) => false,
        }
    }

    async fn probe_tcp(&self, url: &str) -> bool {
        let Some(addr) = host_port(url) else {
            return false;
        };
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl StreamProber for NetworkStreamProber {
    async fn probe(&self, url: &str) -> bool {
        if url.starts_with("rtsp://") {
            self.probe_rtsp(url).await
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.probe_http(url).await
        } else {
            self.probe_tcp(url).await
        }
    }
}

fn rtsp_addr(url: &str) -> Option<String> {
    let rest = url.strip_prefix("rtsp://")?;
    let authority = rest.split('/').next()?;
    // Strip credentials if present.
    let host_part = authority.rsplit('@').next()?;
    if host_part.is_empty() {
        return None;
    }
    Some(if host_part.contains(':') {
        host_part.to_string()
    } else {
        format!("{host_part}:554")
    })
}

fn host_port(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let authority = rest.split('/').next()?;
    let host_part = authority.rsplit('@').next()?;
    if host_part.is_empty() || !host_part.contains(':') {
        return None;
    }
    Some(host_part.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtsp_addr_defaults_port_554() {
        assert_eq!(rtsp_addr("rtsp://cam.local/stream1").as_deref(), Some("cam.local:554"));
        assert_eq!(rtsp_addr("rtsp://cam.local:8554/s").as_deref(), Some("cam.local:8554"));
        assert_eq!(
            rtsp_addr("rtsp://user:pw@cam.local/s").as_deref(),
            Some("cam.local:554")
        );
        assert!(rtsp_addr("http://cam.local/s").is_none());
    }

    #[test]
    fn test_host_port_requires_explicit_port() {
        assert_eq!(host_port("tcp://10.0.0.1:9000/x").as_deref(), Some("10.0.0.1:9000"));
        assert!(host_port("tcp://10.0.0.1/x").is_none());
    }
}
