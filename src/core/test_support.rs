//! In-process HTTP server for exercising the bot and Drive clients

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A minimal mock HTTP server built on tokio that returns canned responses.
pub struct MockHttpServer {
    listener: TcpListener,
    pub base_url: String,
}

impl MockHttpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let port = listener.local_addr().unwrap().port();
        let base_url = format!("http://127.0.0.1:{port}");
        Self { listener, base_url }
    }

    /// Accept one connection, answer it, and return the raw request.
    pub async fn respond_once(self, status_code: u16, body: impl Into<String>) -> String {
        self.respond_sequence(vec![(status_code, body.into())])
            .await
            .remove(0)
    }

    /// Answer one connection per canned response, in order.
    pub async fn respond_sequence(self, responses: Vec<(u16, String)>) -> Vec<String> {
        let mut requests = Vec::new();
        for (status_code, body) in responses {
            let (mut stream, _) = self.listener.accept().await.unwrap();
            requests.push(read_request(&mut stream).await);

            let response = format!(
                "HTTP/1.1 {status_code} Mock\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 \r\n\
                 {body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        }
        requests
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 16 * 1024];

    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
        let body_len = buf.len() - header_end - 4;

        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());

        match content_length {
            Some(len) if body_len >= len => break,
            Some(_) => continue,
            None if headers.contains("transfer-encoding: chunked") => {
                if buf.ends_with(b"0\r\n\r\n") {
                    break;
                }
            }
            None => break,
        }
    }

    String::from_utf8_lossy(&buf).to_string()
}
