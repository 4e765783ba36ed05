//! HTTP CONNECT upgrade for the server.
//!
//! A server in HTTP mode shares its port with a minimal HTTP surface:
//! `CONNECT` on the RPC path hijacks the raw stream into the normal
//! RPC loop, any other method on that path gets `405`, and the debug
//! path serves a small HTML page listing registered services and
//! their call counts.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::codec::Connection;
use crate::server::Server;

/// Path carrying RPC traffic in HTTP mode.
pub const DEFAULT_RPC_PATH: &str = "/_wirecall_";

/// Path of the debug page in HTTP mode.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/wirecall";

/// Status sentinel a client must see before speaking RPC.
pub const CONNECTED: &str = "200 Connected to wirecall";

impl Server {
    /// Accept connections in HTTP mode, serving each in its own task.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    tokio::spawn(self.clone().serve_http_conn(stream));
                }
                Err(e) => {
                    tracing::error!("rpc server: accept error: {}", e);
                    return;
                }
            }
        }
    }

    /// Answer one HTTP/1.0 request head, upgrading CONNECTs on the
    /// RPC path into the RPC loop.
    pub async fn serve_http_conn<S>(self: Arc<Self>, stream: S)
    where
        S: Connection + 'static,
    {
        let mut stream = BufReader::new(stream);

        let mut request_line = String::new();
        match stream.read_line(&mut request_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();

        // Drain the header block; none of the headers matter here.
        loop {
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) if line == "\r\n" || line == "\n" => break,
                Ok(_) => {}
            }
        }

        let response = match (method.as_str(), path.as_str()) {
            ("CONNECT", DEFAULT_RPC_PATH) => {
                let hello = format!("HTTP/1.0 {}\r\n\r\n", CONNECTED);
                if stream.write_all(hello.as_bytes()).await.is_err() {
                    return;
                }
                self.serve_conn(stream).await;
                return;
            }
            (_, DEFAULT_RPC_PATH) => {
                "HTTP/1.0 405 Method Not Allowed\r\n\
                 Content-Type: text/plain; charset=utf-8\r\n\r\n\
                 405 must CONNECT\n"
                    .to_string()
            }
            ("GET", DEFAULT_DEBUG_PATH) => {
                let body = self.debug_html();
                format!(
                    "HTTP/1.0 200 OK\r\n\
                     Content-Type: text/html; charset=utf-8\r\n\
                     Content-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )
            }
            _ => "HTTP/1.0 404 Not Found\r\n\r\n".to_string(),
        };

        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    /// Debug page body: every service, its methods, and call counts.
    fn debug_html(&self) -> String {
        let services = self.services.read().unwrap();
        let mut names: Vec<&String> = services.keys().collect();
        names.sort();

        let mut body = String::from("<html><body><title>wirecall services</title>\n");
        for name in names {
            let service = &services[name];
            body.push_str(&format!("<h2>Service {}</h2>\n<table>\n", name));
            body.push_str("<th align=left>Method</th><th align=center>Calls</th>\n");
            let mut methods: Vec<_> = service.methods().collect();
            methods.sort_by_key(|(m, _)| *m);
            for (method, entry) in methods {
                body.push_str(&format!(
                    "<tr><td align=left>{}.{}</td><td align=center>{}</td></tr>\n",
                    name,
                    method,
                    entry.num_calls()
                ));
            }
            body.push_str("</table>\n");
        }
        body.push_str("</body></html>\n");
        body
    }
}
