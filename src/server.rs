//! RPC server: connection acceptance, option handshake, request
//! dispatch.
//!
//! Each connection is served by one reader loop plus one spawned
//! handler task per in-flight request; responses are serialized
//! through a per-connection send mutex, so handling is fully
//! concurrent and multiplexed by sequence id.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use wirecall::{Server, Service};
//!
//! let server = Arc::new(Server::new());
//! server.register(Service::new("Echo").method("Say", |s: String| async move {
//!     Ok::<String, String>(s)
//! }))?;
//!
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! tokio::spawn(server.clone().accept(listener));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::codec::{self, CodecReader, CodecWriter, Connection, Header};
use crate::error::{Result, WirecallError};
use crate::options::{Options, MAGIC_NUMBER};
use crate::service::{valid_service_name, Method, Service};

/// Write half of a connection's codec, shared by all of its handlers.
pub(crate) type SharedWriter = Arc<Mutex<Box<dyn CodecWriter>>>;

/// An RPC server holding the service registry.
///
/// The registry takes single-writer registration and many concurrent
/// readers during dispatch. Servers are shared behind an [`Arc`].
pub struct Server {
    pub(crate) services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    /// Create an empty server.
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service under its name.
    ///
    /// Fails if the name is invalid or a service with the same name is
    /// already registered; the registry is left unchanged on failure.
    pub fn register(&self, service: Service) -> Result<()> {
        if !valid_service_name(service.name()) {
            return Err(WirecallError::InvalidServiceName(service.name().to_string()));
        }

        let mut services = self.services.write().unwrap();
        if services.contains_key(service.name()) {
            return Err(WirecallError::ServiceAlreadyDefined(
                service.name().to_string(),
            ));
        }

        for (method, _) in service.methods() {
            tracing::debug!("rpc server: register {}.{}", service.name(), method);
        }
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Accept connections on a TCP listener, serving each in its own
    /// task. Returns when the listener fails.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    tokio::spawn(self.clone().serve_conn(stream));
                }
                Err(e) => {
                    tracing::error!("rpc server: accept error: {}", e);
                    return;
                }
            }
        }
    }

    /// Accept connections on a Unix socket listener.
    #[cfg(unix)]
    pub async fn accept_unix(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    tokio::spawn(self.clone().serve_conn(stream));
                }
                Err(e) => {
                    tracing::error!("rpc server: accept error: {}", e);
                    return;
                }
            }
        }
    }

    /// Serve one connection until the client hangs up.
    ///
    /// Reads the option document from the stream head, validates the
    /// magic number, selects the codec, then runs the request loop.
    /// Handshake failures drop the connection silently.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: Connection + 'static,
    {
        let mut stream = BufReader::new(stream);

        let mut line = Vec::new();
        match stream.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("rpc server: options error: {}", e);
                return;
            }
        }
        let opt: Options = match serde_json::from_slice(&line) {
            Ok(opt) => opt,
            Err(e) => {
                tracing::error!("rpc server: options error: {}", e);
                return;
            }
        };
        if opt.magic != MAGIC_NUMBER {
            tracing::error!("rpc server: invalid magic number {:#x}", opt.magic);
            return;
        }
        let Some(new_codec) = codec::lookup(&opt.codec) else {
            tracing::error!("rpc server: invalid codec type {}", opt.codec);
            return;
        };

        let (reader, writer) = new_codec(Box::new(stream));
        self.serve_codec(reader, writer, &opt).await;
    }

    /// The per-connection request loop: read, dispatch, drain, close.
    async fn serve_codec(
        self: Arc<Self>,
        mut reader: Box<dyn CodecReader>,
        writer: Box<dyn CodecWriter>,
        opt: &Options,
    ) {
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let mut handlers = JoinSet::new();

        loop {
            let mut header = match reader.read_header().await {
                Ok(h) => h,
                Err(WirecallError::Eof) => break,
                Err(e) => {
                    tracing::error!("rpc server: read header error: {}", e);
                    break;
                }
            };

            let (service, method) = match self.find_service(&header.service_method) {
                Ok(found) => found,
                Err(msg) => {
                    // Consume the body so the stream stays aligned.
                    let _ = reader.read_body().await;
                    header.error = msg;
                    send_response(&writer, &header, &[]).await;
                    continue;
                }
            };

            let args = match reader.read_body().await {
                Ok(args) => args,
                Err(e) => {
                    tracing::error!("rpc server: read body error: {}", e);
                    header.error = format!("rpc server: read body error: {}", e);
                    send_response(&writer, &header, &[]).await;
                    continue;
                }
            };

            handlers.spawn(handle_request(
                writer.clone(),
                header,
                service,
                method,
                args,
                opt.handle_timeout,
            ));
        }

        // Drain outstanding handlers before closing the codec.
        while handlers.join_next().await.is_some() {}
        let mut writer = writer.lock().await;
        if let Err(e) = writer.close().await {
            tracing::debug!("rpc server: close codec error: {}", e);
        }
    }

    /// Resolve `"Service.Method"` into the registered entries.
    ///
    /// The name is split at the last dot; failures become the error
    /// string carried back in the response header.
    fn find_service(
        &self,
        service_method: &str,
    ) -> std::result::Result<(Arc<Service>, Arc<Method>), String> {
        let Some(dot) = service_method.rfind('.') else {
            return Err(format!(
                "rpc server: service/method request ill-formed: {}",
                service_method
            ));
        };
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let service = self
            .services
            .read()
            .unwrap()
            .get(service_name)
            .cloned()
            .ok_or_else(|| format!("rpc server: can't find service {}", service_name))?;
        let method = service
            .get_method(method_name)
            .ok_or_else(|| format!("rpc server: can't find method {}", method_name))?;

        Ok((service, method))
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one request to completion, bounded by the handle timeout.
///
/// The worker task invokes the method and sends either the reply or an
/// error response. With a nonzero timeout the worker is raced against
/// a timer; whichever side takes the `sent` flag first writes the only
/// response frame for this sequence id, and the loser's send is
/// suppressed.
async fn handle_request(
    writer: SharedWriter,
    header: Header,
    service: Arc<Service>,
    method: Arc<Method>,
    args: Bytes,
    timeout: Duration,
) {
    let sent = Arc::new(AtomicBool::new(false));

    let mut worker = {
        let writer = writer.clone();
        let sent = sent.clone();
        let mut header = header.clone();
        tokio::spawn(async move {
            match service.call(&method, args).await {
                Ok(reply) => {
                    if !sent.swap(true, Ordering::SeqCst) {
                        send_response(&writer, &header, &reply).await;
                    }
                }
                Err(msg) => {
                    header.error = msg;
                    if !sent.swap(true, Ordering::SeqCst) {
                        send_response(&writer, &header, &[]).await;
                    }
                }
            }
        })
    };

    if timeout.is_zero() {
        let _ = worker.await;
        return;
    }

    tokio::select! {
        _ = &mut worker => {}
        _ = tokio::time::sleep(timeout) => {
            if !sent.swap(true, Ordering::SeqCst) {
                let mut header = header;
                header.error = format!(
                    "rpc server: request handle timeout: expect within {:?}",
                    timeout
                );
                send_response(&writer, &header, &[]).await;
            }
            // The worker keeps running detached; its send is suppressed.
        }
    }
}

/// Write one response frame under the connection's send mutex.
async fn send_response(writer: &SharedWriter, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write(header, body).await {
        tracing::error!("rpc server: write response error: {}", e);
    }
}
