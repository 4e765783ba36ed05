//! RPC client: connection establishment and call multiplexing.
//!
//! One client owns one connection. Outbound frames are serialized
//! through the send mutex; a single background reader demultiplexes
//! responses by sequence id into the pending map. Any number of tasks
//! may share a client (it is cheaply cloneable) and issue calls
//! concurrently.
//!
//! # Example
//!
//! ```ignore
//! use wirecall::Client;
//!
//! let client = Client::dial("127.0.0.1:7000", None).await?;
//! let sum: i64 = client.call("Arith.Add", &(1i64, 2i64)).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CodecReader, CodecWriter, Header, IoStream};
use crate::error::{Result, WirecallError};
use crate::http::{CONNECTED, DEFAULT_RPC_PATH};
use crate::options::{parse_options, Options};

/// What the reader (or a failure path) delivers to the awaiter:
/// raw reply bytes on success, the call's error otherwise.
type CallOutcome = Result<Bytes>;

/// An in-flight call handle returned by [`Client::go`].
///
/// Completion is delivered exactly once; await it with
/// [`Call::done`]. Dropping the handle abandons the reply (a late
/// response is discarded by the reader).
pub struct Call {
    /// Sequence id assigned to this call; 0 if registration failed.
    pub seq: u64,
    /// Dispatch target of form `"<Service>.<Method>"`.
    pub service_method: String,
    rx: oneshot::Receiver<CallOutcome>,
}

impl Call {
    /// Await completion and decode the reply.
    pub async fn done<R: DeserializeOwned>(self) -> Result<R> {
        match self.rx.await {
            Ok(Ok(body)) => codec::MsgPack::decode(&body)
                .map_err(|e| WirecallError::Protocol(format!("reading body {}", e))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WirecallError::Shutdown(
                "reader exited without completing the call".to_string(),
            )),
        }
    }
}

/// A pending entry in the client's correlation map.
struct PendingCall {
    tx: oneshot::Sender<CallOutcome>,
}

/// State behind the state mutex: sequence counter, pending map, and
/// the two termination flags.
struct State {
    /// Next sequence id to assign; starts at 1, 0 means invalid.
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    /// The user has called [`Client::close`].
    closing: bool,
    /// The reader observed a fatal stream error.
    shutdown: bool,
}

/// Everything covered by the send mutex: the codec write half and the
/// request header scratch reused across sends.
struct SendHalf {
    cc: Box<dyn CodecWriter>,
    header: Header,
}

/// An RPC client over one connection.
#[derive(Clone)]
pub struct Client {
    send: Arc<Mutex<SendHalf>>,
    state: Arc<StdMutex<State>>,
    /// The background reader task; close() stops it so the read half
    /// is released without waiting on the peer.
    reader: Arc<tokio::task::JoinHandle<()>>,
    options: Options,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dial a TCP address.
    pub async fn dial(addr: &str, opts: Option<Options>) -> Result<Client> {
        let opt = parse_options(opts);
        let stream = connect_tcp(addr, opt.connect_timeout).await?;
        dial_timeout(new_client, Box::new(stream), opt).await
    }

    /// Dial a Unix socket path.
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, opts: Option<Options>) -> Result<Client> {
        let opt = parse_options(opts);
        let stream = connect_unix(path, opt.connect_timeout).await?;
        dial_timeout(new_client, Box::new(stream), opt).await
    }

    /// Dial a TCP address and upgrade via HTTP CONNECT before speaking
    /// RPC.
    pub async fn dial_http(addr: &str, opts: Option<Options>) -> Result<Client> {
        let opt = parse_options(opts);
        let stream = connect_tcp(addr, opt.connect_timeout).await?;
        dial_timeout(new_http_client, Box::new(stream), opt).await
    }

    /// Dial a `"<proto>@<address>"` target; `http` routes through the
    /// CONNECT upgrade, `tcp` and `unix` dial directly.
    pub async fn x_dial(target: &str, opts: Option<Options>) -> Result<Client> {
        let Some((proto, addr)) = target.split_once('@') else {
            return Err(WirecallError::Protocol(format!(
                "rpc client: wrong dial target {}, expect protocol@addr",
                target
            )));
        };
        match proto {
            "http" => Self::dial_http(addr, opts).await,
            "tcp" => Self::dial(addr, opts).await,
            #[cfg(unix)]
            "unix" => Self::dial_unix(addr, opts).await,
            other => Err(WirecallError::Protocol(format!(
                "rpc client: unsupported protocol {}",
                other
            ))),
        }
    }

    /// Build a client over already-split codec halves and spawn the
    /// background reader.
    fn with_codec(
        reader: Box<dyn CodecReader>,
        writer: Box<dyn CodecWriter>,
        options: Options,
    ) -> Client {
        let send = Arc::new(Mutex::new(SendHalf {
            cc: writer,
            header: Header::default(),
        }));
        let state = Arc::new(StdMutex::new(State {
            seq: 1,
            pending: HashMap::new(),
            closing: false,
            shutdown: false,
        }));

        let reader = tokio::spawn(receive(reader, send.clone(), state.clone()));

        Client {
            send,
            state,
            reader: Arc::new(reader),
            options,
        }
    }

    /// The options this connection was established with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// True until [`Client::close`] is called or the reader observes a
    /// terminal stream error.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.shutdown && !state.closing
    }

    /// Close the connection. A second close fails with
    /// `connection is closed`.
    ///
    /// Every call still pending completes immediately with
    /// `connection is closed`; shutting the write half down only
    /// half-closes the stream, so termination cannot be left to the
    /// reader noticing a peer close.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closing {
                return Err(WirecallError::Closed);
            }
            state.closing = true;
        }

        let mut send = self.send.lock().await;
        let res = send.cc.close().await;

        // Fail everything still pending; the peer may never answer
        // now. Send mutex before state mutex, as everywhere.
        {
            let mut state = self.state.lock().unwrap();
            for (_, call) in state.pending.drain() {
                let _ = call.tx.send(Err(WirecallError::Closed));
            }
        }

        // Stop the reader so the read half is dropped as well. A call
        // the reader had already claimed still completes: aborting
        // drops its completion sender, which fails the awaiter.
        self.reader.abort();
        res
    }

    /// Fire a call asynchronously and return its handle. The handle
    /// always completes exactly once, even when registration or the
    /// send fails.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Call {
        let (tx, rx) = oneshot::channel();

        let args = match codec::MsgPack::encode(args) {
            Ok(args) => args,
            Err(e) => {
                let _ = tx.send(Err(e));
                return Call {
                    seq: 0,
                    service_method: service_method.to_string(),
                    rx,
                };
            }
        };

        let seq = self.send_call(service_method, args, tx).await;
        Call {
            seq,
            service_method: service_method.to_string(),
            rx,
        }
    }

    /// Invoke the named method and await its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await.done().await
    }

    /// Invoke the named method, racing completion against the caller's
    /// cancellation token. If cancellation wins the call is removed
    /// from the pending map and fails with `call failed`; a late
    /// response is discarded by the reader.
    pub async fn call_with_cancel<A, R>(
        &self,
        service_method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let call = self.go(service_method, args).await;
        let seq = call.seq;
        tokio::select! {
            _ = cancel.cancelled() => {
                remove_call(&self.state, seq);
                Err(WirecallError::CallFailed("cancelled".to_string()))
            }
            outcome = call.done() => outcome,
        }
    }

    /// Register the call and write its request frame, all under the
    /// send mutex. Returns the assigned sequence id (0 on failure; the
    /// completion channel carries the error).
    async fn send_call(
        &self,
        service_method: &str,
        args: Vec<u8>,
        tx: oneshot::Sender<CallOutcome>,
    ) -> u64 {
        let mut send = self.send.lock().await;

        let seq = match register_call(&self.state, tx) {
            Ok(seq) => seq,
            Err(tx) => {
                let _ = tx.send(Err(WirecallError::Closed));
                return 0;
            }
        };

        // The header scratch is reused across sends; safe because the
        // send mutex is held from population through encoding.
        let SendHalf { cc, header } = &mut *send;
        header.service_method.clear();
        header.service_method.push_str(service_method);
        header.seq = seq;
        header.error.clear();

        if let Err(e) = cc.write(header, &args).await {
            // The reader may have already removed the call (partial
            // write, server answered); complete it only if it is
            // still pending.
            if let Some(call) = remove_call(&self.state, seq) {
                let _ = call.tx.send(Err(e));
            }
        }
        seq
    }
}

/// Assign the next sequence id and insert the pending entry, unless
/// the client is closing or shut down.
fn register_call(
    state: &StdMutex<State>,
    tx: oneshot::Sender<CallOutcome>,
) -> std::result::Result<u64, oneshot::Sender<CallOutcome>> {
    let mut state = state.lock().unwrap();
    if state.closing || state.shutdown {
        return Err(tx);
    }
    let seq = state.seq;
    state.seq += 1;
    state.pending.insert(seq, PendingCall { tx });
    Ok(seq)
}

/// Remove and return the pending entry for a sequence id, if any.
fn remove_call(state: &StdMutex<State>, seq: u64) -> Option<PendingCall> {
    state.lock().unwrap().pending.remove(&seq)
}

/// The background reader: demultiplex responses by sequence id until
/// the stream dies, then fail everything still pending.
async fn receive(
    mut reader: Box<dyn CodecReader>,
    send: Arc<Mutex<SendHalf>>,
    state: Arc<StdMutex<State>>,
) {
    let err = loop {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(e) => break e,
        };

        match remove_call(&state, header.seq) {
            // Write failed partway, or the call was cancelled; the
            // server processed it anyway. Discard the body.
            None => {
                if let Err(e) = reader.read_body().await {
                    break e;
                }
            }
            Some(call) if !header.error.is_empty() => {
                let body = reader.read_body().await;
                let _ = call.tx.send(Err(WirecallError::Remote(header.error)));
                if let Err(e) = body {
                    break e;
                }
            }
            Some(call) => match reader.read_body().await {
                Ok(body) => {
                    let _ = call.tx.send(Ok(body));
                }
                Err(e) => {
                    let _ = call
                        .tx
                        .send(Err(WirecallError::Protocol(format!("reading body {}", e))));
                    break e;
                }
            },
        }
    };

    terminate_calls(&send, &state, err).await;
}

/// Fail every pending call with the reader's terminal error. Locks the
/// send mutex before the state mutex; that order is fixed everywhere.
async fn terminate_calls(send: &Arc<Mutex<SendHalf>>, state: &Arc<StdMutex<State>>, err: WirecallError) {
    let _send = send.lock().await;
    let mut state = state.lock().unwrap();
    state.shutdown = true;

    if !state.pending.is_empty() {
        tracing::debug!(
            "rpc client: terminating {} pending calls: {}",
            state.pending.len(),
            err
        );
    }
    let msg = err.to_string();
    for (_, call) in state.pending.drain() {
        let _ = call.tx.send(Err(WirecallError::Shutdown(msg.clone())));
    }
}

/// Handshake factory: select the codec, send the options document,
/// start the client.
async fn new_client(mut stream: IoStream, opt: Options) -> Result<Client> {
    let Some(new_codec) = codec::lookup(&opt.codec) else {
        let err = WirecallError::Protocol(format!("invalid codec type {}", opt.codec));
        tracing::error!("rpc client: codec error: {}", err);
        return Err(err);
    };

    let mut line = serde_json::to_vec(&opt)?;
    line.push(b'\n');
    stream.write_all(&line).await?;

    let (reader, writer) = new_codec(stream);
    Ok(Client::with_codec(reader, writer, opt))
}

/// Handshake factory for HTTP mode: CONNECT, check the status
/// sentinel, then run the normal handshake.
async fn new_http_client(stream: IoStream, opt: Options) -> Result<Client> {
    let mut stream = BufReader::new(stream);

    let connect = format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH);
    stream.write_all(connect.as_bytes()).await?;

    let mut status = String::new();
    stream.read_line(&mut status).await?;
    let expected = format!("HTTP/1.0 {}", CONNECTED);
    if status.trim_end() != expected {
        return Err(WirecallError::Protocol(format!(
            "unexpected HTTP response: {}",
            status.trim_end()
        )));
    }
    // Consume the blank line ending the response head.
    let mut blank = String::new();
    stream.read_line(&mut blank).await?;

    new_client(Box::new(stream), opt).await
}

/// Race the handshake factory against the connect timeout.
///
/// On timeout the factory task is abandoned, not killed: its eventual
/// result is dropped, which closes the connection.
async fn dial_timeout<F, Fut>(factory: F, stream: IoStream, opt: Options) -> Result<Client>
where
    F: FnOnce(IoStream, Options) -> Fut,
    Fut: Future<Output = Result<Client>> + Send + 'static,
{
    let timeout = opt.connect_timeout;
    let mut handshake = tokio::spawn(factory(stream, opt));

    if timeout.is_zero() {
        return flatten(handshake.await);
    }
    tokio::select! {
        res = &mut handshake => flatten(res),
        _ = tokio::time::sleep(timeout) => Err(WirecallError::ConnectTimeout(timeout)),
    }
}

fn flatten(res: std::result::Result<Result<Client>, tokio::task::JoinError>) -> Result<Client> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(WirecallError::Shutdown(format!("handshake task failed: {}", e))),
    }
}

async fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream> {
    if timeout.is_zero() {
        Ok(TcpStream::connect(addr).await?)
    } else {
        tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WirecallError::ConnectTimeout(timeout))?
            .map_err(WirecallError::Io)
    }
}

#[cfg(unix)]
async fn connect_unix(path: &str, timeout: Duration) -> Result<UnixStream> {
    if timeout.is_zero() {
        Ok(UnixStream::connect(path).await?)
    } else {
        tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| WirecallError::ConnectTimeout(timeout))?
            .map_err(WirecallError::Io)
    }
}
