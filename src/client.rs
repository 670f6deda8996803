//! The single-connection RPC client.
//!
//! A client multiplexes many in-flight calls over one connection. Sends
//! register the call in a pending map keyed by sequence number and write
//! the `(header, args)` pair under the sender lock; a dedicated receiver
//! task reads response frames and routes each one back to its caller
//! through a oneshot channel. Out-of-order completion is the normal case.
//!
//! Cancellation is by drop: a [`Call`] future that is dropped before it
//! resolves detaches its pending entry, so a response that arrives later
//! is read and silently discarded without disturbing other calls. A
//! transport error is fatal to the whole client; every pending call is
//! completed with the terminal error and new sends are refused.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec::{self, CodecKind, CodecRead, CodecWrite, Header};
use crate::error::{Result, RpcError};
use crate::options::{self, Options};

/// What the receiver hands back for one call: raw reply bytes, or the
/// error that ends the call.
type Outcome = std::result::Result<Vec<u8>, RpcError>;

struct State {
    /// Next sequence number, starting at 1.
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<Outcome>>,
    closing: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("client state lock poisoned")
    }
}

/// A client for one server connection. All methods take `&self`; clone an
/// `Arc<Client>` to share it across tasks.
pub struct Client {
    kind: CodecKind,
    writer: tokio::sync::Mutex<Box<dyn CodecWrite>>,
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl Client {
    /// Dials a TCP endpoint, bounded by the options' connect timeout.
    pub async fn dial(addr: &str, options: Options) -> Result<Client> {
        Self::dial_with(addr, options, |addr: String| async move {
            let stream = TcpStream::connect(&addr).await?;
            let _ = stream.set_nodelay(true);
            Ok(stream)
        })
        .await
    }

    /// Dials an HTTP listener and upgrades to the RPC protocol with a
    /// `CONNECT` to `path` before the normal handshake. The whole
    /// exchange shares the connect-timeout bound.
    pub async fn dial_http(addr: &str, path: &str, options: Options) -> Result<Client> {
        let path = path.to_string();
        Self::dial_with(addr, options, move |addr: String| async move {
            let mut stream = TcpStream::connect(&addr).await?;
            let _ = stream.set_nodelay(true);
            http_connect(&mut stream, &addr, &path).await?;
            Ok(stream)
        })
        .await
    }

    /// The connect path with the connection-building step factored out so
    /// tests can substitute a slow or failing connector.
    async fn dial_with<C, Fut>(addr: &str, options: Options, connect: C) -> Result<Client>
    where
        C: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TcpStream>>,
    {
        let setup = async {
            let stream = connect(addr.to_string()).await?;
            Client::with_stream(stream, options.clone()).await
        };
        if options.connect_timeout.is_zero() {
            setup.await
        } else {
            match tokio::time::timeout(options.connect_timeout, setup).await {
                Ok(res) => res,
                // the partial connection is dropped (and thereby closed) here
                Err(_) => Err(RpcError::ConnectTimeout(options.connect_timeout)),
            }
        }
    }

    /// Builds a client over an established duplex stream: sends the
    /// handshake frame, splits the codec, launches the receiver task.
    pub async fn with_stream<S>(mut stream: S, options: Options) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        options::write_handshake(&mut stream, &options).await?;
        let (reader, writer) = codec::split(options.codec, stream);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let receiver = tokio::spawn(receive(reader, Arc::clone(&shared)));
        Ok(Client {
            kind: options.codec,
            writer: tokio::sync::Mutex::new(writer),
            shared,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Starts a call and returns a future for its completion. Dropping
    /// the returned [`Call`] cancels the caller's interest: the pending
    /// entry is detached and a late response is absorbed.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Result<Call<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = self.kind.encode(args)?;
        let mut w = self.writer.lock().await;
        // register under the sender lock so frames hit the wire in
        // sequence order
        let (seq, rx) = {
            let mut st = self.shared.lock();
            if st.shutdown || st.closing {
                return Err(RpcError::Shutdown);
            }
            let seq = st.seq;
            st.seq += 1;
            let (tx, rx) = oneshot::channel();
            st.pending.insert(seq, tx);
            (seq, rx)
        };
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(e) = w.write(&header, &body).await {
            self.shared.lock().pending.remove(&seq);
            return Err(e);
        }
        Ok(Call {
            rx,
            guard: PendingGuard { shared: Arc::clone(&self.shared), seq, armed: true },
            kind: self.kind,
            _reply: PhantomData,
        })
    }

    /// Invokes a method and waits for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await?.await
    }

    /// Like [`Client::call`] with a deadline on the caller's wait. `None`
    /// means no bound. On expiry the pending call is detached and the
    /// server's eventual reply is discarded.
    pub async fn call_timeout<A, R>(
        &self,
        limit: Option<Duration>,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let call = self.go(service_method, args).await?;
        match limit {
            None => call.await,
            Some(d) => match tokio::time::timeout(d, call).await {
                Ok(res) => res,
                Err(elapsed) => Err(RpcError::CallFailed(elapsed.to_string())),
            },
        }
    }

    pub fn is_available(&self) -> bool {
        let st = self.shared.lock();
        !st.shutdown && !st.closing
    }

    /// Shuts the client down. The first call succeeds; closing an already
    /// closed client returns the shutdown sentinel.
    pub async fn close(&self) -> Result<()> {
        {
            let mut st = self.shared.lock();
            if st.closing {
                return Err(RpcError::Shutdown);
            }
            st.closing = true;
        }
        if let Some(handle) = self.receiver.lock().expect("receiver slot lock poisoned").take() {
            handle.abort();
        }
        terminate(&self.shared, &RpcError::Shutdown);
        let mut w = self.writer.lock().await;
        let _ = w.close().await;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.lock().expect("receiver slot lock poisoned").take() {
            handle.abort();
        }
    }
}

/// One in-flight call. Resolves to the decoded reply or the call's error.
pub struct Call<R> {
    rx: oneshot::Receiver<Outcome>,
    guard: PendingGuard,
    kind: CodecKind,
    _reply: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for Call<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl<R: DeserializeOwned> Future for Call<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        match Pin::new(&mut me.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => {
                me.guard.armed = false;
                match res {
                    // the client went away without completing the call
                    Err(_) => Poll::Ready(Err(RpcError::Shutdown)),
                    Ok(Err(e)) => Poll::Ready(Err(e)),
                    Ok(Ok(body)) => Poll::Ready(
                        me.kind
                            .decode(&body)
                            .map_err(|e| RpcError::ReadBody(e.to_string())),
                    ),
                }
            }
        }
    }
}

/// Detaches the pending entry when the caller loses interest before the
/// response arrives.
struct PendingGuard {
    shared: Arc<Shared>,
    seq: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().pending.remove(&self.seq);
        }
    }
}

/// The receiver task: demultiplexes response frames back to their
/// callers until the transport fails, then completes every remaining
/// pending call with the terminal error.
async fn receive(mut reader: Box<dyn CodecRead>, shared: Arc<Shared>) {
    let terminal = loop {
        let header = match reader.read_header().await {
            Ok(h) => h,
            Err(e) => break e,
        };
        let slot = shared.lock().pending.remove(&header.seq);
        match slot {
            // call already cancelled or timed out: absorb the body
            None => {
                if let Err(e) = reader.read_body().await {
                    break e;
                }
            }
            Some(tx) if !header.error.is_empty() => {
                let body_res = reader.read_body().await;
                let _ = tx.send(Err(RpcError::Remote(header.error)));
                if let Err(e) = body_res {
                    break e;
                }
            }
            Some(tx) => match reader.read_body().await {
                Ok(body) => {
                    let _ = tx.send(Ok(body));
                }
                Err(e) => {
                    let _ = tx.send(Err(RpcError::ReadBody(e.to_string())));
                    break e;
                }
            },
        }
    };
    debug!("rpc client: receive loop ended: {terminal}");
    terminate(&shared, &terminal);
}

fn terminate(shared: &Shared, err: &RpcError) {
    let mut st = shared.lock();
    st.shutdown = true;
    let msg = err.to_string();
    for (_, tx) in st.pending.drain() {
        let outcome = if matches!(err, RpcError::Shutdown) {
            Err(RpcError::Shutdown)
        } else {
            Err(RpcError::Connection(msg.clone()))
        };
        let _ = tx.send(outcome);
    }
}

/// Client half of the HTTP tunnel: issue the CONNECT and wait for a 200
/// before speaking the RPC protocol. Reads byte-at-a-time so nothing
/// past the blank line is consumed.
async fn http_connect(stream: &mut TcpStream, host: &str, path: &str) -> Result<()> {
    let request = format!("CONNECT {path} HTTP/1.1\r\nHost: {host}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let mut byte = [0_u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 4096 {
            return Err(RpcError::Protocol("oversized CONNECT response".to_string()));
        }
        stream.read_exact(&mut byte).await?;
        response.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or("");
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(RpcError::Protocol(format!(
            "unexpected CONNECT response: {status_line}"
        )));
    }
    Ok(())
}
