use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use socket2::SockRef;
use tokio::sync::mpsc::{
    unbounded_channel, UnboundedReceiver as Receiver, UnboundedSender as Sender,
};
use tokio::sync::oneshot;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::frame::{
    encode_request, Frame, FrameDecoder, HandleAllocator, MAX_REQUEST_SIZE, RESPONSE_MASK,
};
use crate::xml::{
    from_value, read_method_call, read_method_response, write_method_call, Call, Fault, Response,
    Value,
};

/// The default XML-RPC endpoint of a locally running dedicated server.
pub const DEFAULT_ADDR: &str = "127.0.0.1:5000";

/// The banner the server opens the byte stream with. Anything else
/// means the endpoint speaks an unsupported protocol version.
const PROTOCOL: &str = "GBXRemote 2";

/// The notifications a client owner receives from the session.
///
/// Both are delivered from the task that matches server traffic, so a
/// slow implementation delays later callbacks, but never responses to
/// other callers' requests being written.
#[async_trait]
pub trait Host: Send + Sync {
    /// A method call pushed by the server, f.e. `ManiaPlanet.PlayerChat`.
    async fn on_callback(&self, method: String, args: Vec<Value>);

    /// The session is gone, either after an explicit `disconnect`
    /// (reason `"disconnect"`), a server-side close (reason `"end"`),
    /// a socket error, or a protocol violation.
    async fn on_disconnect(&self, reason: String);
}

/// Error policy for `call`, `call_script` and `multicall`.
#[derive(Clone, Copy, Debug)]
pub struct ClientOptions {
    /// Log faults and codec errors of failed calls.
    pub show_errors: bool,

    /// Surface faults and codec errors to the caller. When unset, a
    /// failed call resolves to `Value::Bool(false)` instead.
    pub throw_errors: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            show_errors: false,
            throw_errors: true,
        }
    }
}

/// A slot the caller of an in-flight request awaits. Fulfilled by the
/// message loop with the matched response; dropped slots resolve the
/// await with `Error::ConnectionLost`.
type Waiter = oneshot::Sender<Result<Value>>;

/// The variants of this enum drive the task that matches responses
/// with the callers waiting on them, and dispatches server-pushed
/// calls to the host.
#[derive(Debug)]
enum Msg {
    /// An XML-RPC call was written: once the response carrying this
    /// handle is received, it is handed to the waiting caller.
    AwaitResponse { handle: u32, waiter: Waiter },

    /// The first frame of the stream arrived. A banner other than
    /// `GBXRemote 2` tears the session down.
    FulfillHandshake { banner: Vec<u8> },

    /// A method response was received; its handle matches it to a
    /// waiting caller, if one registered.
    FulfillResponse { handle: u32, outcome: Result<Value> },

    /// The server acted as the XML-RPC caller: it pushed a method
    /// call that is forwarded to the host, with no response sent back.
    FulfillCallback { call: Call },

    /// The socket is gone; tear the session down.
    Disconnected { reason: String },
}

/// Everything that only exists while a connection is up.
struct Session {
    /// Write half of the duplex socket; reads happen on a dedicated
    /// thread holding its own handle.
    tcp_stream: TcpStream,

    /// Mints the handle that matches each response to its request.
    handles: HandleAllocator,

    /// Feeds the message loop; also held by the receive thread.
    msg_out: Sender<Msg>,

    /// Set once the handshake banner was verified. Requests refuse
    /// to write before that.
    connected: bool,
}

/// An XML-RPC client for the dedicated server's GBXRemote 2 interface.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct GbxClient {
    session: Arc<Mutex<Option<Session>>>,
    host: Arc<dyn Host>,
    options: ClientOptions,
}

impl GbxClient {
    /// Create a disconnected client that will notify `host` of
    /// server-pushed calls and of session teardown.
    pub fn new(host: Arc<dyn Host>, options: ClientOptions) -> GbxClient {
        GbxClient {
            session: Arc::new(Mutex::new(None)),
            host,
            options,
        }
    }

    /// Open a TCP connection to `addr` and await the server's
    /// protocol handshake.
    ///
    /// Resolves to `true` once the `GBXRemote 2` banner was verified,
    /// and to `false` if the endpoint answered with a different
    /// protocol (the host is notified of the teardown). Fails with an
    /// IO error if no TCP connection could be established, which
    /// typically means there is no running server.
    pub async fn connect(&self, addr: &str) -> Result<bool> {
        let (connect_out, connect_in) = oneshot::channel();

        {
            let mut guard = self.session.lock().await;
            if guard.is_some() {
                return Err(Error::AlreadyConnected);
            }

            log::debug!("connecting to {}", addr);
            let tcp_stream = TcpStream::connect(addr)?;
            SockRef::from(&tcp_stream).set_keepalive(true)?;
            let read_stream = tcp_stream.try_clone()?;

            let (msg_out, msg_in) = unbounded_channel();
            recv_loop(read_stream, msg_out.clone(), self.options.show_errors);
            msg_loop(
                msg_in,
                connect_out,
                Arc::clone(&self.session),
                Arc::clone(&self.host),
            );

            *guard = Some(Session {
                tcp_stream,
                handles: HandleAllocator::new(),
                msg_out,
                connected: false,
            });
        }

        connect_in.await.map_err(|_| Error::ConnectionLost)
    }

    /// Tear the session down. The host is notified with reason
    /// `"disconnect"`, and calls still in flight complete with
    /// `Error::ConnectionLost`. Idempotent.
    pub async fn disconnect(&self) {
        teardown(&self.session, &*self.host, "disconnect").await;
    }

    /// Whether a handshaked session is currently established.
    pub async fn is_connected(&self) -> bool {
        matches!(&*self.session.lock().await, Some(session) if session.connected)
    }

    /// Make an XML-RPC call and await its result.
    ///
    /// Faults and codec errors respect the client options: with
    /// `throw_errors` unset they resolve to `Value::Bool(false)`
    /// instead of an `Err`. Transport errors are always surfaced.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let outcome = self.request(Call::new(method, args)).await;
        self.resolve(outcome)
    }

    /// Make an XML-RPC call and deserialize its result.
    pub async fn call_as<T>(&self, method: &str, args: Vec<Value>) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let value = self.call(method, args).await?;
        from_value(value).map_err(Error::Codec)
    }

    /// Make a mode script call, f.e. `Trackmania.GetScores`.
    ///
    /// Equivalent to calling `TriggerModeScriptEventArray` with the
    /// event name and its params packed into a single list.
    pub async fn call_script(&self, event: &str, args: Vec<Value>) -> Result<Value> {
        let outcome = self.request(pack_script_call(event, args)).await;
        self.resolve(outcome)
    }

    /// Write an XML-RPC call and forget about it.
    ///
    /// No waiter is registered for the minted handle: whatever the
    /// server answers is discarded on arrival, so the caller never
    /// learns whether the call faulted.
    pub async fn send(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.write_call(&Call::new(method, args), None).await?;
        Ok(())
    }

    /// Package several calls into one `system.multicall` request.
    ///
    /// Resolves to one slot per input call, in input order: either the
    /// call's first result value, or the fault of that individual
    /// call. A fault of the batch itself is always an `Err`.
    pub async fn multicall(&self, calls: Vec<Call>) -> Result<Vec<Response>> {
        let (waiter, response) = oneshot::channel();
        let outcome = match self.write_call(&pack_multicall(&calls), Some(waiter)).await {
            Ok(_) => response.await.unwrap_or(Err(Error::ConnectionLost)),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(value) => unpack_multicall(value),
            Err(err) => {
                if self.options.show_errors {
                    log::error!("multicall failed: {}", err);
                }
                Err(err)
            }
        }
    }

    async fn request(&self, call: Call) -> Result<Value> {
        let (waiter, response) = oneshot::channel();
        let handle = self.write_call(&call, Some(waiter)).await?;
        let outcome = response.await.unwrap_or(Err(Error::ConnectionLost));
        log::debug!("call {:#x} response: {:?}", handle, outcome);
        outcome
    }

    /// Allocate a handle, register the waiter, and write the framed
    /// request. The session lock is held for the whole step: writes
    /// stay ordered on the socket, and the waiter is registered
    /// before any byte hits the wire, so the response cannot slip
    /// past it.
    async fn write_call(&self, call: &Call, waiter: Option<Waiter>) -> Result<u32> {
        let body = write_method_call(call).map_err(Error::Codec)?;
        if body.len() + 8 > MAX_REQUEST_SIZE {
            return Err(Error::RequestTooLarge(body.len() + 8));
        }

        let mut guard = self.session.lock().await;
        let session = match guard.as_mut() {
            Some(session) if session.connected => session,
            _ => return Err(Error::NotConnected),
        };

        let handle = session.handles.next_handle();
        if let Some(waiter) = waiter {
            session
                .msg_out
                .send(Msg::AwaitResponse { handle, waiter })
                .map_err(|_| Error::ConnectionLost)?;
        }

        log::debug!("call {:#x}: {:?}", handle, call);
        session
            .tcp_stream
            .write_all(&encode_request(handle, &body))?;
        Ok(handle)
    }

    /// Apply the `throw_errors`/`show_errors` options to an outcome.
    fn resolve(&self, outcome: Result<Value>) -> Result<Value> {
        match outcome {
            Err(err @ Error::Fault(_)) | Err(err @ Error::Codec(_)) => {
                if self.options.show_errors {
                    log::error!("call failed: {}", err);
                }
                if self.options.throw_errors {
                    Err(err)
                } else {
                    Ok(Value::Bool(false))
                }
            }
            Err(err) => {
                if self.options.show_errors {
                    log::error!("call failed: {}", err);
                }
                Err(err)
            }
            ok => ok,
        }
    }
}

impl Debug for GbxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GbxClient")
            .field("options", &self.options)
            .finish()
    }
}

/// Drop the session, if one is up, and notify the host exactly once.
async fn teardown(session: &Mutex<Option<Session>>, host: &dyn Host, reason: &str) {
    let torn_down = session.lock().await.take();
    if let Some(session) = torn_down {
        let _ = session.tcp_stream.shutdown(Shutdown::Both);
        log::debug!("session torn down: {}", reason);
        host.on_disconnect(reason.to_string()).await;
    }
}

/// Spawn a thread that drains the TCP connection, cuts the byte
/// stream into frames, and feeds the message loop.
///
/// The thread ends when the socket does, reporting the cause as a
/// final `Msg::Disconnected`, or silently once the message receiver
/// is gone.
fn recv_loop(mut tcp_stream: TcpStream, msg_out: Sender<Msg>, show_errors: bool) {
    std::thread::spawn(move || {
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0; 4096];

        loop {
            let n = match tcp_stream.read(&mut chunk) {
                Ok(0) => {
                    let _ = msg_out.send(Msg::Disconnected {
                        reason: "end".to_string(),
                    });
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    let _ = msg_out.send(Msg::Disconnected {
                        reason: err.to_string(),
                    });
                    return;
                }
            };

            decoder.feed(&chunk[..n]);
            while let Some(frame) = decoder.next_frame() {
                if let Some(msg) = classify(frame, show_errors) {
                    if msg_out.send(msg).is_err() {
                        return;
                    }
                }
            }
        }
    });
}

/// Turn a received frame into the message that fulfills it.
///
/// Unparsable server-pushed calls are dropped without ending the
/// session; unparsable responses still fulfill their waiter, with a
/// codec error.
fn classify(frame: Frame, show_errors: bool) -> Option<Msg> {
    match frame {
        Frame::Handshake(banner) => Some(Msg::FulfillHandshake { banner }),
        Frame::Message { body, .. } if body.is_empty() => None,
        Frame::Message { handle, body } => {
            let is_callback = handle & RESPONSE_MASK == 0;

            let text = match std::str::from_utf8(&body) {
                Ok(text) => text,
                Err(err) if is_callback => {
                    if show_errors {
                        log::warn!("dropping server call that is not UTF-8: {}", err);
                    }
                    return None;
                }
                Err(err) => {
                    return Some(Msg::FulfillResponse {
                        handle,
                        outcome: Err(Error::Codec(anyhow!("response was not UTF-8: {}", err))),
                    })
                }
            };

            if is_callback {
                match read_method_call(text) {
                    Ok(call) => Some(Msg::FulfillCallback { call }),
                    Err(err) => {
                        if show_errors {
                            log::warn!("dropping unparsable server call: {:#}", err);
                        }
                        None
                    }
                }
            } else {
                let outcome = match read_method_response(text) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(fault)) => Err(Error::Fault(fault)),
                    Err(err) => Err(Error::Codec(err)),
                };
                Some(Msg::FulfillResponse { handle, outcome })
            }
        }
    }
}

/// Spawn the task that owns the pending-request table.
///
/// It consumes all `Msg`s: registers waiters, fulfills them with
/// matched responses, forwards server calls to the host, and tears
/// the session down when the stream ends. Dropping the table on exit
/// cancels every caller still waiting.
fn msg_loop(
    mut msg_in: Receiver<Msg>,
    connect_waiter: oneshot::Sender<bool>,
    session: Arc<Mutex<Option<Session>>>,
    host: Arc<dyn Host>,
) {
    tokio::spawn(async move {
        let mut waiting_calls: HashMap<u32, Waiter> = HashMap::new();
        let mut connect_waiter = Some(connect_waiter);

        loop {
            let msg = match msg_in.recv().await {
                Some(msg) => msg,
                None => break,
            };

            match msg {
                Msg::AwaitResponse { handle, waiter } => {
                    if waiting_calls.insert(handle, waiter).is_some() {
                        // A wrapped handle is still in flight: responses
                        // could no longer be told apart.
                        log::error!("request handle {:#x} is still outstanding", handle);
                        teardown(&session, &*host, "request handle collision").await;
                        break;
                    }
                }
                Msg::FulfillHandshake { banner } => {
                    if banner == PROTOCOL.as_bytes() {
                        let handshaked = {
                            let mut guard = session.lock().await;
                            match guard.as_mut() {
                                Some(session) => {
                                    session.connected = true;
                                    true
                                }
                                None => false,
                            }
                        };
                        if let Some(waiter) = connect_waiter.take() {
                            let _ = waiter.send(handshaked);
                        }
                    } else {
                        log::debug!(
                            "unexpected protocol banner: {:?}",
                            String::from_utf8_lossy(&banner)
                        );
                        teardown(&session, &*host, "GBXRemote 2 protocol not supported").await;
                        if let Some(waiter) = connect_waiter.take() {
                            let _ = waiter.send(false);
                        }
                        break;
                    }
                }
                Msg::FulfillResponse { handle, outcome } => match waiting_calls.remove(&handle) {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => {
                        log::debug!("discarding response with no waiting call ({:#x})", handle)
                    }
                },
                Msg::FulfillCallback { call } => {
                    host.on_callback(call.name, call.args).await;
                }
                Msg::Disconnected { reason } => {
                    teardown(&session, &*host, &reason).await;
                    if let Some(waiter) = connect_waiter.take() {
                        let _ = waiter.send(false);
                    }
                    break;
                }
            }
        }
    });
}

fn pack_script_call(event: &str, args: Vec<Value>) -> Call {
    Call::new(
        "TriggerModeScriptEventArray",
        vec![Value::from(event), Value::Array(args)],
    )
}

fn pack_multicall(calls: &[Call]) -> Call {
    let entries = calls
        .iter()
        .map(|call| {
            let mut entry = BTreeMap::new();
            entry.insert("methodName".to_string(), Value::from(call.name.clone()));
            entry.insert("params".to_string(), Value::Array(call.args.clone()));
            Value::Struct(entry)
        })
        .collect();
    Call::new("system.multicall", vec![Value::Array(entries)])
}

fn unpack_multicall(value: Value) -> Result<Vec<Response>> {
    let slots = match value {
        Value::Array(slots) => slots,
        v => {
            return Err(Error::Codec(anyhow!(
                "expected a multicall result list, got {:?}",
                v
            )))
        }
    };
    slots.into_iter().map(unpack_multicall_slot).collect()
}

fn unpack_multicall_slot(slot: Value) -> Result<Response> {
    match slot {
        Value::Array(mut vals) if vals.len() == 1 => Ok(Ok(vals.remove(0))),
        Value::Struct(members) => match (members.get("faultCode"), members.get("faultString")) {
            (Some(Value::Int(code)), Some(Value::String(msg))) => Ok(Err(Fault {
                code: *code,
                msg: msg.clone(),
            })),
            _ => Err(Error::Codec(anyhow!(
                "malformed multicall fault: {:?}",
                members
            ))),
        },
        v => Err(Error::Codec(anyhow!("malformed multicall slot: {:?}", v))),
    }
}
