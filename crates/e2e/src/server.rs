//! Mock machine-protocol servers
//!
//! Scripted fixtures standing in for the emulator side of both protocols.
//! Each fixture accepts (or dials) exactly one connection and feeds every
//! client message to a responder closure, which decides what lines flow
//! back. A memory-backed qtest responder covers the data-transfer verbs.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::debug;

use qlink_protocol::Address;

/// One step of a scripted reaction to a client message.
pub enum ServerOp {
    /// Write this line to the client.
    Send(String),
    /// Close the connection.
    Close,
}

/// A post-negotiation QMP command as seen by the fixture.
pub struct QmpRequest {
    pub execute: String,
    pub arguments: Option<Value>,
    pub id: Option<Value>,
}

type QmpResponder = Box<dyn FnMut(QmpRequest) -> Vec<ServerOp> + Send>;
type QtestResponder = Box<dyn FnMut(Vec<String>) -> Vec<ServerOp> + Send>;

/// Greeting the QMP fixtures announce by default.
pub fn default_greeting() -> String {
    json!({
        "QMP": {
            "version": {"qemu": {"major": 8, "minor": 2, "micro": 0}, "package": "qlink-e2e"},
            "capabilities": []
        }
    })
    .to_string()
}

/// Handle to a running mock QMP server.
pub struct QmpServer {
    pub address: Address,
    handle: JoinHandle<()>,
}

impl QmpServer {
    /// Listen on a free TCP port with the standard greeting.
    pub async fn spawn(
        responder: impl FnMut(QmpRequest) -> Vec<ServerOp> + Send + 'static,
    ) -> Result<Self> {
        Self::spawn_with_greeting(default_greeting(), responder).await
    }

    /// Listen on a free TCP port, announcing the given opening line.
    pub async fn spawn_with_greeting(
        greeting: String,
        responder: impl FnMut(QmpRequest) -> Vec<ServerOp> + Send + 'static,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind fixture listener")?;
        let port = listener.local_addr()?.port();
        let address = Address::tcp("127.0.0.1", port);

        let mut responder: QmpResponder = Box::new(responder);
        let handle = tokio::spawn(async move {
            let result = async {
                let (stream, _) = listener.accept().await?;
                run_qmp_conn(stream, &greeting, &mut responder).await
            }
            .await;
            if let Err(err) = result {
                debug!("qmp fixture ended: {:#}", err);
            }
        });

        Ok(QmpServer { address, handle })
    }

    /// Listen on a Unix socket path with the standard greeting.
    pub async fn spawn_unix(
        path: &Path,
        responder: impl FnMut(QmpRequest) -> Vec<ServerOp> + Send + 'static,
    ) -> Result<Self> {
        let listener = UnixListener::bind(path).context("failed to bind fixture socket")?;
        let address = Address::unix(path);
        let greeting = default_greeting();

        let mut responder: QmpResponder = Box::new(responder);
        let handle = tokio::spawn(async move {
            let result = async {
                let (stream, _) = listener.accept().await?;
                run_qmp_conn(stream, &greeting, &mut responder).await
            }
            .await;
            if let Err(err) = result {
                debug!("qmp fixture ended: {:#}", err);
            }
        });

        Ok(QmpServer { address, handle })
    }

    /// Dial out to a client that is `accept`ing, then act as the server.
    pub async fn dial(
        address: &Address,
        responder: impl FnMut(QmpRequest) -> Vec<ServerOp> + Send + 'static,
    ) -> Result<Self> {
        let address = address.clone();
        let task_address = address.clone();
        let greeting = default_greeting();

        let mut responder: QmpResponder = Box::new(responder);
        let handle = tokio::spawn(async move {
            let result = async {
                match &task_address {
                    Address::Tcp { host, port } => {
                        let stream = dial_tcp(host, *port).await?;
                        run_qmp_conn(stream, &greeting, &mut responder).await
                    }
                    Address::Unix { path } => {
                        let stream = dial_unix(path).await?;
                        run_qmp_conn(stream, &greeting, &mut responder).await
                    }
                }
            }
            .await;
            if let Err(err) = result {
                debug!("qmp fixture ended: {:#}", err);
            }
        });

        Ok(QmpServer { address, handle })
    }
}

impl Drop for QmpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Handle to a running mock qtest server.
pub struct QtestServer {
    pub address: Address,
    handle: JoinHandle<()>,
}

impl QtestServer {
    /// Listen on a free TCP port.
    pub async fn spawn(
        responder: impl FnMut(Vec<String>) -> Vec<ServerOp> + Send + 'static,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind fixture listener")?;
        let port = listener.local_addr()?.port();
        let address = Address::tcp("127.0.0.1", port);

        let mut responder: QtestResponder = Box::new(responder);
        let handle = tokio::spawn(async move {
            let result = async {
                let (stream, _) = listener.accept().await?;
                run_qtest_conn(stream, &mut responder).await
            }
            .await;
            if let Err(err) = result {
                debug!("qtest fixture ended: {:#}", err);
            }
        });

        Ok(QtestServer { address, handle })
    }

    /// Listen on a Unix socket path.
    pub async fn spawn_unix(
        path: &Path,
        responder: impl FnMut(Vec<String>) -> Vec<ServerOp> + Send + 'static,
    ) -> Result<Self> {
        let listener = UnixListener::bind(path).context("failed to bind fixture socket")?;
        let address = Address::unix(path);

        let mut responder: QtestResponder = Box::new(responder);
        let handle = tokio::spawn(async move {
            let result = async {
                let (stream, _) = listener.accept().await?;
                run_qtest_conn(stream, &mut responder).await
            }
            .await;
            if let Err(err) = result {
                debug!("qtest fixture ended: {:#}", err);
            }
        });

        Ok(QtestServer { address, handle })
    }
}

impl Drop for QtestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Responder backed by a flat guest memory, covering the data-transfer
/// verbs plus `endianness`.
pub fn memory_responder(size: usize) -> impl FnMut(Vec<String>) -> Vec<ServerOp> + Send + 'static {
    let mut memory = vec![0u8; size];
    move |tokens| {
        let reply = match memory_op(&mut memory, &tokens) {
            Ok(line) => line,
            Err(reason) => format!("FAIL {}", reason),
        };
        vec![ServerOp::Send(reply)]
    }
}

fn memory_op(memory: &mut [u8], tokens: &[String]) -> std::result::Result<String, String> {
    let arg = |index: usize| -> std::result::Result<&str, String> {
        tokens
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| "missing argument".to_string())
    };
    let int_arg = |index: usize| -> std::result::Result<usize, String> {
        arg(index)?
            .parse::<usize>()
            .map_err(|err| format!("bad integer: {}", err))
    };
    let limit = memory.len();
    let range = move |addr: usize, size: usize| -> std::result::Result<std::ops::Range<usize>, String> {
        let end = addr.checked_add(size).ok_or("address overflow")?;
        if end > limit {
            return Err("out of bounds".to_string());
        }
        Ok(addr..end)
    };

    match arg(0)? {
        "read" => {
            let span = range(int_arg(1)?, int_arg(2)?)?;
            Ok(format!("OK 0x{}", hex::encode(&memory[span])))
        }
        "write" => {
            let span = range(int_arg(1)?, int_arg(2)?)?;
            let blob = arg(3)?
                .strip_prefix("0x")
                .ok_or("data must be 0x-prefixed")?;
            let data = hex::decode(blob).map_err(|err| format!("bad hex: {}", err))?;
            if data.len() != span.len() {
                return Err("size mismatch".to_string());
            }
            memory[span].copy_from_slice(&data);
            Ok("OK".to_string())
        }
        "b64read" => {
            let span = range(int_arg(1)?, int_arg(2)?)?;
            Ok(format!("OK {}", BASE64.encode(&memory[span])))
        }
        "b64write" => {
            let span = range(int_arg(1)?, int_arg(2)?)?;
            let data = BASE64
                .decode(arg(3)?.as_bytes())
                .map_err(|err| format!("bad base64: {}", err))?;
            if data.len() != span.len() {
                return Err("size mismatch".to_string());
            }
            memory[span].copy_from_slice(&data);
            Ok("OK".to_string())
        }
        "memset" => {
            let span = range(int_arg(1)?, int_arg(2)?)?;
            let value = int_arg(3)? as u8;
            memory[span].fill(value);
            Ok("OK".to_string())
        }
        "endianness" => Ok("OK little".to_string()),
        other => Err(format!("unknown command {}", other)),
    }
}

async fn run_qmp_conn<S>(stream: S, greeting: &str, responder: &mut QmpResponder) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    send_line(&mut write, greeting).await?;

    let mut negotiated = false;
    while let Some(line) = lines.next_line().await? {
        let msg: Value = serde_json::from_str(&line).context("client sent invalid JSON")?;
        let execute = msg
            .get("execute")
            .and_then(Value::as_str)
            .context("client message without execute")?
            .to_string();

        if !negotiated {
            if execute != "qmp_capabilities" {
                bail!("expected qmp_capabilities, got {}", execute);
            }
            negotiated = true;
            let mut reply = json!({"return": {}});
            if let Some(id) = msg.get("id") {
                reply["id"] = id.clone();
            }
            send_line(&mut write, &reply.to_string()).await?;
            continue;
        }

        let request = QmpRequest {
            execute,
            arguments: msg.get("arguments").cloned(),
            id: msg.get("id").cloned(),
        };
        for op in responder(request) {
            match op {
                ServerOp::Send(line) => send_line(&mut write, &line).await?,
                ServerOp::Close => {
                    write.shutdown().await?;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

async fn run_qtest_conn<S>(stream: S, responder: &mut QtestResponder) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        let tokens: Vec<String> = line.trim().split(' ').map(str::to_owned).collect();
        for op in responder(tokens) {
            match op {
                ServerOp::Send(line) => send_line(&mut write, &line).await?,
                ServerOp::Close => {
                    write.shutdown().await?;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

async fn send_line<S>(write: &mut WriteHalf<S>, line: &str) -> Result<()>
where
    S: AsyncWrite,
{
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await?;
    write.flush().await?;
    Ok(())
}

async fn dial_tcp(host: &str, port: u16) -> Result<TcpStream> {
    for _ in 0..50 {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => return Ok(stream),
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    bail!("client never started listening on {}:{}", host, port)
}

async fn dial_unix(path: &Path) -> Result<UnixStream> {
    for _ in 0..50 {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    bail!("client never started listening on {}", path.display())
}
