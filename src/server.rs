use std::io;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::StoreCredentials;
use crate::protocol::{self, Reply, OP_AUTH, OP_COMPACT, OP_GET, OP_PING, OP_SET};
use crate::StoreEngine;

/// TCP front of the record store. One task per connection.
pub struct StoreServer {
    engine: Arc<StoreEngine>,
    credentials: Option<StoreCredentials>,
}

impl StoreServer {
    /// `credentials` of `None` accepts every connection without AUTH.
    pub fn new(engine: Arc<StoreEngine>, credentials: Option<StoreCredentials>) -> Self {
        Self { engine, credentials }
    }

    pub async fn run(self, addr: &str) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Record store listening on {}", listener.local_addr()?);
        self.serve(listener).await;
        Ok(())
    }

    /// Accepts on an already bound listener until the task is dropped.
    pub async fn serve(self, listener: TcpListener) {
        let credentials = Arc::new(self.credentials);
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let engine = self.engine.clone();
                    let credentials = credentials.clone();
                    tokio::spawn(async move {
                        debug!("Store connection from {}", peer);
                        if let Err(e) = handle_client(socket, engine, credentials).await {
                            // Peers hanging up mid-frame are routine
                            if e.kind() != io::ErrorKind::UnexpectedEof {
                                warn!("Store client {} error: {}", peer, e);
                            }
                        }
                    });
                }
                Err(e) => error!("Connection failed: {}", e),
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    engine: Arc<StoreEngine>,
    credentials: Arc<Option<StoreCredentials>>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut authenticated = credentials.is_none();

    while let Some(frame) = protocol::read_frame(&mut reader).await? {
        if frame.op == OP_AUTH {
            let reply = handle_auth(&frame.payload, (*credentials).as_ref());
            authenticated = reply == Reply::Ok;
            protocol::write_reply(&mut writer, &reply).await?;
            if !authenticated {
                return Ok(());
            }
            continue;
        }

        if !authenticated {
            protocol::write_reply(&mut writer, &Reply::Error("authentication required".into())).await?;
            return Ok(());
        }

        let reply = match frame.op {
            OP_SET => handle_set(frame.payload, &engine).await,
            OP_GET => handle_get(frame.payload, &engine).await,
            OP_PING => Reply::Ok,
            OP_COMPACT => handle_compact(&engine).await,
            op => {
                warn!("Unknown OpCode: 0x{:02X}", op);
                Reply::Error(format!("unknown op 0x{:02X}", op))
            }
        };
        protocol::write_reply(&mut writer, &reply).await?;
    }
    Ok(())
}

fn handle_auth(payload: &[u8], expected: Option<&StoreCredentials>) -> Reply {
    let (user, pass) = match protocol::decode_auth(payload) {
        Ok(pair) => pair,
        Err(e) => return Reply::Error(e.to_string()),
    };
    match expected {
        None => Reply::Ok,
        Some(c) if c.user == user && c.pass == pass => Reply::Ok,
        Some(_) => {
            warn!("Rejected store login for user {:?}", user);
            Reply::Error("invalid credentials".into())
        }
    }
}

async fn handle_set(payload: Vec<u8>, engine: &Arc<StoreEngine>) -> Reply {
    let pairs = match protocol::decode_batch(&payload) {
        Ok(pairs) if !pairs.is_empty() => pairs,
        Ok(_) => return Reply::Error("empty batch".into()),
        Err(e) => return Reply::Error(e.to_string()),
    };

    // File I/O stays off the reactor threads
    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || engine.set_many(pairs)).await {
        Ok(Ok(())) => Reply::Ok,
        Ok(Err(e)) => {
            error!("Store write failed: {}", e);
            Reply::Error(e.to_string())
        }
        Err(e) => Reply::Error(format!("write task failed: {}", e)),
    }
}

async fn handle_get(payload: Vec<u8>, engine: &Arc<StoreEngine>) -> Reply {
    let key = match String::from_utf8(payload) {
        Ok(key) => key,
        Err(_) => return Reply::Error("key is not utf-8".into()),
    };

    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || engine.get(&key)).await {
        Ok(Ok(Some(value))) => Reply::Value(value),
        Ok(Ok(None)) => Reply::NotFound,
        Ok(Err(e)) => {
            error!("Store read failed: {}", e);
            Reply::Error(e.to_string())
        }
        Err(e) => Reply::Error(format!("read task failed: {}", e)),
    }
}

async fn handle_compact(engine: &Arc<StoreEngine>) -> Reply {
    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || engine.compact()).await {
        Ok(Ok(_)) => Reply::Ok,
        Ok(Err(e)) => {
            error!("Compaction Failed: {}", e);
            Reply::Error(e.to_string())
        }
        Err(e) => Reply::Error(format!("compaction task failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_reply, write_frame};

    async fn start(credentials: Option<StoreCredentials>) -> (std::net::SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(StoreEngine::open(&dir.path().join("store.dat"), false).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(StoreServer::new(engine, credentials).serve(listener));
        (addr, dir)
    }

    #[tokio::test]
    async fn set_then_get_over_tcp() {
        let (addr, _dir) = start(None).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let payload = protocol::encode_batch(&[("video:abc".into(), b"rec".to_vec())]).unwrap();
        write_frame(&mut stream, OP_SET, &payload).await.unwrap();
        assert_eq!(read_reply(&mut stream).await.unwrap(), Reply::Ok);

        write_frame(&mut stream, OP_GET, b"video:abc").await.unwrap();
        assert_eq!(read_reply(&mut stream).await.unwrap(), Reply::Value(b"rec".to_vec()));

        write_frame(&mut stream, OP_GET, b"video:missing").await.unwrap();
        assert_eq!(read_reply(&mut stream).await.unwrap(), Reply::NotFound);
    }

    #[tokio::test]
    async fn malformed_set_is_an_error_reply() {
        let (addr, _dir) = start(None).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        write_frame(&mut stream, OP_SET, &[9, 9, 9]).await.unwrap();
        assert!(matches!(read_reply(&mut stream).await.unwrap(), Reply::Error(_)));

        // Connection survives the bad frame
        write_frame(&mut stream, OP_PING, &[]).await.unwrap();
        assert_eq!(read_reply(&mut stream).await.unwrap(), Reply::Ok);
    }

    #[tokio::test]
    async fn auth_is_required_when_configured() {
        let creds = StoreCredentials { user: "u".into(), pass: "p".into() };
        let (addr, _dir) = start(Some(creds)).await;

        let mut anon = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut anon, OP_PING, &[]).await.unwrap();
        assert!(matches!(read_reply(&mut anon).await.unwrap(), Reply::Error(_)));

        let mut wrong = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut wrong, OP_AUTH, &protocol::encode_auth("u", "x").unwrap()).await.unwrap();
        assert!(matches!(read_reply(&mut wrong).await.unwrap(), Reply::Error(_)));

        let mut good = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut good, OP_AUTH, &protocol::encode_auth("u", "p").unwrap()).await.unwrap();
        assert_eq!(read_reply(&mut good).await.unwrap(), Reply::Ok);
        write_frame(&mut good, OP_PING, &[]).await.unwrap();
        assert_eq!(read_reply(&mut good).await.unwrap(), Reply::Ok);
    }
}
