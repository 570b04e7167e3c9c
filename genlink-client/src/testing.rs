//! In-process image service used by the tests.
//!
//! Speaks the same frame protocol as the real service: an authentication
//! handshake, then one reply per task. Behaviour is driven by
//! [`MockOptions`] and by a few request parameters:
//!
//! - `delayMs`: reply after this many milliseconds
//! - `silent`: never reply
//! - `fail`: reply with a task error
//!
//! An inference whose `positivePrompt` is `"fail"` also gets a task error.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub const API_KEY: &str = "test-key";
pub const SESSION_UUID: &str = "6f1c2a9e-0000-4000-8000-00000000beef";

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub api_key: String,
    /// Delay before answering the authentication message.
    pub auth_delay: Duration,
    /// Never answer task messages.
    pub silent: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            api_key: API_KEY.to_string(),
            auth_delay: Duration::ZERO,
            silent: false,
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    auth_frames: Arc<Mutex<Vec<Value>>>,
    task_frames: Arc<Mutex<Vec<Value>>>,
    kill: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(options: MockOptions) -> Self {
        Self::start_at("127.0.0.1:0".parse().unwrap(), options).await
    }

    /// Starts on a specific address, e.g. to come back after [`stop`](Self::stop).
    pub async fn start_at(addr: SocketAddr, options: MockOptions) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let auth_frames = Arc::new(Mutex::new(Vec::new()));
        let task_frames = Arc::new(Mutex::new(Vec::new()));
        let (kill, _) = broadcast::channel(4);

        let accept_task = {
            let accepted = accepted.clone();
            let auth_frames = auth_frames.clone();
            let task_frames = task_frames.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        options.clone(),
                        auth_frames.clone(),
                        task_frames.clone(),
                        kill.subscribe(),
                    ));
                }
            })
        };

        Self {
            addr,
            accepted,
            auth_frames,
            task_frames,
            kill,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of TCP connections accepted.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Authentication messages received, in order.
    pub fn auth_frames(&self) -> Vec<Value> {
        self.auth_frames.lock().clone()
    }

    /// Task messages received, in order.
    pub fn task_frames(&self) -> Vec<Value> {
        self.task_frames.lock().clone()
    }

    /// Drops every open connection without a close handshake.
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Stops listening and drops every open connection.
    pub async fn stop(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
        let _ = self.kill.send(());
    }
}

async fn serve(
    stream: TcpStream,
    options: MockOptions,
    auth_frames: Arc<Mutex<Vec<Value>>>,
    task_frames: Arc<Mutex<Vec<Value>>>,
    mut kill: broadcast::Receiver<()>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    // Replies may be delayed, so they go through a queue.
    let (replies, mut queue) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(reply) = queue.recv().await {
            if sink.send(Message::Text(reply)).await.is_err() {
                return;
            }
        }
    });

    loop {
        let message = tokio::select! {
            _ = kill.recv() => break,
            message = stream.next() => message,
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        if request["taskType"] == "authentication" {
            auth_frames.lock().push(request.clone());
            tokio::time::sleep(options.auth_delay).await;
            let reply = if request["apiKey"] == options.api_key.as_str() {
                json!({
                    "data": [{
                        "taskType": "authentication",
                        "connectionSessionUUID": SESSION_UUID,
                    }]
                })
            } else {
                json!({
                    "errors": [{
                        "code": "invalidApiKey",
                        "taskType": "authentication",
                        "message": "Invalid API key",
                    }]
                })
            };
            let _ = replies.send(reply.to_string());
            continue;
        }

        task_frames.lock().push(request.clone());
        if options.silent || request["silent"] == true {
            continue;
        }
        let delay = Duration::from_millis(request["delayMs"].as_u64().unwrap_or(0));
        let reply = task_reply(&request);
        let replies = replies.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = replies.send(reply.to_string());
        });
    }

    writer.abort();
}

fn task_reply(request: &Value) -> Value {
    let task_uuid = request["taskUUID"].as_str().unwrap_or_default().to_string();
    let task_type = request["taskType"].as_str().unwrap_or_default().to_string();

    if request["fail"] == true || request["positivePrompt"] == "fail" {
        return json!({
            "errors": [{
                "taskUUID": task_uuid,
                "taskType": task_type,
                "message": "simulated failure",
            }]
        });
    }

    let payload = match task_type.as_str() {
        "imageInference" => json!({
            "taskType": task_type,
            "taskUUID": task_uuid,
            "imageUUID": format!("img-{}", task_uuid),
            "imageURL": format!("https://cdn.test/{}.png", task_uuid),
            "cost": 0.0013,
            "seed": request["seed"].as_u64().unwrap_or(42),
        }),
        "uploadImage" => json!({
            "taskType": task_type,
            "taskUUID": task_uuid,
            "imageUUID": format!("upload-{}", task_uuid),
        }),
        "getImageResult" => json!({
            "taskType": task_type,
            "taskUUID": task_uuid,
            "imageUUID": request["jobId"],
            "status": "success",
        }),
        _ => json!({
            "taskType": task_type,
            "taskUUID": task_uuid,
            "echo": request,
        }),
    };
    json!({ "data": [payload] })
}
