//! Line-delimited JSON worker channel.
//!
//! Workers hold a persistent duplex TCP connection: they register with a
//! subsystem name, receive task messages, and answer with response
//! messages. One JSON document per line in both directions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use marduk_core::error::{Error, Result};
use marduk_task::message::{TaskCondition, TaskMessage};
use marduk_task::scheduler::TaskDispatcher;

/// Messages exchanged with subsystem workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// Worker to coordinator, once per connection.
    Register { subsystem: String },
    /// Coordinator to worker.
    Task {
        task_id: u64,
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<TaskCondition>,
    },
    /// Worker to coordinator.
    Response {
        subsystem: String,
        task_id: u64,
        result: Value,
    },
}

/// Worker registry and dispatch surface.
pub struct WorkerChannel {
    workers: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    dispatch_timeout: Duration,
}

impl WorkerChannel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            dispatch_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Registered subsystem names, sorted.
    pub async fn registered_subsystems(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Accept worker connections until the listener is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        info!(address = ?listener.local_addr().ok(), "worker channel listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "worker connected");
                    let channel = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = channel.handle_connection(stream).await {
                            warn!(%peer, %err, "worker connection closed with error");
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(line) = receiver.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        let mut subsystem: Option<String> = None;
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Register { subsystem: name }) => {
                    info!(subsystem = %name, "worker registered");
                    self.workers
                        .write()
                        .await
                        .insert(name.clone(), sender.clone());
                    subsystem = Some(name);
                }
                Ok(WorkerMessage::Response {
                    task_id, result, ..
                }) => {
                    let waiter = self.pending.lock().await.remove(&task_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(result);
                        }
                        None => debug!(task_id, "late or unknown response discarded"),
                    }
                }
                Ok(WorkerMessage::Task { .. }) => {
                    warn!("worker sent a task message, ignoring");
                }
                Err(err) => {
                    warn!(%err, "malformed worker message");
                }
            }
        }

        if let Some(name) = subsystem {
            self.workers.write().await.remove(&name);
            info!(subsystem = %name, "worker disconnected");
        }
        writer.abort();
        Ok(())
    }

    async fn sender_for(&self, target: Option<&str>) -> Result<mpsc::UnboundedSender<String>> {
        let workers = self.workers.read().await;
        if let Some(target) = target {
            return workers.get(target).cloned().ok_or_else(|| {
                Error::Validation(format!("no worker registered for subsystem '{target}'"))
            });
        }
        // Without a target, pick the first subsystem alphabetically so
        // dispatch stays deterministic.
        let mut names: Vec<&String> = workers.keys().collect();
        names.sort();
        names
            .first()
            .and_then(|name| workers.get(*name).cloned())
            .ok_or_else(|| Error::Validation("no workers registered".to_string()))
    }
}

impl Default for WorkerChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskDispatcher for WorkerChannel {
    async fn dispatch(&self, task: &TaskMessage) -> Result<Value> {
        let sender = self.sender_for(task.target.as_deref()).await?;

        let message = WorkerMessage::Task {
            task_id: task.task_id,
            query: task.query.clone(),
            target: task.target.clone(),
            condition: task.condition.clone(),
        };
        let line = serde_json::to_string(&message)?;

        let (waiter, receiver) = oneshot::channel();
        self.pending.lock().await.insert(task.task_id, waiter);

        if sender.send(line).is_err() {
            self.pending.lock().await.remove(&task.task_id);
            return Err(Error::Api("worker connection lost".to_string()));
        }

        match tokio::time::timeout(self.dispatch_timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&task.task_id);
                Err(Error::Api("worker dropped the response channel".to_string()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&task.task_id);
                Err(Error::Timeout)
            }
        }
    }
}
