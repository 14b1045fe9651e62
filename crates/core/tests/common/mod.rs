//! Shared test doubles: a scripted engine adapter and an in-memory
//! transport

// not every test binary uses every helper
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use warden_core::container::runtime::{
    BuildOptions, ContainerHandle, ContainerRuntime, ContainerState, ContainerStatus, Engine,
    RunOptions,
};
use warden_core::protocol::ConnectionIdentity;
use warden_core::transport::{ToolTransport, TransportEvent};
use warden_core::{Error, ResponseEnvelope, Result, WireMessage};

/// How the mock engine reacts to `stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    Succeed,
    Fail,
}

/// Scripted engine adapter recording every call
#[derive(Default)]
pub struct MockRuntime {
    pub fail_run: AtomicBool,
    pub stop_behavior: Mutex<Option<StopBehavior>>,
    pub run_options: Mutex<Vec<RunOptions>>,
    pub stopped: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub statuses: Mutex<HashMap<String, ContainerStatus>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status);
    }

    fn stop_behavior(&self) -> StopBehavior {
        self.stop_behavior
            .lock()
            .unwrap()
            .unwrap_or(StopBehavior::Succeed)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn engine(&self) -> Engine {
        Engine::Docker
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn version(&self) -> Result<String> {
        Ok("mock-1.0".to_string())
    }

    async fn pull(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(true)
    }

    async fn load_image(&self, _tarball: &Path) -> Result<()> {
        Ok(())
    }

    async fn build(&self, opts: &BuildOptions) -> Result<String> {
        Ok(format!("sha256:mock-{}", opts.tag))
    }

    async fn inspect_labels(&self, _image: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn run(&self, opts: &RunOptions) -> Result<ContainerHandle> {
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(Error::Runtime("scripted run failure".to_string()));
        }
        self.run_options.lock().unwrap().push(opts.clone());
        let name = opts.name.clone().unwrap_or_else(|| "anon".to_string());
        Ok(ContainerHandle {
            id: format!("id-{}", name),
            name,
            engine: Engine::Docker,
        })
    }

    async fn stop(&self, handle: &ContainerHandle, _timeout_secs: Option<u32>) -> Result<()> {
        self.stopped.lock().unwrap().push(handle.name.clone());
        match self.stop_behavior() {
            StopBehavior::Succeed => Ok(()),
            StopBehavior::Fail => Err(Error::Runtime("scripted stop failure".to_string())),
        }
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<()> {
        self.killed.lock().unwrap().push(handle.name.clone());
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.removed.lock().unwrap().push(handle.name.clone());
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(&handle.name)
            .cloned()
            .unwrap_or(ContainerStatus {
                state: ContainerState::Running,
                started_at: None,
                exited_at: None,
                exit_code: None,
            }))
    }
}

/// In-memory transport: tests inject wire messages and observe replies
pub struct MemoryTransport {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    sent_tx: mpsc::UnboundedSender<(ConnectionIdentity, ResponseEnvelope)>,
}

impl MemoryTransport {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<(ConnectionIdentity, ResponseEnvelope)>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        (
            Self {
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                sent_tx,
            },
            sent_rx,
        )
    }

    pub fn inject(&self, identity: ConnectionIdentity, wire: WireMessage) {
        self.events_tx
            .send(TransportEvent::Request { identity, wire })
            .unwrap();
    }
}

impl ToolTransport for MemoryTransport {
    fn bind(&self, _endpoint: &str) -> Result<()> {
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn send_response(
        &self,
        identity: &ConnectionIdentity,
        response: &ResponseEnvelope,
    ) -> Result<()> {
        self.sent_tx
            .send((identity.clone(), response.clone()))
            .map_err(|_| Error::NotBound)
    }

    fn close(&self) {}
}

/// Decode a raw wire message literal
pub fn wire(topic: &str, correlation: &str, arguments: serde_json::Value) -> WireMessage {
    let raw = serde_json::json!({
        "topic": topic,
        "correlation": correlation,
        "arguments": arguments,
    });
    WireMessage::decode(raw.to_string().as_bytes()).unwrap()
}
