#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex}
};
use async_trait::async_trait;
use tokio::io::DuplexStream;

use castproxy::{
    client::{AudioFormat, ClientId, MetaPack, Permission, Source},
    config::Limits,
    engine::{Engine, EngineSenders},
    hooks::SourceHandler,
    icecast::{SinkError, SinkFactory, SinkOptions, UpstreamSink}
};

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Options(String, AudioFormat),
    Open,
    Close,
    Send(Vec<u8>),
    Metadata(String)
}

/// Shared journal of everything the engine asked of its sinks, plus a
/// queue of errors the next send calls should fail with
#[derive(Default)]
pub struct SinkState {
    pub calls: Vec<SinkCall>,
    pub connected: bool,
    pub fail_send: VecDeque<SinkError>
}

pub struct MockSink {
    state: Arc<Mutex<SinkState>>
}

#[async_trait]
impl UpstreamSink for MockSink {
    fn apply_options(&mut self, options: SinkOptions) {
        self.state.lock().unwrap().calls.push(SinkCall::Options(options.mount, options.format));
    }

    fn connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn open(&mut self) -> Result<(), SinkError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SinkCall::Open);
        state.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SinkCall::Close);
        state.connected = false;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_send.pop_front() {
            return Err(err);
        }
        state.calls.push(SinkCall::Send(data.to_vec()));
        Ok(())
    }

    async fn send_metadata(&mut self, metadata: &str) -> Result<(), SinkError> {
        self.state.lock().unwrap().calls.push(SinkCall::Metadata(metadata.to_owned()));
        Ok(())
    }
}

pub struct MockSinkFactory {
    pub state: Arc<Mutex<SinkState>>
}

impl SinkFactory for MockSinkFactory {
    fn create(&self) -> Box<dyn UpstreamSink> {
        Box::new(MockSink { state: self.state.clone() })
    }
}

/// Handler writing every transition down as `<event>:<client name>`
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<String>>
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SourceHandler for RecordingHandler {
    fn on_connect(&self, _mount: &str, id: &ClientId) {
        self.events.lock().unwrap().push(format!("connect:{}", id.name));
    }

    fn on_disconnect(&self, _mount: &str, id: &ClientId) {
        self.events.lock().unwrap().push(format!("disconnect:{}", id.name));
    }

    fn on_live(&self, _mount: &str, id: &ClientId) {
        self.events.lock().unwrap().push(format!("live:{}", id.name));
    }

    fn on_unlive(&self, _mount: &str, id: &ClientId) {
        self.events.lock().unwrap().push(format!("unlive:{}", id.name));
    }

    fn on_metadata(&self, _mount: &str, id: &ClientId, metadata: &str) {
        self.events.lock().unwrap().push(format!("metadata:{}:{}", id.name, metadata));
    }
}

pub struct TestRig {
    pub senders: EngineSenders,
    pub engine: tokio::task::JoinHandle<()>,
    pub sink: Arc<Mutex<SinkState>>,
    pub handler: Arc<RecordingHandler>
}

impl TestRig {
    pub fn calls(&self) -> Vec<SinkCall> {
        self.sink.lock().unwrap().calls.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.handler.events()
    }

    pub fn fail_next_send(&self, err: SinkError) {
        self.sink.lock().unwrap().fail_send.push_back(err);
    }

    /// Total audio bytes the sink accepted
    pub fn bytes_sent(&self) -> usize {
        self.calls()
            .iter()
            .map(|call| match call {
                SinkCall::Send(data) => data.len(),
                _ => 0
            })
            .sum()
    }

    pub fn metadata_sent(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SinkCall::Metadata(v) => Some(v),
                _ => None
            })
            .collect()
    }
}

pub fn spawn_engine_with(limits: Limits) -> TestRig {
    let sink    = Arc::new(Mutex::new(SinkState::default()));
    let handler = Arc::new(RecordingHandler::default());

    let (engine, senders) = Engine::new(
        limits,
        Arc::new(MockSinkFactory { state: sink.clone() }),
        handler.clone()
    );
    let engine = tokio::spawn(engine.process_events());

    TestRig { senders, engine, sink, handler }
}

pub fn spawn_engine() -> TestRig {
    spawn_engine_with(Limits::default())
}

pub fn client_id(name: &str, mount: &str, addr: &str) -> ClientId {
    ClientId {
        name: name.to_owned(),
        pass: "pass".to_owned(),
        perm: Permission::Source,
        agent: Some("test-source".to_owned()),
        addr: addr.to_owned(),
        mount: mount.to_owned(),
        format: AudioFormat::Mp3
    }
}

pub fn meta_pack(id: &ClientId, data: &str) -> MetaPack {
    MetaPack {
        data: data.to_owned(),
        id: Arc::new(id.clone()),
        seen: false
    }
}

/// Admits a source built around an in-memory pipe and hands back the
/// client half to feed audio through
pub async fn admit(senders: &EngineSenders, id: ClientId) -> DuplexStream {
    let (client, server) = tokio::io::duplex(65536);
    let source           = Source::new(Box::new(server), id);
    senders.admit.send(source).await.expect("engine should accept admissions");
    client
}
