use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::{
    config::Limits,
    engine::{Engine, EngineSenders},
    hooks::SourceHandler,
    icecast::SinkFactory
};

/// Process-wide handle to the running engine.
///
/// The senders behind it are swapped whenever the supervisor replaces
/// the engine, so producers fetch them per request and never cache
/// them.
pub struct EngineHandle {
    senders: RwLock<EngineSenders>
}

impl EngineHandle {
    pub async fn senders(&self) -> EngineSenders {
        self.senders.read().await.clone()
    }
}

/// Starts the engine under supervision and returns its handle.
///
/// The supervision loop runs the engine as its own task; when that task
/// dies of a panic (a fatal upstream error, or a bug), a fresh engine
/// with empty state takes its place. Unwinding the old task drops every
/// mount, which hangs up every source socket through the reader kill
/// channels.
pub fn start(limits: Limits, sinks: Arc<dyn SinkFactory>,
             handler: Arc<dyn SourceHandler>) -> Arc<EngineHandle> {
    let (engine, senders) = Engine::new(limits.clone(), sinks.clone(), handler.clone());

    let handle    = Arc::new(EngineHandle { senders: RwLock::new(senders) });
    let handle_cl = handle.clone();

    tokio::spawn(async move {
        let mut engine = engine;
        loop {
            let task = tokio::spawn(engine.process_events());

            match task.await {
                Ok(()) => error!("Engine returned, restarting it"),
                Err(e) if e.is_panic() => {
                    let reason = e.into_panic();
                    let reason = reason
                        .downcast_ref::<String>()
                        .map(String::as_str)
                        .or_else(|| reason.downcast_ref::<&str>().copied())
                        .unwrap_or("unknown panic");
                    error!("Engine died ({}), restarting it", reason);
                },
                Err(_) => error!("Engine task cancelled, restarting it")
            }

            let (new_engine, senders) = Engine::new(limits.clone(), sinks.clone(), handler.clone());
            *handle_cl.senders.write().await = senders;
            engine = new_engine;

            info!("Engine restarted with fresh state");
        }
    });

    handle
}
