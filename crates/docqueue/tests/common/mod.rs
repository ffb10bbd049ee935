//! Shared test harness: a scriptable mock transport and payload builders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use docqueue::transport::{SubscriptionHandle, TransportAdapter};
use docqueue::{
    CommandAck, CommandKind, CommandReply, CommandRequest, JobDelta, JobId, JobState, PushEvent,
    RemoteJob, TransportError,
};

/// Initializes test logging once. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Lets the engine actor drain its channels. Paused-time tests auto-advance
/// through this sleep once every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[derive(Default)]
struct MockState {
    snapshot: Vec<RemoteJob>,
    replies: VecDeque<Result<CommandReply, TransportError>>,
    commands: Vec<CommandRequest>,
    next_durable_id: i64,
    fetches: usize,
}

/// Scriptable in-memory transport.
///
/// `fetch_snapshot` returns whatever `set_snapshot` installed.
/// `send_command` records the request and pops a queued reply; without one
/// it acknowledges, assigning sequential durable ids to submits. Push
/// events are injected with [`MockTransport::push`].
pub struct MockTransport {
    state: Mutex<MockState>,
    push_tx: Mutex<Option<mpsc::Sender<PushEvent>>>,
    reply_delay: Mutex<Duration>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_durable_id: 100,
                ..Default::default()
            }),
            push_tx: Mutex::new(None),
            reply_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_snapshot(&self, jobs: Vec<RemoteJob>) {
        self.state.lock().unwrap().snapshot = jobs;
    }

    pub fn set_next_durable_id(&self, id: i64) {
        self.state.lock().unwrap().next_durable_id = id;
    }

    /// Queues an explicit reply for the next command.
    pub fn queue_reply(&self, reply: Result<CommandReply, TransportError>) {
        self.state.lock().unwrap().replies.push_back(reply);
    }

    /// Delays every command reply, keeping commands in flight.
    pub fn set_reply_delay(&self, delay: Duration) {
        *self.reply_delay.lock().unwrap() = delay;
    }

    pub fn sent_commands(&self) -> Vec<CommandRequest> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    /// Injects a push event, as if it arrived over the channel.
    pub async fn push(&self, event: PushEvent) {
        let tx = self.push_tx.lock().unwrap().clone();
        let tx = tx.expect("engine has not subscribed yet");
        tx.send(event).await.expect("engine dropped the push channel");
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    async fn fetch_snapshot(&self) -> Result<Vec<RemoteJob>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        Ok(state.snapshot.clone())
    }

    async fn send_command(&self, request: CommandRequest) -> Result<CommandReply, TransportError> {
        let delay = *self.reply_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let kind = request.kind;
        state.commands.push(request);

        if let Some(reply) = state.replies.pop_front() {
            return reply;
        }
        let ack = if kind == CommandKind::Submit {
            let id = state.next_durable_id;
            state.next_durable_id += 1;
            CommandAck {
                id: Some(JobId::Durable(id)),
            }
        } else {
            CommandAck::default()
        };
        Ok(CommandReply::Ack(ack))
    }

    fn subscribe(&self, updates: mpsc::Sender<PushEvent>) -> SubscriptionHandle {
        *self.push_tx.lock().unwrap() = Some(updates);
        SubscriptionHandle::new(tokio::spawn(async {}))
    }
}

/// Builds a server job payload with its event clock at `event_time`.
pub fn remote_job_at(
    id: i64,
    source_file: &str,
    status: JobState,
    event_time: DateTime<Utc>,
) -> RemoteJob {
    RemoteJob {
        id: JobId::Durable(id),
        source_file: source_file.to_string(),
        status,
        progress: None,
        attempt: Some(0),
        created_at: event_time,
        started_at: None,
        completed_at: None,
        error_message: None,
        provider: Some("openai".to_string()),
        prompt_id: Some("summary".to_string()),
        updated_at: Some(event_time),
    }
}

pub fn remote_job(id: i64, source_file: &str, status: JobState) -> RemoteJob {
    remote_job_at(id, source_file, status, Utc::now())
}

/// Builds a push delta with an explicit event time.
pub fn delta_at(
    id: i64,
    status: Option<JobState>,
    progress: Option<f64>,
    event_time: DateTime<Utc>,
) -> JobDelta {
    JobDelta {
        id: JobId::Durable(id),
        status,
        progress,
        error_message: None,
        completed_at: None,
        event_time: Some(event_time),
    }
}
