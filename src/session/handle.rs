use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::{
    FormDefinition, FormSession, FormSnapshot, PropagationReport, Services, SessionError,
    SessionResult, SubmitIssue,
};
use crate::config::RuntimeConfig;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Edit {
        address: String,
        value: JsonValue,
        reply: Reply<SessionResult<PropagationReport>>,
    },
    AddRow {
        group: String,
        reply: Reply<SessionResult<(usize, PropagationReport)>>,
    },
    RemoveRow {
        group: String,
        index: usize,
        reply: Reply<SessionResult<PropagationReport>>,
    },
    Snapshot {
        reply: Reply<FormSnapshot>,
    },
    Validate {
        reply: Reply<Vec<SubmitIssue>>,
    },
    Close,
}

/// Cloneable front end of a session running on its own task. Commands are
/// applied strictly in the order they are queued; reports produced by
/// aggregation results go to every [`SessionHandle::subscribe`] receiver.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<PropagationReport>,
}

impl SessionHandle {
    pub async fn spawn(
        definition: FormDefinition,
        config: RuntimeConfig,
        services: Services,
    ) -> (Self, PropagationReport) {
        let capacity = config.queue_capacity.max(1);
        let (session, report) = FormSession::open(definition, config, services).await;
        let (commands, rx) = mpsc::channel(capacity);
        let (updates, _) = broadcast::channel(capacity);
        let handle = Self {
            id: session.id(),
            commands,
            updates: updates.clone(),
        };
        tokio::spawn(run(session, rx, updates));
        (handle, report)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PropagationReport> {
        self.updates.subscribe()
    }

    pub async fn edit(&self, address: &str, value: JsonValue) -> SessionResult<PropagationReport> {
        self.request(|reply| Command::Edit {
            address: address.to_string(),
            value,
            reply,
        })
        .await?
    }

    pub async fn clear(&self, address: &str) -> SessionResult<PropagationReport> {
        self.edit(address, JsonValue::Null).await
    }

    pub async fn add_row(&self, group: &str) -> SessionResult<(usize, PropagationReport)> {
        self.request(|reply| Command::AddRow {
            group: group.to_string(),
            reply,
        })
        .await?
    }

    pub async fn remove_row(&self, group: &str, index: usize) -> SessionResult<PropagationReport> {
        self.request(|reply| Command::RemoveRow {
            group: group.to_string(),
            index,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> SessionResult<FormSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn validate_for_submit(&self) -> SessionResult<Vec<SubmitIssue>> {
        self.request(|reply| Command::Validate { reply }).await
    }

    /// Stops the session task. Commands already queued are still applied.
    pub async fn close(&self) -> SessionResult<()> {
        self.commands
            .send(Command::Close)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> SessionResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}

async fn run(
    mut session: FormSession,
    mut commands: mpsc::Receiver<Command>,
    updates: broadcast::Sender<PropagationReport>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Close) | None => break,
                Some(command) => dispatch(&mut session, command).await,
            },
            Some(completion) = session.next_completion() => {
                let report = session.complete(completion).await;
                if report.changed.is_empty() && report.diagnostics.is_empty() {
                    continue;
                }
                if updates.send(report).is_err() {
                    debug!("No subscribers for session {}", session.id());
                }
            }
        }
    }
    debug!("Session {} closed", session.id());
}

async fn dispatch(session: &mut FormSession, command: Command) {
    // a dropped reply receiver only means the caller stopped waiting
    match command {
        Command::Edit {
            address,
            value,
            reply,
        } => {
            let _ = reply.send(session.apply_edit(&address, value).await);
        }
        Command::AddRow { group, reply } => {
            let _ = reply.send(session.add_row(&group).await);
        }
        Command::RemoveRow {
            group,
            index,
            reply,
        } => {
            let _ = reply.send(session.remove_row(&group, index).await);
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
        }
        Command::Validate { reply } => {
            let _ = reply.send(session.validate_for_submit());
        }
        Command::Close => {}
    }
}
