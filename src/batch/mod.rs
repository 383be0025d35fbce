//! Batch command protocol
//!
//! Commands are built up front, submitted as one batch, and answered with one
//! result per command in submission order. A failing item never aborts the
//! rest of the batch.
//!
//! A spawn can carry follow-up commands that target the actor it is about to
//! create. The caller cannot know that id yet, so follow-ups name
//! [`CommandTarget::PendingFromThisBatchItem`] and [`execute`] substitutes
//! the real id once the spawn succeeds.

use serde::{Deserialize, Serialize};

use crate::core::error::{CaptureError, Result};
use crate::core::types::{ActorId, Transform};
use crate::engine::{Blueprint, Engine};

/// Actor a command applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandTarget {
    Concrete(ActorId),
    /// The actor created by the spawn this command is chained to
    PendingFromThisBatchItem,
}

impl CommandTarget {
    /// Resolve against the actor spawned by the enclosing item, if any
    pub fn resolve(self, spawned: Option<ActorId>) -> Option<ActorId> {
        match self {
            CommandTarget::Concrete(id) => Some(id),
            CommandTarget::PendingFromThisBatchItem => spawned,
        }
    }
}

impl From<ActorId> for CommandTarget {
    fn from(id: ActorId) -> Self {
        CommandTarget::Concrete(id)
    }
}

/// Everything needed to spawn one actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub blueprint: Blueprint,
    pub transform: Transform,
    pub parent: Option<CommandTarget>,
    /// Commands run right after the spawn, in order
    pub then: Vec<Command>,
}

impl SpawnRequest {
    pub fn new(blueprint: Blueprint, transform: Transform) -> Self {
        Self {
            blueprint,
            transform,
            parent: None,
            then: Vec::new(),
        }
    }

    pub fn attached_to(mut self, parent: impl Into<CommandTarget>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn then(mut self, command: Command) -> Self {
        self.then.push(command);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    SpawnActor(SpawnRequest),
    SetAutopilot { target: CommandTarget, enabled: bool },
    DestroyActor(ActorId),
}

impl Command {
    pub fn spawn(request: SpawnRequest) -> Self {
        Command::SpawnActor(request)
    }

    /// Enable or disable autopilot on the actor spawned by the same item
    pub fn autopilot_on_spawned(enabled: bool) -> Self {
        Command::SetAutopilot {
            target: CommandTarget::PendingFromThisBatchItem,
            enabled,
        }
    }

    pub fn destroy(id: ActorId) -> Self {
        Command::DestroyActor(id)
    }

    /// Replace every pending target with the given actor
    pub fn resolve(&self, spawned: ActorId) -> Command {
        let pin = |target: CommandTarget| {
            CommandTarget::Concrete(target.resolve(Some(spawned)).unwrap_or(spawned))
        };
        match self {
            Command::SpawnActor(request) => Command::SpawnActor(SpawnRequest {
                parent: request.parent.map(pin),
                ..request.clone()
            }),
            Command::SetAutopilot { target, enabled } => {
                Command::SetAutopilot {
                    target: pin(*target),
                    enabled: *enabled,
                }
            }
            Command::DestroyActor(id) => Command::DestroyActor(*id),
        }
    }
}

/// Raw per-item answer as reported by an engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    pub actor_id: Option<ActorId>,
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(id: ActorId) -> Self {
        Self {
            actor_id: Some(id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            actor_id: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of one batch item
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    Ok(ActorId),
    Failed(String),
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, BatchResult::Ok(_))
    }

    pub fn actor_id(&self) -> Option<ActorId> {
        match self {
            BatchResult::Ok(id) => Some(*id),
            BatchResult::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            BatchResult::Ok(_) => None,
            BatchResult::Failed(e) => Some(e),
        }
    }
}

impl From<CommandResponse> for BatchResult {
    fn from(response: CommandResponse) -> Self {
        match (response.error, response.actor_id) {
            (Some(error), _) => BatchResult::Failed(error),
            (None, Some(id)) => BatchResult::Ok(id),
            (None, None) => BatchResult::Failed("engine reported no actor".into()),
        }
    }
}

/// Submit a batch and correlate the answers with the commands
///
/// `results[i]` always describes `commands[i]`. With `synchronous` set, every
/// side effect is visible to queries issued after this returns; otherwise
/// only from the next tick on.
pub fn submit(
    engine: &dyn Engine,
    commands: &[Command],
    synchronous: bool,
) -> Result<Vec<BatchResult>> {
    if commands.is_empty() {
        return Ok(Vec::new());
    }

    let responses = engine.apply_batch(commands, synchronous)?;
    if responses.len() != commands.len() {
        return Err(CaptureError::BatchMismatch {
            expected: commands.len(),
            actual: responses.len(),
        });
    }

    let results: Vec<BatchResult> = responses.into_iter().map(BatchResult::from).collect();
    tracing::debug!(
        submitted = commands.len(),
        failed = results.iter().filter(|r| !r.is_ok()).count(),
        synchronous,
        "batch applied"
    );
    Ok(results)
}

/// Primitive operations used to execute batch items one at a time
pub trait CommandSink {
    fn spawn(
        &mut self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
    ) -> std::result::Result<ActorId, String>;

    fn set_autopilot(&mut self, actor: ActorId, enabled: bool) -> std::result::Result<(), String>;

    fn destroy(&mut self, actor: ActorId) -> std::result::Result<(), String>;
}

/// Execute every command in order, one response per command
///
/// Follow-ups run with pending targets resolved to the freshly spawned actor.
/// If a follow-up fails the item is reported as failed and its actor is
/// destroyed again so nothing is left behind untracked.
pub fn execute(sink: &mut dyn CommandSink, commands: &[Command]) -> Vec<CommandResponse> {
    commands.iter().map(|command| execute_item(sink, command, None)).collect()
}

fn execute_item(
    sink: &mut dyn CommandSink,
    command: &Command,
    spawned: Option<ActorId>,
) -> CommandResponse {
    match command {
        Command::SpawnActor(request) => {
            let parent = match request.parent {
                None => None,
                Some(target) => match target.resolve(spawned) {
                    Some(id) => Some(id),
                    None => {
                        return CommandResponse::failed(
                            "parent refers to an actor not spawned by this item",
                        )
                    }
                },
            };

            let id = match sink.spawn(&request.blueprint, &request.transform, parent) {
                Ok(id) => id,
                Err(e) => return CommandResponse::failed(e),
            };

            for follow_up in &request.then {
                let response = execute_item(sink, &follow_up.resolve(id), Some(id));
                if let Some(error) = response.error {
                    if let Err(cleanup) = sink.destroy(id) {
                        tracing::warn!(
                            actor = %id,
                            error = %cleanup,
                            "could not destroy actor after failed follow-up"
                        );
                    }
                    return CommandResponse::failed(format!("{} (follow-up of {})", error, id));
                }
            }
            CommandResponse::ok(id)
        }
        Command::SetAutopilot { target, enabled } => match target.resolve(spawned) {
            Some(id) => match sink.set_autopilot(id, *enabled) {
                Ok(()) => CommandResponse::ok(id),
                Err(e) => CommandResponse::failed(e),
            },
            None => CommandResponse::failed(
                "autopilot target refers to an actor not spawned by this item",
            ),
        },
        Command::DestroyActor(id) => match sink.destroy(*id) {
            Ok(()) => CommandResponse::ok(*id),
            Err(e) => CommandResponse::failed(e),
        },
    }
}
