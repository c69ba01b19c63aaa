use thiserror::Error;

mod ids;
pub use ids::*;
mod model;
pub use model::*;
mod workflow;
pub use workflow::*;

pub mod editor;
pub mod history;
pub mod lock;
pub mod params;
pub mod readiness;
pub mod reconcile;
pub mod storyboard;

pub use editor::{
    ConfirmStep3Error, ConfirmVideoError, EditorOptions, EditorSnapshot, Notice, StoryEditor,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("beat not found: {0}")]
    BeatNotFound(BeatId),
    #[error("character not found: {0}")]
    CharacterNotFound(CharacterId),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("task already applied: {0}")]
    TaskAlreadyApplied(TaskId),
    #[error("task {0} has unexpected type {1:?}")]
    UnexpectedTaskKind(TaskId, TaskKind),
    #[error("missing task reference: {0}")]
    MissingRef(&'static str),
    #[error("story workflow not initialised")]
    NoWorkflow,
    #[error("invalid render parameters: {0}")]
    InvalidParams(String),
    #[error("history empty: {0}")]
    HistoryEmpty(&'static str),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
