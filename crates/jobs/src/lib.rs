use crossbeam_channel::{tick, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::{sync::Arc, thread, time::Duration};
use story_workflow::{GenerationTask, TaskId, WorkflowError};
use thiserror::Error;
use tracing::{debug, info, warn};

mod apply;
pub use apply::*;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("sidecar stopped")]
    Stopped,
    #[error("status source failed for {0}: {1}")]
    Source(TaskId, String),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Output of a finished generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutput {
    pub url: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskPoll {
    Pending,
    Started,
    Succeeded(TaskOutput),
    Failed(String),
    Revoked,
}

impl TaskPoll {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_) | Self::Revoked)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub task: GenerationTask,
    pub status: TaskPoll,
}

/// Where task status comes from, e.g. a render service's status endpoint.
/// Called from the sidecar's worker thread.
pub trait TaskStatusSource: Send + Sync + 'static {
    fn poll(&self, task: &GenerationTask) -> Result<TaskPoll, TaskError>;
}

struct Tracked {
    task: GenerationTask,
    last: Option<TaskPoll>,
}

#[derive(Default)]
struct SidecarState {
    tracked: BTreeMap<TaskId, Tracked>,
    /// Tasks that reached a terminal status. Never tracked again.
    finished: HashSet<TaskId>,
}

#[derive(Clone)]
pub struct TaskSidecarHandle {
    tx_track: Sender<GenerationTask>,
    tx_cancel: Sender<TaskId>,
    pub events: Receiver<TaskEvent>,
    state: Arc<Mutex<SidecarState>>,
}

pub struct TaskSidecar;

impl TaskSidecar {
    /// Spawns the worker thread. It polls every tracked task once per
    /// `poll_interval` and exits when every handle has been dropped.
    pub fn start(source: Arc<dyn TaskStatusSource>, poll_interval: Duration) -> TaskSidecarHandle {
        let (tx_track, rx_track) = unbounded::<GenerationTask>();
        let (tx_cancel, rx_cancel) = unbounded::<TaskId>();
        let (tx_events, rx_events) = unbounded::<TaskEvent>();
        let state = Arc::new(Mutex::new(SidecarState::default()));

        {
            let state = state.clone();
            let ticker = tick(poll_interval);
            thread::spawn(move || loop {
                crossbeam_channel::select! {
                    recv(rx_track) -> msg => {
                        let Ok(task) = msg else { break };
                        let mut st = state.lock();
                        if st.finished.contains(&task.id) || st.tracked.contains_key(&task.id) {
                            debug!(task_id = %task.id, "task already tracked or finished");
                            continue;
                        }
                        debug!(task_id = %task.id, kind = ?task.kind, "tracking task");
                        st.tracked.insert(task.id.clone(), Tracked { task, last: None });
                    }
                    recv(rx_cancel) -> msg => {
                        let Ok(task_id) = msg else { break };
                        let removed = {
                            let mut st = state.lock();
                            let removed = st.tracked.remove(&task_id);
                            if removed.is_some() {
                                st.finished.insert(task_id.clone());
                            }
                            removed
                        };
                        if let Some(tracked) = removed {
                            info!(task_id = %task_id, "task cancelled");
                            let _ = tx_events.send(TaskEvent { task: tracked.task, status: TaskPoll::Revoked });
                        }
                    }
                    recv(ticker) -> _ => {
                        if !poll_all(source.as_ref(), &state, &tx_events) {
                            break;
                        }
                    }
                }
            });
        }

        TaskSidecarHandle {
            tx_track,
            tx_cancel,
            events: rx_events,
            state,
        }
    }
}

/// Polls every tracked task outside the lock and emits an event for each
/// status change. Returns false once the event receiver is gone.
fn poll_all(
    source: &dyn TaskStatusSource,
    state: &Mutex<SidecarState>,
    tx_events: &Sender<TaskEvent>,
) -> bool {
    let tasks: Vec<GenerationTask> = state
        .lock()
        .tracked
        .values()
        .map(|tracked| tracked.task.clone())
        .collect();

    for task in tasks {
        let status = match source.poll(&task) {
            Ok(status) => status,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "task poll failed; retrying");
                continue;
            }
        };
        let changed = {
            let mut st = state.lock();
            let Some(tracked) = st.tracked.get_mut(&task.id) else {
                continue;
            };
            let changed = tracked.last.as_ref() != Some(&status);
            tracked.last = Some(status.clone());
            if status.is_terminal() {
                st.tracked.remove(&task.id);
                st.finished.insert(task.id.clone());
            }
            changed
        };
        if changed {
            debug!(task_id = %task.id, status = ?status, "task status changed");
            if tx_events.send(TaskEvent { task, status }).is_err() {
                return false;
            }
        }
    }
    true
}

impl TaskSidecarHandle {
    pub fn track(&self, task: GenerationTask) -> Result<(), TaskError> {
        self.tx_track.send(task).map_err(|_| TaskError::Stopped)
    }

    pub fn cancel(&self, task_id: &TaskId) -> Result<(), TaskError> {
        self.tx_cancel
            .send(task_id.clone())
            .map_err(|_| TaskError::Stopped)
    }

    pub fn tracked_count(&self) -> usize {
        self.state.lock().tracked.len()
    }

    pub fn is_finished(&self, task_id: &TaskId) -> bool {
        self.state.lock().finished.contains(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use story_workflow::TaskKind;

    /// Replays a scripted status sequence per task; the last entry repeats.
    #[derive(Default)]
    struct Scripted {
        script: Mutex<HashMap<TaskId, VecDeque<TaskPoll>>>,
    }

    impl Scripted {
        fn with(task_id: &str, polls: Vec<TaskPoll>) -> Arc<Self> {
            let source = Self::default();
            source
                .script
                .lock()
                .insert(TaskId::from(task_id), polls.into_iter().collect());
            Arc::new(source)
        }
    }

    impl TaskStatusSource for Scripted {
        fn poll(&self, task: &GenerationTask) -> Result<TaskPoll, TaskError> {
            let mut script = self.script.lock();
            let queue = script
                .get_mut(&task.id)
                .ok_or_else(|| TaskError::Source(task.id.clone(), "unknown task".into()))?;
            if queue.len() > 1 {
                Ok(queue.pop_front().unwrap_or(TaskPoll::Pending))
            } else {
                Ok(queue.front().cloned().unwrap_or(TaskPoll::Pending))
            }
        }
    }

    fn output() -> TaskOutput {
        TaskOutput {
            url: "https://example.com/out.png".into(),
            image_url: None,
        }
    }

    fn recv(handle: &TaskSidecarHandle) -> TaskEvent {
        handle
            .events
            .recv_timeout(Duration::from_secs(2))
            .expect("event")
    }

    #[test]
    fn emits_each_status_change_once() {
        let source = Scripted::with(
            "t1",
            vec![
                TaskPoll::Pending,
                TaskPoll::Started,
                TaskPoll::Started,
                TaskPoll::Succeeded(output()),
            ],
        );
        let handle = TaskSidecar::start(source, Duration::from_millis(5));
        handle
            .track(GenerationTask::new(TaskId::from("t1"), TaskKind::Character))
            .unwrap();

        assert_eq!(recv(&handle).status, TaskPoll::Pending);
        assert_eq!(recv(&handle).status, TaskPoll::Started);
        assert_eq!(recv(&handle).status, TaskPoll::Succeeded(output()));
        assert!(handle
            .events
            .recv_timeout(Duration::from_millis(50))
            .is_err());
        assert!(handle.is_finished(&TaskId::from("t1")));
        assert_eq!(handle.tracked_count(), 0);
    }

    #[test]
    fn finished_tasks_are_not_tracked_again() {
        let source = Scripted::with("t1", vec![TaskPoll::Succeeded(output())]);
        let handle = TaskSidecar::start(source, Duration::from_millis(5));
        let task = GenerationTask::new(TaskId::from("t1"), TaskKind::BeatImage);
        handle.track(task.clone()).unwrap();
        assert!(matches!(recv(&handle).status, TaskPoll::Succeeded(_)));

        handle.track(task).unwrap();
        assert!(handle
            .events
            .recv_timeout(Duration::from_millis(50))
            .is_err());
    }

    #[test]
    fn cancel_emits_revoked() {
        let source = Scripted::with("t1", vec![TaskPoll::Started]);
        let handle = TaskSidecar::start(source, Duration::from_millis(5));
        handle
            .track(GenerationTask::new(TaskId::from("t1"), TaskKind::Segment))
            .unwrap();
        assert_eq!(recv(&handle).status, TaskPoll::Started);
        handle.cancel(&TaskId::from("t1")).unwrap();
        assert_eq!(recv(&handle).status, TaskPoll::Revoked);
        assert!(handle.is_finished(&TaskId::from("t1")));
    }

    #[test]
    fn poll_errors_are_retried() {
        let source = Arc::new(Scripted::default());
        let handle = TaskSidecar::start(source.clone(), Duration::from_millis(5));
        handle
            .track(GenerationTask::new(TaskId::from("late"), TaskKind::ComfyuiImage))
            .unwrap();
        assert!(handle
            .events
            .recv_timeout(Duration::from_millis(30))
            .is_err());
        source
            .script
            .lock()
            .insert(TaskId::from("late"), VecDeque::from(vec![TaskPoll::Failed("oom".into())]));
        assert_eq!(recv(&handle).status, TaskPoll::Failed("oom".into()));
    }
}
