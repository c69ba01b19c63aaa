use jobs::{apply_task_event, TaskError, TaskOutput, TaskPoll, TaskSidecar, TaskStatusSource};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use story_workflow::storyboard::StoryboardScene;
use story_workflow::{
    Character, CharacterId, EditorOptions, GenerationTask, StepStatus, StoryEditor, TaskId,
    TaskKind, TaskStatus,
};

/// Reports whatever the test last set for a task.
#[derive(Default)]
struct Board {
    statuses: Mutex<HashMap<TaskId, TaskPoll>>,
}

impl Board {
    fn set(&self, task_id: &str, poll: TaskPoll) {
        self.statuses.lock().insert(TaskId::from(task_id), poll);
    }
}

impl TaskStatusSource for Board {
    fn poll(&self, task: &GenerationTask) -> Result<TaskPoll, TaskError> {
        Ok(self
            .statuses
            .lock()
            .get(&task.id)
            .cloned()
            .unwrap_or(TaskPoll::Pending))
    }
}

fn editor_with_character() -> StoryEditor {
    let mut data = story_workflow::storyboard::editor_data_from_storyboard(
        &[
            StoryboardScene {
                scene_number: Some(1),
                narration: Some("arrival".into()),
                visual_description: None,
            },
            StoryboardScene {
                scene_number: Some(1),
                narration: Some("departure".into()),
                visual_description: None,
            },
        ],
        10.0,
    );
    let hero = CharacterId::from("hero");
    data.characters
        .insert(hero.clone(), Character::new(hero.clone(), "Hero"));
    for beat in data.beats.values_mut() {
        beat.character_ids = vec![hero.clone()];
    }
    StoryEditor::from_data(data, Default::default(), "main", EditorOptions::default())
}

#[test]
fn character_render_flows_from_sidecar_into_every_node() {
    let board = Arc::new(Board::default());
    let handle = TaskSidecar::start(board.clone(), Duration::from_millis(5));
    let mut editor = editor_with_character();

    let task = GenerationTask::new(TaskId::from("render-1"), TaskKind::Character)
        .with_ref("characterId", "hero");
    editor.add_generation_task(task.clone());
    handle.track(task).unwrap();

    let first = handle.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.status, TaskPoll::Pending);
    apply_task_event(&mut editor, &first).unwrap();

    board.set(
        "render-1",
        TaskPoll::Succeeded(TaskOutput {
            url: "https://example.com/hero.png".into(),
            image_url: None,
        }),
    );
    let done = handle.events.recv_timeout(Duration::from_secs(2)).unwrap();
    let asset_id = apply_task_event(&mut editor, &done).unwrap().unwrap();

    let workflow = editor.workflow().unwrap();
    for node in &workflow.nodes {
        assert_eq!(
            node.step3.character_asset_map.get(&CharacterId::from("hero")),
            Some(&Some(asset_id.clone()))
        );
        assert_eq!(node.step3.status, StepStatus::Done);
    }
    assert_eq!(
        editor.data().task(&TaskId::from("render-1")).unwrap().status,
        TaskStatus::Success
    );

    // a late duplicate delivery changes nothing
    let assets = editor.data().assets.len();
    assert_eq!(apply_task_event(&mut editor, &done).unwrap(), None);
    assert_eq!(editor.data().assets.len(), assets);
}

#[test]
fn dropped_handle_stops_the_worker() {
    let board = Arc::new(Board::default());
    let handle = TaskSidecar::start(board, Duration::from_millis(5));
    let events = handle.events.clone();
    drop(handle);
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}
