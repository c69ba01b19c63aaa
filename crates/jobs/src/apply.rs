use story_workflow::{AssetId, BeatId, CharacterId, StoryEditor, TaskKind, TaskStatus, WorkflowError};
use tracing::{debug, warn};

use crate::{TaskError, TaskEvent, TaskPoll};

/// Feeds one sidecar event into the editor. Unknown tasks are registered
/// first. A success goes through the matching result handler and yields the
/// new asset; a result for a task that was already applied yields `None`.
pub fn apply_task_event(
    editor: &mut StoryEditor,
    event: &TaskEvent,
) -> Result<Option<AssetId>, TaskError> {
    let task_id = &event.task.id;
    if editor.data().task(task_id).is_none() {
        editor.add_generation_task(event.task.clone());
    }

    let output = match &event.status {
        TaskPoll::Pending => return set_status(editor, event, TaskStatus::Pending, None),
        TaskPoll::Started => return set_status(editor, event, TaskStatus::Started, None),
        TaskPoll::Revoked => return set_status(editor, event, TaskStatus::Revoked, None),
        TaskPoll::Failed(message) => {
            warn!(task_id = %task_id, error = %message, "generation task failed");
            return set_status(editor, event, TaskStatus::Failure, Some(message.clone()));
        }
        TaskPoll::Succeeded(output) => output,
    };

    let task = &event.task;
    let beat_ref = || {
        task.ref_id("beatId")
            .map(BeatId::from)
            .ok_or(WorkflowError::MissingRef("beatId"))
    };
    let applied = match task.kind {
        TaskKind::Character => {
            let character_id = task
                .ref_id("characterId")
                .map(CharacterId::from)
                .ok_or(WorkflowError::MissingRef("characterId"))?;
            editor.apply_character_task_result(task_id, &character_id, &output.url)
        }
        TaskKind::BeatImage => editor.apply_beat_image_task_result(task_id, &beat_ref()?, &output.url),
        TaskKind::Segment | TaskKind::Clip => editor.apply_segment_task_result(
            task_id,
            &beat_ref()?,
            &output.url,
            output.image_url.as_deref(),
        ),
        TaskKind::ComfyuiImage | TaskKind::ComfyuiVideo => {
            editor.apply_comfyui_task_result(task_id, &output.url, None, None)
        }
    };

    match applied {
        Ok(asset_id) => Ok(Some(asset_id)),
        Err(WorkflowError::TaskAlreadyApplied(_)) => {
            debug!(task_id = %task_id, "task result already applied");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn set_status(
    editor: &mut StoryEditor,
    event: &TaskEvent,
    status: TaskStatus,
    error: Option<String>,
) -> Result<Option<AssetId>, TaskError> {
    let current = editor.data().task(&event.task.id).map(|task| task.status);
    // a late status never reopens a task whose result landed
    if current == Some(TaskStatus::Success) {
        return Ok(None);
    }
    editor.update_generation_task_status(&event.task.id, status, error)?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskOutput;
    use story_workflow::storyboard::StoryboardScene;
    use story_workflow::{EditorOptions, GenerationTask, TaskId};

    fn editor() -> StoryEditor {
        let mut editor = StoryEditor::new("main", EditorOptions::default());
        editor.initialize_from_storyboard(
            &[StoryboardScene {
                scene_number: Some(1),
                narration: Some("opening".into()),
                visual_description: None,
            }],
            6.0,
        );
        editor
    }

    fn success(task: GenerationTask, url: &str) -> TaskEvent {
        TaskEvent {
            task,
            status: TaskPoll::Succeeded(TaskOutput {
                url: url.into(),
                image_url: None,
            }),
        }
    }

    #[test]
    fn segment_success_lands_once() {
        let mut editor = editor();
        let beat_id = editor.workflow().unwrap().nodes[0].beat_ids[0].clone();
        let task = GenerationTask::new(TaskId::from("t1"), TaskKind::Segment)
            .with_ref("beatId", beat_id.as_str());
        let event = success(task, "https://example.com/v.mp4");

        let asset = apply_task_event(&mut editor, &event).unwrap();
        assert!(asset.is_some());
        assert_eq!(apply_task_event(&mut editor, &event).unwrap(), None);
        assert_eq!(editor.data().timeline_items.len(), 1);
        assert_eq!(
            editor.data().task(&TaskId::from("t1")).unwrap().status,
            TaskStatus::Success
        );
    }

    #[test]
    fn failures_are_recorded_on_the_task() {
        let mut editor = editor();
        let task = GenerationTask::new(TaskId::from("t1"), TaskKind::BeatImage);
        let event = TaskEvent {
            task,
            status: TaskPoll::Failed("timeout".into()),
        };
        assert_eq!(apply_task_event(&mut editor, &event).unwrap(), None);
        let stored = editor.data().task(&TaskId::from("t1")).unwrap();
        assert_eq!(stored.status, TaskStatus::Failure);
        assert_eq!(stored.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn missing_refs_are_errors() {
        let mut editor = editor();
        let event = success(
            GenerationTask::new(TaskId::from("t1"), TaskKind::Character),
            "https://example.com/c.png",
        );
        assert!(matches!(
            apply_task_event(&mut editor, &event),
            Err(TaskError::Workflow(WorkflowError::MissingRef("characterId")))
        ));
    }
}
