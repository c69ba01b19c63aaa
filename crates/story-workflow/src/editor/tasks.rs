//! Applies finished generation tasks. Each handler validates everything up
//! front, then records one undo step and writes, so a result lands whole or
//! not at all. A task is applied at most once.

use serde_json::json;
use tracing::{debug, info};

use super::gates::map_character;
use super::StoryEditor;
use crate::ids::{AssetId, BeatId, CharacterId, ClipId, NodeId, TaskId, TimelineItemId};
use crate::model::{Asset, AssetSource, AssetType, Clip, TaskKind, TaskStatus, TimelineItem};
use crate::readiness::required_character_ids;
use crate::WorkflowError;

const DEFAULT_TRACK: &str = "0";

impl StoryEditor {
    /// The task must be registered, of a kind the handler accepts, and not yet applied.
    fn check_task(&self, task_id: &TaskId, accepted: &[TaskKind]) -> Result<TaskKind, WorkflowError> {
        let task = self
            .data
            .task(task_id)
            .ok_or_else(|| WorkflowError::TaskNotFound(task_id.clone()))?;
        if !accepted.contains(&task.kind) {
            return Err(WorkflowError::UnexpectedTaskKind(task_id.clone(), task.kind));
        }
        if task.status == TaskStatus::Success && task.result.is_some() {
            return Err(WorkflowError::TaskAlreadyApplied(task_id.clone()));
        }
        Ok(task.kind)
    }

    fn finish_task(&mut self, task_id: &TaskId, result: serde_json::Value) {
        if let Some(task) = self.data.task_mut(task_id) {
            task.status = TaskStatus::Success;
            task.error = None;
            task.result = Some(result);
        }
    }

    fn insert_asset(&mut self, asset: Asset) -> AssetId {
        let asset_id = asset.id.clone();
        self.data.assets.insert(asset_id.clone(), asset);
        asset_id
    }

    /// A character reference image: recorded as an asset, set as the avatar,
    /// pushed into linked seeds and mapped into every unlocked node that needs
    /// the character (plus `target_node`, if given and unlocked).
    pub fn apply_character_task_result(
        &mut self,
        task_id: &TaskId,
        character_id: &CharacterId,
        image_url: &str,
    ) -> Result<AssetId, WorkflowError> {
        self.check_task(task_id, &[TaskKind::Character])?;
        self.apply_character_image(task_id, character_id, image_url, None)
    }

    fn apply_character_image(
        &mut self,
        task_id: &TaskId,
        character_id: &CharacterId,
        image_url: &str,
        target_node: Option<&NodeId>,
    ) -> Result<AssetId, WorkflowError> {
        if !self.data.characters.contains_key(character_id) {
            return Err(WorkflowError::CharacterNotFound(character_id.clone()));
        }
        self.checkpoint();

        let mut asset = Asset::new(AssetType::Image, image_url, AssetSource::Generated);
        asset.related_character_id = Some(character_id.clone());
        let asset_id = self.insert_asset(asset);
        if let Some(character) = self.data.characters.get_mut(character_id) {
            character.avatar_url = Some(image_url.to_string());
        }

        let required: Vec<Vec<CharacterId>> = match self.data.story_workflow.as_ref() {
            Some(workflow) => workflow
                .nodes
                .iter()
                .map(|node| required_character_ids(node, &self.data))
                .collect(),
            None => Vec::new(),
        };
        let mut mapped = 0usize;
        if let Some(workflow) = self.data.story_workflow.as_mut() {
            for seed in workflow
                .global
                .character_seeds
                .iter_mut()
                .filter(|seed| seed.linked_character_id.as_ref() == Some(character_id))
            {
                seed.reference_image_url = Some(image_url.to_string());
                seed.reference_asset_id = Some(asset_id.clone());
            }
            for (node, required) in workflow.nodes.iter_mut().zip(required.iter()) {
                let targeted = target_node == Some(&node.id);
                if node.locked || !(targeted || required.contains(character_id)) {
                    continue;
                }
                map_character(node, character_id, &asset_id, required);
                mapped += 1;
            }
        }

        self.finish_task(
            task_id,
            json!({ "assetId": asset_id, "url": image_url, "characterId": character_id }),
        );
        info!(task_id = %task_id, character_id = %character_id, nodes = mapped, "character image applied");
        Ok(asset_id)
    }

    /// A beat still. Becomes the node's background when none is bound yet.
    pub fn apply_beat_image_task_result(
        &mut self,
        task_id: &TaskId,
        beat_id: &BeatId,
        image_url: &str,
    ) -> Result<AssetId, WorkflowError> {
        self.check_task(task_id, &[TaskKind::BeatImage])?;
        self.apply_beat_image(task_id, beat_id, image_url)
    }

    fn apply_beat_image(
        &mut self,
        task_id: &TaskId,
        beat_id: &BeatId,
        image_url: &str,
    ) -> Result<AssetId, WorkflowError> {
        if !self.data.beats.contains_key(beat_id) {
            return Err(WorkflowError::BeatNotFound(beat_id.clone()));
        }
        self.checkpoint();

        let mut asset = Asset::new(AssetType::Image, image_url, AssetSource::Generated);
        asset.related_beat_id = Some(beat_id.clone());
        let asset_id = self.insert_asset(asset);

        if let Some(node) = self
            .data
            .story_workflow
            .as_mut()
            .and_then(|workflow| workflow.node_for_beat_mut(beat_id))
            .filter(|node| !node.locked)
        {
            let bindings = &mut node.step4.asset_bindings;
            if bindings.background_asset_id.is_none() {
                bindings.background_asset_id = Some(asset_id.clone());
                debug!(node_id = %node.id, "beat image bound as background");
            }
        }

        self.finish_task(task_id, json!({ "assetId": asset_id, "url": image_url, "beatId": beat_id }));
        info!(task_id = %task_id, beat_id = %beat_id, "beat image applied");
        Ok(asset_id)
    }

    /// A rendered segment. Replaces the beat's timeline clip in place and
    /// points the node's step4 at the new video. Never marks step4 done.
    /// For a beat in the locked prefix only the assets are recorded.
    pub fn apply_segment_task_result(
        &mut self,
        task_id: &TaskId,
        beat_id: &BeatId,
        video_url: &str,
        image_url: Option<&str>,
    ) -> Result<AssetId, WorkflowError> {
        self.check_task(task_id, &[TaskKind::Segment, TaskKind::Clip])?;
        self.apply_segment(task_id, beat_id, video_url, image_url)
    }

    fn apply_segment(
        &mut self,
        task_id: &TaskId,
        beat_id: &BeatId,
        video_url: &str,
        image_url: Option<&str>,
    ) -> Result<AssetId, WorkflowError> {
        let duration = self
            .data
            .beats
            .get(beat_id)
            .map(|beat| beat.suggested_duration)
            .ok_or_else(|| WorkflowError::BeatNotFound(beat_id.clone()))?;
        self.checkpoint();

        let mut video = Asset::new(AssetType::Video, video_url, AssetSource::Generated);
        video.related_beat_id = Some(beat_id.clone());
        video.duration = Some(duration);
        let video_id = self.insert_asset(video);

        let still_id = image_url
            .filter(|url| !url.trim().is_empty())
            .map(|url| {
                let mut still = Asset::new(AssetType::Image, url, AssetSource::Generated);
                still.related_beat_id = Some(beat_id.clone());
                self.insert_asset(still)
            });

        let locked = self
            .data
            .story_workflow
            .as_ref()
            .and_then(|workflow| workflow.node_for_beat(beat_id))
            .is_some_and(|node| node.locked);
        if locked {
            debug!(beat_id = %beat_id, "beat is locked, timeline left as is");
        } else {
            let clip = Clip {
                id: ClipId::new(),
                asset_id: video_id.clone(),
                start_offset: 0.0,
                end_offset: Some(duration),
            };
            let clip_id = clip.id.clone();
            self.data.clips.insert(clip_id.clone(), clip);
            self.place_on_timeline(beat_id, clip_id, duration);
        }

        if let Some(node) = self
            .data
            .story_workflow
            .as_mut()
            .and_then(|workflow| workflow.node_for_beat_mut(beat_id))
            .filter(|node| !node.locked)
        {
            node.step4.video_asset_id = Some(video_id.clone());
            node.step4.video_task_id = Some(task_id.to_string());
            node.step4.status = node.step4.status.promoted();
            if node.step4.asset_bindings.background_asset_id.is_none() {
                node.step4.asset_bindings.background_asset_id = still_id.clone();
            }
        }
        self.sync_selection_from_workflow();

        self.finish_task(
            task_id,
            json!({ "assetId": video_id, "url": video_url, "beatId": beat_id, "imageAssetId": still_id }),
        );
        info!(task_id = %task_id, beat_id = %beat_id, "segment applied");
        Ok(video_id)
    }

    /// Reuses the timeline item linked to the beat, else appends a new one at
    /// the end of the default track.
    fn place_on_timeline(&mut self, beat_id: &BeatId, clip_id: ClipId, duration: f64) {
        let existing = self
            .data
            .timeline_items
            .values_mut()
            .find(|item| item.linked_beat_id.as_ref() == Some(beat_id));
        if let Some(item) = existing {
            let replaced = std::mem::replace(&mut item.clip_id, clip_id);
            item.duration = duration;
            self.data.clips.remove(&replaced);
            return;
        }
        let start_time = self
            .data
            .timeline_items
            .values()
            .filter(|item| item.track_id == DEFAULT_TRACK)
            .map(|item| item.start_time + item.duration)
            .fold(0.0, f64::max);
        let item = TimelineItem {
            id: TimelineItemId::new(),
            clip_id,
            track_id: DEFAULT_TRACK.to_string(),
            start_time,
            duration,
            linked_beat_id: Some(beat_id.clone()),
        };
        self.data.timeline_items.insert(item.id.clone(), item);
    }

    /// Output of a ComfyUI workflow. Missing references are resolved from the
    /// task's registered `refIds`; a character reference wins over a beat.
    pub fn apply_comfyui_task_result(
        &mut self,
        task_id: &TaskId,
        output_url: &str,
        beat_id: Option<BeatId>,
        character_id: Option<CharacterId>,
    ) -> Result<AssetId, WorkflowError> {
        let kind = self.check_task(task_id, &[TaskKind::ComfyuiImage, TaskKind::ComfyuiVideo])?;
        let task = self
            .data
            .task(task_id)
            .ok_or_else(|| WorkflowError::TaskNotFound(task_id.clone()))?;
        let beat_id = beat_id.or_else(|| task.ref_id("beatId").map(BeatId::from));
        let character_id = character_id.or_else(|| task.ref_id("characterId").map(CharacterId::from));
        let node_id = task.ref_id("nodeId").map(NodeId::from);

        match kind {
            TaskKind::ComfyuiImage => match (character_id, beat_id) {
                (Some(character_id), _) => {
                    let asset_id =
                        self.apply_character_image(task_id, &character_id, output_url, node_id.as_ref())?;
                    self.selection.selected_character_id = Some(character_id);
                    Ok(asset_id)
                }
                (None, Some(beat_id)) => self.apply_beat_image(task_id, &beat_id, output_url),
                (None, None) => Err(WorkflowError::MissingRef("characterId or beatId")),
            },
            _ => {
                let beat_id = beat_id.ok_or(WorkflowError::MissingRef("beatId"))?;
                self.apply_segment(task_id, &beat_id, output_url, None)
            }
        }
    }
}
