//! Entities the story workflow references but does not own: scenes, beats,
//! characters, assets and the timeline pieces that carry rendered video.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::ids::{
    AssetId, BeatId, CharacterId, ClipId, NodeId, SceneId, ShotId, TaskId, TimelineItemId,
};
use crate::workflow::StoryWorkflow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Generating,
    #[default]
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Character {
    pub fn new(id: CharacterId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Shot {
    pub id: ShotId,
    pub beat_id: BeatId,
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_description: Option<String>,
    #[serde(default)]
    pub suggested_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Beat {
    pub id: BeatId,
    pub scene_id: SceneId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_description: Option<String>,
    #[serde(default)]
    pub suggested_duration: f64,
    #[serde(default)]
    pub character_ids: Vec<CharacterId>,
    #[serde(default)]
    pub status: GenerationStatus,
    #[serde(default)]
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shots: Option<Vec<Shot>>,
}

impl Beat {
    pub fn new(id: BeatId, scene_id: SceneId, order: u32) -> Self {
        Self {
            id,
            scene_id,
            narration: None,
            dialogue: None,
            camera_description: None,
            suggested_duration: 0.0,
            character_ids: Vec::new(),
            status: GenerationStatus::Success,
            order,
            shots: None,
        }
    }

    pub fn narration_text(&self) -> &str {
        self.narration.as_deref().unwrap_or("")
    }

    pub fn camera_text(&self) -> &str {
        self.camera_description.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: SceneId,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub beat_ids: Vec<BeatId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Image,
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetSource {
    Upload,
    #[default]
    Generated,
    Library,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: AssetId,
    #[serde(rename = "type")]
    pub kind: AssetType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub source: AssetSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_beat_id: Option<BeatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_character_id: Option<CharacterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_params: Option<Value>,
    #[serde(default)]
    pub created_at: String,
}

impl Asset {
    pub fn new(kind: AssetType, url: impl Into<String>, source: AssetSource) -> Self {
        Self {
            id: AssetId::new(),
            kind,
            url: url.into(),
            width: None,
            height: None,
            duration: None,
            source,
            related_beat_id: None,
            related_character_id: None,
            generation_params: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// An asset of the given type with a non-empty url.
    pub fn is_usable(&self, kind: AssetType) -> bool {
        self.kind == kind && !self.url.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: ClipId,
    pub asset_id: AssetId,
    #[serde(default)]
    pub start_offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub id: TimelineItemId,
    pub clip_id: ClipId,
    pub track_id: String,
    pub start_time: f64,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_beat_id: Option<BeatId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Clip,
    Character,
    BeatImage,
    Segment,
    ComfyuiImage,
    ComfyuiVideo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
    Revoked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub ref_ids: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl GenerationTask {
    pub fn new(id: TaskId, kind: TaskKind) -> Self {
        Self {
            id,
            kind,
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now().to_rfc3339(),
            input: Value::Null,
            ref_ids: HashMap::new(),
            error: None,
            result: None,
        }
    }

    pub fn with_ref(mut self, key: &str, value: impl Into<String>) -> Self {
        self.ref_ids.insert(key.to_string(), value.into());
        self
    }

    pub fn ref_id(&self, key: &str) -> Option<&str> {
        self.ref_ids
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

/// What the user has in focus. The story node and beat selections move together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    #[serde(default)]
    pub selected_beat_id: Option<BeatId>,
    #[serde(default)]
    pub selected_timeline_item_id: Option<TimelineItemId>,
    #[serde(default)]
    pub selected_character_id: Option<CharacterId>,
    #[serde(default)]
    pub selected_asset_id: Option<AssetId>,
    #[serde(default)]
    pub selected_story_node_id: Option<NodeId>,
}

/// The per-branch editing state. The story workflow is derived from the
/// scene/beat graph held here and is rebuilt against it on every load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EditorData {
    #[serde(default)]
    pub scenes: BTreeMap<SceneId, Scene>,
    #[serde(default)]
    pub beats: BTreeMap<BeatId, Beat>,
    #[serde(default)]
    pub characters: BTreeMap<CharacterId, Character>,
    #[serde(default)]
    pub assets: BTreeMap<AssetId, Asset>,
    #[serde(default)]
    pub clips: BTreeMap<ClipId, Clip>,
    #[serde(default)]
    pub timeline_items: BTreeMap<TimelineItemId, TimelineItem>,
    #[serde(default)]
    pub scene_order: Vec<SceneId>,
    #[serde(default)]
    pub generation_tasks: Vec<GenerationTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_workflow: Option<StoryWorkflow>,
}

impl EditorData {
    /// Beats in story order: scene order first, then each scene's beat list.
    pub fn ordered_beats(&self) -> impl Iterator<Item = (&Scene, &Beat)> + '_ {
        self.scene_order
            .iter()
            .filter_map(|scene_id| self.scenes.get(scene_id))
            .flat_map(move |scene| {
                scene
                    .beat_ids
                    .iter()
                    .filter_map(move |beat_id| self.beats.get(beat_id).map(|beat| (scene, beat)))
            })
    }

    pub fn first_beat_asset_of_type(&self, beat_id: &BeatId, kind: AssetType) -> Option<&Asset> {
        self.assets
            .values()
            .find(|asset| asset.kind == kind && asset.related_beat_id.as_ref() == Some(beat_id))
    }

    /// Video asset behind the timeline clip linked to a beat.
    pub fn beat_video_asset(&self, beat_id: &BeatId) -> Option<&Asset> {
        let item = self
            .timeline_items
            .values()
            .find(|item| item.linked_beat_id.as_ref() == Some(beat_id))?;
        let clip = self.clips.get(&item.clip_id)?;
        self.assets
            .get(&clip.asset_id)
            .filter(|asset| asset.kind == AssetType::Video)
    }

    pub fn character_reference_asset(&self, character_id: &CharacterId) -> Option<&Asset> {
        self.assets.values().find(|asset| {
            asset.kind == AssetType::Image
                && asset.related_character_id.as_ref() == Some(character_id)
        })
    }

    pub fn character_name(&self, character_id: &CharacterId) -> String {
        self.characters
            .get(character_id)
            .map(|character| character.name.clone())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| character_id.to_string())
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&GenerationTask> {
        self.generation_tasks.iter().find(|task| &task.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut GenerationTask> {
        self.generation_tasks
            .iter_mut()
            .find(|task| &task.id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_with_clip() -> EditorData {
        let mut data = EditorData::default();
        let scene_id = SceneId::from("s1");
        let mut beat = Beat::new(BeatId::from("b1"), scene_id.clone(), 0);
        beat.narration = Some("n1".into());
        data.beats.insert(beat.id.clone(), beat);
        data.scenes.insert(
            scene_id.clone(),
            Scene {
                id: scene_id.clone(),
                title: "Scene 1".into(),
                summary: String::new(),
                order: 0,
                beat_ids: vec![BeatId::from("b1"), BeatId::from("missing")],
            },
        );
        data.scene_order.push(scene_id);

        let mut video = Asset::new(AssetType::Video, "https://example.com/v.mp4", AssetSource::Generated);
        video.id = AssetId::from("v1");
        data.assets.insert(video.id.clone(), video);
        data.clips.insert(
            ClipId::from("c1"),
            Clip {
                id: ClipId::from("c1"),
                asset_id: AssetId::from("v1"),
                start_offset: 0.0,
                end_offset: None,
            },
        );
        data.timeline_items.insert(
            TimelineItemId::from("t1"),
            TimelineItem {
                id: TimelineItemId::from("t1"),
                clip_id: ClipId::from("c1"),
                track_id: "0".into(),
                start_time: 0.0,
                duration: 3.0,
                linked_beat_id: Some(BeatId::from("b1")),
            },
        );
        data
    }

    #[test]
    fn ordered_beats_skips_dangling_references() {
        let data = data_with_clip();
        let beats: Vec<_> = data.ordered_beats().map(|(_, beat)| beat.id.clone()).collect();
        assert_eq!(beats, vec![BeatId::from("b1")]);
    }

    #[test]
    fn beat_video_follows_timeline_clip() {
        let data = data_with_clip();
        let asset = data.beat_video_asset(&BeatId::from("b1")).unwrap();
        assert_eq!(asset.id, AssetId::from("v1"));
        assert!(data.beat_video_asset(&BeatId::from("b2")).is_none());
    }

    #[test]
    fn character_name_falls_back_to_id() {
        let mut data = EditorData::default();
        data.characters.insert(
            CharacterId::from("c1"),
            Character::new(CharacterId::from("c1"), "Role A"),
        );
        assert_eq!(data.character_name(&CharacterId::from("c1")), "Role A");
        assert_eq!(data.character_name(&CharacterId::from("c2")), "c2");
    }

    #[test]
    fn editor_data_uses_camel_case_keys() {
        let data = data_with_clip();
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("sceneOrder").is_some());
        assert!(json.get("timelineItems").is_some());
        assert_eq!(json["assets"]["v1"]["type"], "video");
    }
}
