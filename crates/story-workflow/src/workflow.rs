use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{AssetId, BeatId, CharacterId, NodeId, SceneId};

pub const WORKFLOW_VERSION: u32 = 1;
pub const DEFAULT_MAIN_BRANCH: &str = "main";

/// Character id to mapped reference asset. `None` is an explicit "known unmapped".
pub type CharacterAssetMap = BTreeMap<CharacterId, Option<AssetId>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepKey {
    #[default]
    Step1,
    Step2,
    Step3,
    Step4,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    /// Accepted from persisted documents; never produced here.
    Blocked,
}

impl StepStatus {
    pub fn is_done(self) -> bool {
        self == Self::Done
    }

    /// Status after an accepted edit: untouched steps become in-progress, nothing else moves.
    pub fn promoted(self) -> Self {
        match self {
            Self::Todo => Self::InProgress,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Auto,
    Ollama,
    Vllm,
    Sglang,
    OpenaiCompatible,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedProvider {
    Auto,
    Ollama,
    Vllm,
    Sglang,
    OpenaiCompatible,
    Cloud,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryMode {
    #[default]
    Generate,
    Create,
    Edit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStyle {
    Record,
    Science,
    #[default]
    Series,
    ShortDrama,
    Animation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryTone {
    Humorous,
    #[default]
    Serious,
    Warm,
    Cold,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptMode {
    #[default]
    StrictScreenplay,
    StagePlay,
    DanceDrama,
    Narrative,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentLength {
    Long,
    #[default]
    Medium,
    Short,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MappingProvider {
    #[default]
    Comfyui,
    Placeholder,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderProvider {
    #[default]
    Segment,
    Comfyui,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetsImageFilter {
    #[default]
    All,
    Node,
    Character,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FocusTarget {
    Step3Mapping,
    Step4ImageBinding,
    Step4VideoConfirm,
    Step4Params,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CharacterSeed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub fate_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_asset_id: Option<AssetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_character_id: Option<CharacterId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OutlineStep {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub script_mode: ScriptMode,
    #[serde(default)]
    pub segment_length: SegmentLength,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub character_changes: String,
    #[serde(default)]
    pub encounters: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MappingStep {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub provider: MappingProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comfyui_template_id: Option<String>,
    #[serde(default)]
    pub style_prompt: String,
    #[serde(default)]
    pub character_asset_map: CharacterAssetMap,
}

/// Whether a map entry carries a usable asset id.
pub fn is_mapped(value: Option<&Option<AssetId>>) -> bool {
    value.is_some_and(|asset| asset.as_ref().is_some_and(|id| !id.as_str().trim().is_empty()))
}

impl MappingStep {
    /// Some characters are required and each of them is mapped. Entries for
    /// characters outside `required` do not count either way.
    pub fn covers(&self, required: &[CharacterId]) -> bool {
        !required.is_empty()
            && required
                .iter()
                .all(|character_id| is_mapped(self.character_asset_map.get(character_id)))
    }

    /// The only step3 status rule: done exactly when [`Self::covers`] holds.
    /// A done status that no longer holds drops back to in progress.
    pub fn derived_status(&self, required: &[CharacterId]) -> StepStatus {
        if self.covers(required) {
            StepStatus::Done
        } else if self.status.is_done() {
            StepStatus::InProgress
        } else {
            self.status
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssetBindings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_asset_id: Option<AssetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_image_asset_id: Option<AssetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_image_asset_id: Option<AssetId>,
    #[serde(default)]
    pub character_asset_ids: CharacterAssetMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderStep {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub provider: RenderProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comfyui_template_id: Option<String>,
    #[serde(default = "default_params_json")]
    pub comfyui_params_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_asset_id: Option<AssetId>,
    #[serde(default)]
    pub asset_bindings: AssetBindings,
}

fn default_params_json() -> String {
    "{}".to_string()
}

impl Default for RenderStep {
    fn default() -> Self {
        Self {
            status: StepStatus::Todo,
            confirmed: false,
            provider: RenderProvider::Segment,
            comfyui_template_id: None,
            comfyui_params_json: default_params_json(),
            video_task_id: None,
            video_asset_id: None,
            asset_bindings: AssetBindings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoryNode {
    pub id: NodeId,
    pub order: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<SceneId>,
    #[serde(default)]
    pub beat_ids: Vec<BeatId>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub step2: OutlineStep,
    #[serde(default)]
    pub step3: MappingStep,
    #[serde(default)]
    pub step4: RenderStep,
}

impl StoryNode {
    pub fn primary_beat_id(&self) -> Option<&BeatId> {
        self.beat_ids.first()
    }

    /// Whether the node counts toward the published prefix of a fork.
    pub fn is_persisted(&self) -> bool {
        if self.step4.confirmed {
            return true;
        }
        let render_done = self.step4.status.is_done();
        if render_done && self.step4.video_asset_id.is_some() {
            return true;
        }
        render_done && self.step3.status.is_done() && self.step2.status.is_done()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BranchPolicy {
    pub branch_name: String,
    #[serde(default)]
    pub lock_boundary_order: Option<u32>,
    #[serde(default)]
    pub boundary_configured: bool,
}

impl BranchPolicy {
    /// Main branches start unlocked and configured; forks start fully open with
    /// a boundary that is inferred until someone sets it.
    pub fn default_for(branch_name: &str, main_branch: &str) -> Self {
        let is_main = branch_name == main_branch;
        Self {
            branch_name: branch_name.to_string(),
            lock_boundary_order: if is_main { None } else { Some(0) },
            boundary_configured: is_main,
        }
    }

    pub fn locks(&self, order: u32) -> bool {
        self.lock_boundary_order
            .is_some_and(|boundary| order < boundary)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoryGlobal {
    #[serde(default)]
    pub story_mode: StoryMode,
    #[serde(default)]
    pub story_style: StoryStyle,
    #[serde(default)]
    pub tone: StoryTone,
    #[serde(default)]
    pub llm_provider: LlmProvider,
    #[serde(default)]
    pub script_mode: ScriptMode,
    #[serde(default)]
    pub segment_length: SegmentLength,
    #[serde(default)]
    pub character_seeds: Vec<CharacterSeed>,
}

impl Default for StoryGlobal {
    fn default() -> Self {
        Self {
            story_mode: StoryMode::Generate,
            story_style: StoryStyle::Series,
            tone: StoryTone::Serious,
            llm_provider: LlmProvider::Auto,
            script_mode: ScriptMode::StrictScreenplay,
            segment_length: SegmentLength::Medium,
            character_seeds: Vec::new(),
        }
    }
}

/// Provenance of the last outline generation. Informational only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_provider: Option<LlmProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_provider: Option<ResolvedProvider>,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoryUi {
    #[serde(default)]
    pub step4_auto_fill_enabled: bool,
    #[serde(default)]
    pub assets_image_filter: AssetsImageFilter,
    #[serde(default)]
    pub focus_target: Option<FocusTarget>,
    #[serde(default)]
    pub preview_prefer_card: bool,
    #[serde(default)]
    pub event_flow_pulse_node_id: Option<NodeId>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub event_flow_pulse_at: Option<i64>,
}

impl StoryUi {
    pub fn normalized(mut self) -> Self {
        self.event_flow_pulse_node_id = self
            .event_flow_pulse_node_id
            .map(|id| NodeId(id.0.trim().to_string()))
            .filter(|id| !id.0.is_empty());
        self.event_flow_pulse_at = self.event_flow_pulse_at.filter(|at| *at > 0);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoryWorkflow {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub active_step: StepKey,
    #[serde(default)]
    pub selected_node_id: Option<NodeId>,
    #[serde(default)]
    pub nodes: Vec<StoryNode>,
    #[serde(default)]
    pub global: StoryGlobal,
    pub branch_policy: BranchPolicy,
    #[serde(default)]
    pub meta: StoryMeta,
    #[serde(default)]
    pub ui: StoryUi,
}

fn default_version() -> u32 {
    WORKFLOW_VERSION
}

impl StoryWorkflow {
    pub fn empty(branch_name: &str, main_branch: &str) -> Self {
        Self {
            version: WORKFLOW_VERSION,
            active_step: StepKey::Step1,
            selected_node_id: None,
            nodes: Vec::new(),
            global: StoryGlobal::default(),
            branch_policy: BranchPolicy::default_for(branch_name, main_branch),
            meta: StoryMeta {
                requested_provider: Some(LlmProvider::Auto),
                ..StoryMeta::default()
            },
            ui: StoryUi::default(),
        }
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&StoryNode> {
        self.nodes.iter().find(|node| &node.id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &NodeId) -> Option<&mut StoryNode> {
        self.nodes.iter_mut().find(|node| &node.id == node_id)
    }

    pub fn selected_node(&self) -> Option<&StoryNode> {
        self.selected_node_id
            .as_ref()
            .and_then(|node_id| self.node(node_id))
    }

    pub fn node_for_beat(&self, beat_id: &BeatId) -> Option<&StoryNode> {
        self.nodes
            .iter()
            .find(|node| node.beat_ids.contains(beat_id))
    }

    pub fn node_for_beat_mut(&mut self, beat_id: &BeatId) -> Option<&mut StoryNode> {
        self.nodes
            .iter_mut()
            .find(|node| node.beat_ids.contains(beat_id))
    }
}

/// Beat id to owning node. Later nodes win when a beat is listed twice.
pub fn map_story_node_by_beat_id(workflow: &StoryWorkflow) -> BTreeMap<BeatId, &StoryNode> {
    let mut out = BTreeMap::new();
    for node in &workflow.nodes {
        for beat_id in &node.beat_ids {
            out.insert(beat_id.clone(), node);
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step2Patch {
    pub status: Option<StepStatus>,
    pub script_mode: Option<ScriptMode>,
    pub segment_length: Option<SegmentLength>,
    pub summary: Option<String>,
    pub background: Option<String>,
    pub character_changes: Option<String>,
    pub encounters: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step3Patch {
    pub provider: Option<MappingProvider>,
    pub style_prompt: Option<String>,
    pub comfyui_template_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step4Patch {
    pub provider: Option<RenderProvider>,
    pub comfyui_template_id: Option<String>,
    pub comfyui_params_json: Option<String>,
    pub video_task_id: Option<String>,
}

/// Binding edits. The outer `Option` means "leave alone"; `Some(None)` clears.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingPatch {
    pub background_asset_id: Option<Option<AssetId>>,
    pub start_image_asset_id: Option<Option<AssetId>>,
    pub end_image_asset_id: Option<Option<AssetId>>,
    pub character_asset_ids: Option<CharacterAssetMap>,
}

impl Step2Patch {
    pub fn apply(self, step: &mut OutlineStep) {
        let explicit_status = self.status;
        if let Some(value) = self.script_mode {
            step.script_mode = value;
        }
        if let Some(value) = self.segment_length {
            step.segment_length = value;
        }
        if let Some(value) = self.summary {
            step.summary = value;
        }
        if let Some(value) = self.background {
            step.background = value;
        }
        if let Some(value) = self.character_changes {
            step.character_changes = value;
        }
        if let Some(value) = self.encounters {
            step.encounters = value;
        }
        step.status = explicit_status.unwrap_or_else(|| step.status.promoted());
    }
}

impl Step3Patch {
    pub fn apply(self, step: &mut MappingStep) {
        if let Some(value) = self.provider {
            step.provider = value;
        }
        if let Some(value) = self.style_prompt {
            step.style_prompt = value;
        }
        if let Some(value) = self.comfyui_template_id {
            step.comfyui_template_id = Some(value).filter(|id| !id.trim().is_empty());
        }
        step.status = step.status.promoted();
    }
}

impl Step4Patch {
    pub fn apply(self, step: &mut RenderStep) {
        if let Some(value) = self.provider {
            step.provider = value;
        }
        if let Some(value) = self.comfyui_template_id {
            step.comfyui_template_id = Some(value).filter(|id| !id.trim().is_empty());
        }
        if let Some(value) = self.comfyui_params_json {
            step.comfyui_params_json = value;
        }
        if let Some(value) = self.video_task_id {
            step.video_task_id = Some(value).filter(|id| !id.trim().is_empty());
        }
        step.status = step.status.promoted();
    }
}

impl BindingPatch {
    pub fn apply(self, bindings: &mut AssetBindings) {
        if let Some(value) = self.background_asset_id {
            bindings.background_asset_id = value;
        }
        if let Some(value) = self.start_image_asset_id {
            bindings.start_image_asset_id = value;
        }
        if let Some(value) = self.end_image_asset_id {
            bindings.end_image_asset_id = value;
        }
        if let Some(entries) = self.character_asset_ids {
            merge_character_assets(&mut bindings.character_asset_ids, &entries);
        }
    }
}

/// Merges mapping entries into a binding map. Empty asset ids become explicit `None`.
pub fn merge_character_assets(target: &mut CharacterAssetMap, entries: &CharacterAssetMap) {
    for (character_id, asset_id) in entries {
        let value = asset_id
            .as_ref()
            .filter(|id| !id.as_str().trim().is_empty())
            .cloned();
        target.insert(character_id.clone(), value);
    }
}
