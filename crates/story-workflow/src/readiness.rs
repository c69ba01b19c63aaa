//! Pure readiness projections over a node and the entities it references.
//!
//! Nothing here mutates state. Confirmation gates and UI routing both read the
//! same summaries so that the blocker a user sees is the blocker a gate reports.

use serde::{Deserialize, Serialize};

use crate::ids::{AssetId, CharacterId};
use crate::model::{AssetType, EditorData};
use crate::params::parse_params_object;
use crate::workflow::{is_mapped, FocusTarget, RenderProvider, StepKey, StepStatus, StoryNode};

/// Step4 blockers, declared in priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Mapping,
    Image,
    Params,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    ReadOnly,
    EditStep2,
    FixStep3,
    RenderStep4,
    ReviewStep4,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecommendation {
    pub action: RecommendedAction,
    pub target_step: StepKey,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockNavigation {
    pub target_step: StepKey,
    pub focus_target: FocusTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Step3MappingSummary {
    pub total: usize,
    pub mapped: usize,
    pub missing_character_ids: Vec<CharacterId>,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Step4RenderReadiness {
    pub character_ids: Vec<CharacterId>,
    pub missing_character_ids: Vec<CharacterId>,
    pub missing_character_names: Vec<String>,
    pub mapping_complete: bool,
    pub image_binding_missing: bool,
    pub has_primary_image: bool,
    pub primary_image_asset_id: Option<AssetId>,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Step4ConfirmReadiness {
    #[serde(flatten)]
    pub render: Step4RenderReadiness,
    pub params_valid: bool,
    pub video_ready: bool,
    pub video_asset_id: Option<AssetId>,
    pub confirm_ready: bool,
    pub block_reasons: Vec<BlockReason>,
}

/// Union of the characters across the node's beats, first-seen order.
pub fn required_character_ids(node: &StoryNode, data: &EditorData) -> Vec<CharacterId> {
    let mut out: Vec<CharacterId> = Vec::new();
    for beat_id in &node.beat_ids {
        let Some(beat) = data.beats.get(beat_id) else {
            continue;
        };
        for character_id in &beat.character_ids {
            if !out.contains(character_id) {
                out.push(character_id.clone());
            }
        }
    }
    out
}

pub fn summarize_step3_mapping(node: &StoryNode, data: &EditorData) -> Step3MappingSummary {
    let character_ids = required_character_ids(node, data);
    let total = character_ids.len();
    let missing_character_ids: Vec<CharacterId> = character_ids
        .into_iter()
        .filter(|character_id| !is_mapped(node.step3.character_asset_map.get(character_id)))
        .collect();
    let mapped = total - missing_character_ids.len();
    Step3MappingSummary {
        total,
        mapped,
        complete: missing_character_ids.is_empty(),
        missing_character_ids,
    }
}

pub fn collect_step3_missing_character_names(node: &StoryNode, data: &EditorData) -> Vec<String> {
    summarize_step3_mapping(node, data)
        .missing_character_ids
        .iter()
        .map(|character_id| data.character_name(character_id))
        .collect()
}

fn usable_asset(data: &EditorData, asset_id: Option<&AssetId>, kind: AssetType) -> Option<AssetId> {
    let asset = data.assets.get(asset_id?)?;
    asset.is_usable(kind).then(|| asset.id.clone())
}

/// Either map satisfying a character counts as mapped.
pub fn summarize_step4_render_readiness(node: &StoryNode, data: &EditorData) -> Step4RenderReadiness {
    let character_ids = required_character_ids(node, data);
    let bindings = &node.step4.asset_bindings;
    let missing_character_ids: Vec<CharacterId> = character_ids
        .iter()
        .filter(|character_id| {
            !is_mapped(node.step3.character_asset_map.get(*character_id))
                && !is_mapped(bindings.character_asset_ids.get(*character_id))
        })
        .cloned()
        .collect();
    let missing_character_names = missing_character_ids
        .iter()
        .map(|character_id| data.character_name(character_id))
        .collect();

    let primary_image_asset_id =
        usable_asset(data, bindings.start_image_asset_id.as_ref(), AssetType::Image).or_else(|| {
            usable_asset(data, bindings.background_asset_id.as_ref(), AssetType::Image)
        });
    let has_primary_image = primary_image_asset_id.is_some();
    let mapping_complete = missing_character_ids.is_empty();

    Step4RenderReadiness {
        character_ids,
        missing_character_ids,
        missing_character_names,
        mapping_complete,
        image_binding_missing: !has_primary_image,
        has_primary_image,
        primary_image_asset_id,
        ready: mapping_complete && has_primary_image,
    }
}

pub fn summarize_step4_confirm_readiness(node: &StoryNode, data: &EditorData) -> Step4ConfirmReadiness {
    let render = summarize_step4_render_readiness(node, data);
    let params_valid = match node.step4.provider {
        RenderProvider::Comfyui => parse_params_object(&node.step4.comfyui_params_json).is_ok(),
        RenderProvider::Segment => true,
    };
    let video_asset_id = usable_asset(data, node.step4.video_asset_id.as_ref(), AssetType::Video);
    let video_ready = video_asset_id.is_some();

    let mut block_reasons = Vec::new();
    if !render.mapping_complete {
        block_reasons.push(BlockReason::Mapping);
    }
    if render.image_binding_missing {
        block_reasons.push(BlockReason::Image);
    }
    if !params_valid {
        block_reasons.push(BlockReason::Params);
    }
    if !video_ready {
        block_reasons.push(BlockReason::Video);
    }

    Step4ConfirmReadiness {
        confirm_ready: render.ready && params_valid && video_ready,
        render,
        params_valid,
        video_ready,
        video_asset_id: node.step4.video_asset_id.clone(),
        block_reasons,
    }
}

pub fn resolve_node_recommended_action(node: &StoryNode, data: &EditorData) -> NodeRecommendation {
    let (action, target_step) = if node.locked {
        (RecommendedAction::ReadOnly, StepKey::Step2)
    } else if node.step2.status != StepStatus::Done {
        (RecommendedAction::EditStep2, StepKey::Step2)
    } else if !summarize_step3_mapping(node, data).complete || !node.step3.status.is_done() {
        (RecommendedAction::FixStep3, StepKey::Step3)
    } else if node.step4.confirmed || node.step4.status.is_done() {
        (RecommendedAction::ReviewStep4, StepKey::Step4)
    } else {
        (RecommendedAction::RenderStep4, StepKey::Step4)
    };
    NodeRecommendation {
        action,
        target_step,
    }
}

/// The clicked reason unless a higher-priority blocker is present.
pub fn resolve_effective_block_reason(clicked: BlockReason, reasons: &[BlockReason]) -> BlockReason {
    reasons
        .iter()
        .copied()
        .filter(|reason| *reason < clicked)
        .min()
        .unwrap_or(clicked)
}

pub fn resolve_block_navigation(reason: BlockReason) -> BlockNavigation {
    let (target_step, focus_target) = match reason {
        BlockReason::Mapping => (StepKey::Step3, FocusTarget::Step3Mapping),
        BlockReason::Image => (StepKey::Step4, FocusTarget::Step4ImageBinding),
        BlockReason::Params => (StepKey::Step4, FocusTarget::Step4Params),
        BlockReason::Video => (StepKey::Step4, FocusTarget::Step4VideoConfirm),
    };
    BlockNavigation {
        target_step,
        focus_target,
    }
}
