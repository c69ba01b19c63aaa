//! Rebuilds the ordered node list from the scene/beat graph.
//!
//! Nodes are matched to the previous workflow by beat id and carry their step
//! progress forward verbatim, except that step3 status is re-derived against
//! the beat's current cast. Unmatched beats get fresh nodes. The result never
//! references a beat that no longer exists, and `selected_node_id` always points
//! at a surviving node.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info};

use crate::ids::{BeatId, CharacterId, NodeId};
use crate::lock::{apply_lock_policy, infer_branch_boundary_order};
use crate::model::{AssetType, Beat, EditorData, Scene};
use crate::workflow::{
    AssetBindings, BranchPolicy, CharacterAssetMap, MappingStep, OutlineStep, RenderStep,
    StepStatus, StoryNode, StoryWorkflow,
};

/// Reference image for a character: a related image asset, else a linked seed's asset.
fn fallback_character_map(data: &EditorData, workflow: &StoryWorkflow, beat: &Beat) -> CharacterAssetMap {
    let mut map = CharacterAssetMap::new();
    for character_id in &beat.character_ids {
        map.insert(character_id.clone(), reference_asset_for(data, workflow, character_id));
    }
    map
}

fn reference_asset_for(
    data: &EditorData,
    workflow: &StoryWorkflow,
    character_id: &CharacterId,
) -> Option<crate::ids::AssetId> {
    data.character_reference_asset(character_id)
        .map(|asset| asset.id.clone())
        .or_else(|| {
            workflow
                .global
                .character_seeds
                .iter()
                .filter(|seed| seed.linked_character_id.as_ref() == Some(character_id))
                .find_map(|seed| seed.reference_asset_id.clone())
                .filter(|asset_id| data.assets.contains_key(asset_id))
        })
}

fn node_title(scene: &Scene, beat: &Beat) -> String {
    let scene_title = if scene.title.trim().is_empty() {
        "Scene"
    } else {
        scene.title.as_str()
    };
    format!("{} · Beat {}", scene_title, beat.order + 1)
}

fn fresh_node(data: &EditorData, base: &StoryWorkflow, scene: &Scene, beat: &Beat, order: u32) -> StoryNode {
    let fallback = fallback_character_map(data, base, beat);
    let background_asset_id = data
        .first_beat_asset_of_type(&beat.id, AssetType::Image)
        .map(|asset| asset.id.clone());
    let video_asset_id = data.beat_video_asset(&beat.id).map(|asset| asset.id.clone());

    let mut step3 = MappingStep {
        character_asset_map: fallback.clone(),
        ..MappingStep::default()
    };
    step3.status = step3.derived_status(&beat.character_ids);

    StoryNode {
        id: NodeId::new(),
        order,
        title: node_title(scene, beat),
        scene_id: Some(beat.scene_id.clone()),
        beat_ids: vec![beat.id.clone()],
        locked: false,
        step2: OutlineStep {
            status: StepStatus::Todo,
            script_mode: base.global.script_mode,
            segment_length: base.global.segment_length,
            summary: beat.narration_text().to_string(),
            background: beat.camera_text().to_string(),
            ..OutlineStep::default()
        },
        step3,
        step4: RenderStep {
            video_asset_id,
            asset_bindings: AssetBindings {
                background_asset_id,
                character_asset_ids: fallback,
                ..AssetBindings::default()
            },
            ..RenderStep::default()
        },
    }
}

/// Builds the workflow for `branch_name` from the current graph.
///
/// `existing` falls back to the workflow stored on `data`, then to an empty one.
pub fn reconcile_workflow(
    data: &EditorData,
    branch_name: &str,
    existing: Option<&StoryWorkflow>,
    main_branch: &str,
) -> StoryWorkflow {
    let base = existing
        .or(data.story_workflow.as_ref())
        .cloned()
        .unwrap_or_else(|| StoryWorkflow::empty(branch_name, main_branch));

    let mut existing_by_beat: BTreeMap<&BeatId, &StoryNode> = BTreeMap::new();
    for node in &base.nodes {
        for beat_id in &node.beat_ids {
            existing_by_beat.insert(beat_id, node);
        }
    }

    let mut nodes: Vec<StoryNode> = Vec::new();
    let mut claimed: HashSet<NodeId> = HashSet::new();
    let mut carried = 0usize;
    for (scene, beat) in data.ordered_beats() {
        let order = nodes.len() as u32;
        let node = match existing_by_beat.get(&beat.id) {
            Some(previous) => {
                carried += 1;
                let id = if claimed.contains(&previous.id) {
                    NodeId::new()
                } else {
                    previous.id.clone()
                };
                // the beat's cast may have changed since step3 was last derived
                let mut step3 = previous.step3.clone();
                step3.status = step3.derived_status(&beat.character_ids);
                StoryNode {
                    id,
                    order,
                    title: node_title(scene, beat),
                    scene_id: Some(beat.scene_id.clone()),
                    beat_ids: vec![beat.id.clone()],
                    locked: false,
                    step2: previous.step2.clone(),
                    step3,
                    step4: previous.step4.clone(),
                }
            }
            None => fresh_node(data, &base, scene, beat, order),
        };
        claimed.insert(node.id.clone());
        nodes.push(node);
    }

    let mut branch_policy = if base.branch_policy.branch_name == branch_name {
        base.branch_policy.clone()
    } else {
        BranchPolicy::default_for(branch_name, main_branch)
    };
    if branch_name != main_branch && !branch_policy.boundary_configured {
        branch_policy.lock_boundary_order = Some(infer_branch_boundary_order(&nodes));
    }

    let selected_node_id = base
        .selected_node_id
        .clone()
        .filter(|selected| nodes.iter().any(|node| &node.id == selected))
        .or_else(|| nodes.first().map(|node| node.id.clone()));

    let dropped = base.nodes.len().saturating_sub(carried);
    let mut workflow = StoryWorkflow {
        selected_node_id,
        nodes,
        branch_policy,
        ui: base.ui.clone().normalized(),
        ..base
    };
    apply_lock_policy(&mut workflow);

    info!(
        branch = %branch_name,
        nodes = workflow.nodes.len(),
        carried,
        dropped,
        boundary = ?workflow.branch_policy.lock_boundary_order,
        "story workflow reconciled"
    );
    workflow
}

/// Rewrites node beat links ahead of a reconcile so progress follows regenerated beats.
pub fn remap_node_beat_ids(workflow: &mut StoryWorkflow, old_to_new: &BTreeMap<BeatId, BeatId>) {
    for node in &mut workflow.nodes {
        let mut remapped: Vec<BeatId> = Vec::with_capacity(node.beat_ids.len());
        for beat_id in &node.beat_ids {
            let next = old_to_new.get(beat_id).unwrap_or(beat_id).clone();
            if !remapped.contains(&next) {
                remapped.push(next);
            }
        }
        if remapped != node.beat_ids {
            debug!(node_id = %node.id, "node beat ids remapped");
            node.beat_ids = remapped;
        }
    }
}

/// Rebuilds the workflow and pins the boundary at the inferred persisted prefix.
pub fn prepare_for_moved_boundary(
    data: &EditorData,
    branch_name: &str,
    main_branch: &str,
) -> (StoryWorkflow, u32) {
    let mut workflow = reconcile_workflow(data, branch_name, None, main_branch);
    let boundary = infer_branch_boundary_order(&workflow.nodes);
    workflow.branch_policy = BranchPolicy {
        branch_name: branch_name.to_string(),
        lock_boundary_order: Some(boundary),
        boundary_configured: true,
    };
    apply_lock_policy(&mut workflow);
    (workflow, boundary)
}
