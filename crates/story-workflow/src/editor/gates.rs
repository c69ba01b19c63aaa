//! The write path for step patches and the character mapping.

use tracing::{debug, warn};

use super::{Notice, StoryEditor};
use crate::ids::{AssetId, CharacterId, NodeId};
use crate::readiness::required_character_ids;
use crate::workflow::{
    merge_character_assets, BindingPatch, CharacterAssetMap, Step2Patch, Step3Patch, Step4Patch,
    StoryNode,
};

/// Replaces the step3 map, mirrors it into the step4 bindings and re-derives
/// step3 status. The only place the two maps are brought together.
pub(crate) fn sync_mapping(node: &mut StoryNode, mapping: CharacterAssetMap, required: &[CharacterId]) {
    node.step3.character_asset_map = mapping;
    merge_character_assets(
        &mut node.step4.asset_bindings.character_asset_ids,
        &node.step3.character_asset_map,
    );
    node.step3.status = node.step3.status.promoted();
    node.step3.status = node.step3.derived_status(required);
}

/// Adds one character's reference asset to an existing mapping.
pub(crate) fn map_character(
    node: &mut StoryNode,
    character_id: &CharacterId,
    asset_id: &AssetId,
    required: &[CharacterId],
) {
    let mut mapping = node.step3.character_asset_map.clone();
    mapping.insert(character_id.clone(), Some(asset_id.clone()));
    sync_mapping(node, mapping, required);
}

impl StoryEditor {
    /// Index of the node if it exists and is writable. Locked nodes raise a notice.
    pub(crate) fn writable_node_index(&mut self, node_id: &NodeId) -> Option<usize> {
        let workflow = self.data.story_workflow.as_ref()?;
        let Some(idx) = workflow.nodes.iter().position(|node| &node.id == node_id) else {
            debug!(node_id = %node_id, "update for unknown node ignored");
            return None;
        };
        if workflow.nodes[idx].locked {
            warn!(node_id = %node_id, "node is locked");
            self.notify(Notice::NodeLocked {
                node_id: node_id.clone(),
            });
            return None;
        }
        Some(idx)
    }

    pub(crate) fn node_at_mut(&mut self, idx: usize) -> Option<&mut StoryNode> {
        self.data.story_workflow.as_mut()?.nodes.get_mut(idx)
    }

    pub(crate) fn required_at(&self, idx: usize) -> Vec<CharacterId> {
        self.data
            .story_workflow
            .as_ref()
            .and_then(|workflow| workflow.nodes.get(idx))
            .map(|node| required_character_ids(node, &self.data))
            .unwrap_or_default()
    }

    /// Outline edits. Summary and background are mirrored onto the node's beat.
    pub fn update_node_step2(&mut self, node_id: &NodeId, patch: Step2Patch) -> bool {
        let Some(idx) = self.writable_node_index(node_id) else {
            return false;
        };
        self.checkpoint();
        let summary = patch.summary.clone();
        let background = patch.background.clone();
        let Some(node) = self.node_at_mut(idx) else {
            return false;
        };
        patch.apply(&mut node.step2);
        let beat_id = node.primary_beat_id().cloned();

        if let Some(beat) = beat_id.and_then(|beat_id| self.data.beats.get_mut(&beat_id)) {
            if let Some(summary) = summary {
                beat.narration = Some(summary);
            }
            if let Some(background) = background {
                beat.camera_description = Some(background);
            }
        }
        debug!(node_id = %node_id, "step2 updated");
        true
    }

    pub fn update_node_step3(&mut self, node_id: &NodeId, patch: Step3Patch) -> bool {
        let Some(idx) = self.writable_node_index(node_id) else {
            return false;
        };
        self.checkpoint();
        let required = self.required_at(idx);
        let Some(node) = self.node_at_mut(idx) else {
            return false;
        };
        patch.apply(&mut node.step3);
        node.step3.status = node.step3.derived_status(&required);
        debug!(node_id = %node_id, "step3 updated");
        true
    }

    pub fn update_node_step4(&mut self, node_id: &NodeId, patch: Step4Patch) -> bool {
        let Some(idx) = self.writable_node_index(node_id) else {
            return false;
        };
        self.checkpoint();
        let Some(node) = self.node_at_mut(idx) else {
            return false;
        };
        patch.apply(&mut node.step4);
        debug!(node_id = %node_id, "step4 updated");
        true
    }

    /// Replaces the step3 map wholesale and mirrors it into the step4 bindings.
    pub fn update_node_step3_mapping(&mut self, node_id: &NodeId, mapping: CharacterAssetMap) -> bool {
        let Some(idx) = self.writable_node_index(node_id) else {
            return false;
        };
        self.checkpoint();
        let required = self.required_at(idx);
        let Some(node) = self.node_at_mut(idx) else {
            return false;
        };
        sync_mapping(node, mapping, &required);
        debug!(node_id = %node_id, status = ?node.step3.status, "step3 mapping updated");
        true
    }

    pub fn update_node_step4_binding(&mut self, node_id: &NodeId, patch: BindingPatch) -> bool {
        let Some(idx) = self.writable_node_index(node_id) else {
            return false;
        };
        self.checkpoint();
        let Some(node) = self.node_at_mut(idx) else {
            return false;
        };
        patch.apply(&mut node.step4.asset_bindings);
        node.step4.status = node.step4.status.promoted();
        debug!(node_id = %node_id, "step4 bindings updated");
        true
    }
}
