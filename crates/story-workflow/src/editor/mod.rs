//! The editing session for one branch: owns the workspace data, the user's
//! selection, the undo history and the queue of user-facing notices.
//!
//! Every write to the story workflow goes through a method on [`StoryEditor`].
//! Derived fields (`locked`, step3 status, selection) are recomputed inside the
//! same call as the write that affects them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::history::{SnapshotHistory, DEFAULT_HISTORY_LIMIT};
use crate::ids::{AssetId, BeatId, NodeId, TaskId};
use crate::model::{Asset, AssetSource, AssetType, EditorData, GenerationTask, Selection, TaskStatus};
use crate::readiness::{
    self, NodeRecommendation, Step3MappingSummary, Step4ConfirmReadiness, Step4RenderReadiness,
};
use crate::lock::{rewrite_unlocked_nodes, set_branch_boundary};
use crate::reconcile::{prepare_for_moved_boundary, reconcile_workflow, remap_node_beat_ids};
use crate::storyboard::{editor_data_from_storyboard, split_shots_into_beats, StoryboardScene};
use crate::workflow::{
    StepKey, StoryGlobal, StoryMeta, StoryNode, StoryUi, StoryWorkflow, DEFAULT_MAIN_BRANCH,
};
use crate::WorkflowError;

mod confirm;
mod gates;
mod tasks;

pub use confirm::{ConfirmStep3Error, ConfirmVideoError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EditorOptions {
    pub history_limit: usize,
    pub main_branch: String,
}

impl Default for EditorOptions {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            main_branch: DEFAULT_MAIN_BRANCH.to_string(),
        }
    }
}

/// Messages the caller should surface to the user. Never errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    NodeLocked {
        node_id: NodeId,
    },
    MappingIncomplete {
        node_id: NodeId,
        missing_character_names: Vec<String>,
    },
    ConfirmBlocked {
        node_id: NodeId,
        reason: String,
    },
}

/// Unit of undo: the whole workspace plus selection.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorSnapshot {
    pub data: EditorData,
    pub selection: Selection,
}

#[derive(Debug)]
pub struct StoryEditor {
    data: EditorData,
    selection: Selection,
    branch_name: String,
    options: EditorOptions,
    history: SnapshotHistory<EditorSnapshot>,
    notices: Vec<Notice>,
}

impl StoryEditor {
    pub fn new(branch_name: impl Into<String>, options: EditorOptions) -> Self {
        Self::from_data(EditorData::default(), Selection::default(), branch_name, options)
    }

    /// Opens a session over loaded data. The stored workflow is reconciled
    /// against the graph before anything reads it.
    pub fn from_data(
        data: EditorData,
        selection: Selection,
        branch_name: impl Into<String>,
        options: EditorOptions,
    ) -> Self {
        let mut editor = Self {
            data,
            selection,
            branch_name: branch_name.into(),
            history: SnapshotHistory::new(options.history_limit),
            options,
            notices: Vec::new(),
        };
        editor.rebuild_workflow();
        editor
    }

    pub fn data(&self) -> &EditorData {
        &self.data
    }

    pub fn into_parts(self) -> (EditorData, Selection) {
        (self.data, self.selection)
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn options(&self) -> &EditorOptions {
        &self.options
    }

    pub fn workflow(&self) -> Option<&StoryWorkflow> {
        self.data.story_workflow.as_ref()
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&StoryNode> {
        self.workflow()?.node(node_id)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub(crate) fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    fn snapshot(&self) -> EditorSnapshot {
        EditorSnapshot {
            data: self.data.clone(),
            selection: self.selection.clone(),
        }
    }

    /// Records the current state as one undo step. Inside an open caller
    /// group this folds into the group's snapshot.
    pub(crate) fn checkpoint(&mut self) {
        let snapshot = self.snapshot();
        self.history.begin_group(&snapshot);
        self.history.end_group();
    }

    pub fn begin_history_group(&mut self) {
        let snapshot = self.snapshot();
        self.history.begin_group(&snapshot);
    }

    pub fn end_history_group(&mut self) {
        self.history.end_group();
    }

    pub fn undo(&mut self) -> Result<(), WorkflowError> {
        let current = self.snapshot();
        let restored = self.history.undo(current)?;
        self.restore(restored);
        debug!("undo");
        Ok(())
    }

    pub fn redo(&mut self) -> Result<(), WorkflowError> {
        let current = self.snapshot();
        let restored = self.history.redo(current)?;
        self.restore(restored);
        debug!("redo");
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    fn restore(&mut self, snapshot: EditorSnapshot) {
        self.data = snapshot.data;
        self.selection = snapshot.selection;
    }

    pub(crate) fn workflow_mut(&mut self) -> Result<&mut StoryWorkflow, WorkflowError> {
        self.data.story_workflow.as_mut().ok_or(WorkflowError::NoWorkflow)
    }

    fn rebuild_workflow(&mut self) {
        let workflow = reconcile_workflow(
            &self.data,
            &self.branch_name,
            None,
            &self.options.main_branch,
        );
        self.data.story_workflow = Some(workflow);
        self.sync_selection_from_workflow();
    }

    /// Rebuilds the node list against the current scene/beat graph.
    pub fn reconcile(&mut self) {
        self.checkpoint();
        self.rebuild_workflow();
    }

    /// Switches the session to another branch and rebuilds under its policy.
    pub fn switch_branch(&mut self, branch_name: impl Into<String>) {
        self.checkpoint();
        self.branch_name = branch_name.into();
        self.rebuild_workflow();
    }

    /// Replaces the graph with a generated storyboard and lands on step2.
    pub fn initialize_from_storyboard(&mut self, storyboard: &[StoryboardScene], duration: f64) {
        self.checkpoint();
        let previous = self.data.story_workflow.take();
        let mut next = editor_data_from_storyboard(storyboard, duration);
        next.characters = std::mem::take(&mut self.data.characters);
        next.assets = std::mem::take(&mut self.data.assets);
        next.generation_tasks = std::mem::take(&mut self.data.generation_tasks);
        self.data = next;

        let mut workflow = reconcile_workflow(
            &self.data,
            &self.branch_name,
            previous.as_ref(),
            &self.options.main_branch,
        );
        workflow.active_step = StepKey::Step2;
        workflow.selected_node_id = workflow.nodes.first().map(|node| node.id.clone());
        self.data.story_workflow = Some(workflow);
        self.sync_selection_from_workflow();
        info!(
            beats = self.data.beats.len(),
            scenes = self.data.scene_order.len(),
            "story workflow initialised from storyboard"
        );
    }

    /// Appends storyboard rows as new scenes after the existing ones.
    pub fn append_storyboard(&mut self, storyboard: &[StoryboardScene], duration: f64) {
        self.checkpoint();
        let appended = editor_data_from_storyboard(storyboard, duration);
        let offset = self.data.scene_order.len() as u32;
        for scene_id in appended.scene_order {
            if let Some(mut scene) = appended.scenes.get(&scene_id).cloned() {
                scene.order += offset;
                self.data.scene_order.push(scene_id.clone());
                self.data.scenes.insert(scene_id, scene);
            }
        }
        self.data.beats.extend(appended.beats);
        self.rebuild_workflow();
    }

    /// Moves node links from old to new beat ids, then reconciles.
    pub fn remap_node_beat_ids(&mut self, old_to_new: &BTreeMap<BeatId, BeatId>) {
        self.checkpoint();
        if let Some(workflow) = self.data.story_workflow.as_mut() {
            remap_node_beat_ids(workflow, old_to_new);
        }
        self.rebuild_workflow();
    }

    /// Splits a beat's shots into segment beats. The beat's node follows its
    /// first segment, so its progress survives.
    pub fn convert_shots_to_segments(&mut self, beat_id: &BeatId) -> Result<Vec<BeatId>, WorkflowError> {
        let mut next = self.data.clone();
        let segments = split_shots_into_beats(&mut next, beat_id)?;
        let Some(first) = segments.first() else {
            return Ok(segments);
        };
        let mut remap = BTreeMap::new();
        remap.insert(beat_id.clone(), first.clone());

        self.checkpoint();
        self.data = next;
        if let Some(workflow) = self.data.story_workflow.as_mut() {
            remap_node_beat_ids(workflow, &remap);
        }
        self.rebuild_workflow();
        debug!(beat_id = %beat_id, segments = segments.len(), "shots converted to segments");
        Ok(segments)
    }

    /// Moves the lock boundary. Does not rewrite the unlocked tail; callers
    /// that want that follow up with [`Self::rewrite_unlocked_nodes_from_boundary`].
    pub fn set_branch_boundary(&mut self, boundary: Option<u32>) {
        if self.data.story_workflow.is_none() {
            return;
        }
        self.checkpoint();
        if let Some(workflow) = self.data.story_workflow.as_mut() {
            set_branch_boundary(workflow, boundary);
        }
    }

    pub fn rewrite_unlocked_nodes_from_boundary(&mut self) -> usize {
        if self.data.story_workflow.is_none() {
            return 0;
        }
        self.checkpoint();
        let Some(mut workflow) = self.data.story_workflow.take() else {
            return 0;
        };
        let rewritten = rewrite_unlocked_nodes(&mut workflow, &self.data);
        self.data.story_workflow = Some(workflow);
        rewritten
    }

    /// Rebuilds the workflow and pins the boundary at the persisted prefix.
    pub fn prepare_for_moved_boundary(&mut self) -> u32 {
        self.checkpoint();
        let (workflow, boundary) =
            prepare_for_moved_boundary(&self.data, &self.branch_name, &self.options.main_branch);
        self.data.story_workflow = Some(workflow);
        self.sync_selection_from_workflow();
        boundary
    }

    pub fn update_story_global(&mut self, update: impl FnOnce(&mut StoryGlobal)) -> Result<(), WorkflowError> {
        self.workflow_mut()?;
        self.checkpoint();
        update(&mut self.workflow_mut()?.global);
        Ok(())
    }

    pub fn update_story_meta(&mut self, update: impl FnOnce(&mut StoryMeta)) -> Result<(), WorkflowError> {
        self.workflow_mut()?;
        self.checkpoint();
        update(&mut self.workflow_mut()?.meta);
        Ok(())
    }

    pub fn update_story_ui(&mut self, update: impl FnOnce(&mut StoryUi)) -> Result<(), WorkflowError> {
        let workflow = self.workflow_mut()?;
        update(&mut workflow.ui);
        let normalized = std::mem::take(&mut workflow.ui).normalized();
        workflow.ui = normalized;
        Ok(())
    }

    /// Focuses a node and moves the beat and timeline selections with it.
    pub fn select_story_node(&mut self, node_id: &NodeId) -> bool {
        let Some(workflow) = self.data.story_workflow.as_mut() else {
            return false;
        };
        if workflow.node(node_id).is_none() {
            return false;
        }
        workflow.selected_node_id = Some(node_id.clone());
        self.sync_selection_from_workflow();
        true
    }

    pub(crate) fn sync_selection_from_workflow(&mut self) {
        let Some(workflow) = self.data.story_workflow.as_ref() else {
            return;
        };
        let node = workflow.selected_node();
        let beat_id = node.and_then(|node| node.primary_beat_id()).cloned();
        let timeline_item_id = beat_id.as_ref().and_then(|beat_id| {
            self.data
                .timeline_items
                .values()
                .find(|item| item.linked_beat_id.as_ref() == Some(beat_id))
                .map(|item| item.id.clone())
        });
        self.selection.selected_story_node_id = node.map(|node| node.id.clone());
        self.selection.selected_beat_id = beat_id;
        self.selection.selected_timeline_item_id = timeline_item_id;
    }

    /// Registers a standalone image, e.g. an uploaded character reference.
    pub fn add_image_asset(
        &mut self,
        url: impl Into<String>,
        source: AssetSource,
        generation_params: Option<serde_json::Value>,
    ) -> AssetId {
        self.checkpoint();
        let mut asset = Asset::new(AssetType::Image, url, source);
        asset.generation_params = generation_params;
        let asset_id = asset.id.clone();
        self.data.assets.insert(asset_id.clone(), asset);
        asset_id
    }

    pub fn add_generation_task(&mut self, task: GenerationTask) {
        self.data.generation_tasks.retain(|existing| existing.id != task.id);
        debug!(task_id = %task.id, kind = ?task.kind, "generation task registered");
        self.data.generation_tasks.push(task);
    }

    pub fn update_generation_task_status(
        &mut self,
        task_id: &TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), WorkflowError> {
        let task = self
            .data
            .task_mut(task_id)
            .ok_or_else(|| WorkflowError::TaskNotFound(task_id.clone()))?;
        task.status = status;
        if error.is_some() {
            task.error = error;
        }
        Ok(())
    }

    pub fn recommended_action(&self, node_id: &NodeId) -> Option<NodeRecommendation> {
        let node = self.node(node_id)?;
        Some(readiness::resolve_node_recommended_action(node, &self.data))
    }

    pub fn step3_mapping_summary(&self, node_id: &NodeId) -> Option<Step3MappingSummary> {
        let node = self.node(node_id)?;
        Some(readiness::summarize_step3_mapping(node, &self.data))
    }

    pub fn step4_render_readiness(&self, node_id: &NodeId) -> Option<Step4RenderReadiness> {
        let node = self.node(node_id)?;
        Some(readiness::summarize_step4_render_readiness(node, &self.data))
    }

    pub fn step4_confirm_readiness(&self, node_id: &NodeId) -> Option<Step4ConfirmReadiness> {
        let node = self.node(node_id)?;
        Some(readiness::summarize_step4_confirm_readiness(node, &self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyboard::StoryboardScene;

    fn rows(count: usize) -> Vec<StoryboardScene> {
        (0..count)
            .map(|idx| StoryboardScene {
                scene_number: Some(1),
                narration: Some(format!("beat {idx}")),
                visual_description: None,
            })
            .collect()
    }

    #[test]
    fn storyboard_initialisation_lands_on_step2() {
        let mut editor = StoryEditor::new("main", EditorOptions::default());
        editor.initialize_from_storyboard(&rows(2), 8.0);
        let workflow = editor.workflow().unwrap();
        assert_eq!(workflow.active_step, StepKey::Step2);
        assert_eq!(workflow.nodes.len(), 2);
        let first = workflow.nodes[0].clone();
        assert_eq!(workflow.selected_node_id, Some(first.id.clone()));
        assert_eq!(editor.selection().selected_story_node_id, Some(first.id));
        assert_eq!(editor.selection().selected_beat_id, first.beat_ids.first().cloned());
    }

    #[test]
    fn select_story_node_keeps_selections_in_lockstep() {
        let mut editor = StoryEditor::new("main", EditorOptions::default());
        editor.initialize_from_storyboard(&rows(2), 8.0);
        let second = editor.workflow().unwrap().nodes[1].clone();
        assert!(editor.select_story_node(&second.id));
        assert_eq!(editor.selection().selected_beat_id, second.beat_ids.first().cloned());
        assert!(!editor.select_story_node(&NodeId::from("missing")));
        assert_eq!(editor.workflow().unwrap().selected_node_id, Some(second.id));
    }

    #[test]
    fn append_keeps_existing_progress() {
        let mut editor = StoryEditor::new("main", EditorOptions::default());
        editor.initialize_from_storyboard(&rows(1), 4.0);
        let first = editor.workflow().unwrap().nodes[0].id.clone();
        editor.append_storyboard(&rows(2), 4.0);
        let workflow = editor.workflow().unwrap();
        assert_eq!(workflow.nodes.len(), 3);
        assert_eq!(workflow.nodes[0].id, first);
        assert_eq!(editor.data().scene_order.len(), 2);
    }

    #[test]
    fn ui_updates_are_normalised() {
        let mut editor = StoryEditor::new("main", EditorOptions::default());
        editor
            .update_story_ui(|ui| {
                ui.preview_prefer_card = true;
                ui.event_flow_pulse_at = Some(-3);
            })
            .unwrap();
        let ui = &editor.workflow().unwrap().ui;
        assert!(ui.preview_prefer_card);
        assert_eq!(ui.event_flow_pulse_at, None);
    }

    #[test]
    fn undo_without_history_errors() {
        let mut editor = StoryEditor::new("main", EditorOptions::default());
        assert!(matches!(
            editor.undo(),
            Err(WorkflowError::HistoryEmpty("undo stack"))
        ));
    }
}
