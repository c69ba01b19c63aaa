//! Confirmation gates, the active-step guard and selection advancement.

use thiserror::Error;
use tracing::{info, warn};

use super::{Notice, StoryEditor};
use crate::ids::NodeId;
use crate::readiness::{
    collect_step3_missing_character_names, required_character_ids, summarize_step4_confirm_readiness,
};
use crate::workflow::{StepKey, StepStatus, StoryNode};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfirmStep3Error {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("node is locked: {0}")]
    Locked(NodeId),
    #[error("characters without a reference image: {}", .missing.join(", "))]
    MissingCharacters { missing: Vec<String> },
}

impl ConfirmStep3Error {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "node_not_found",
            Self::Locked(_) => "locked",
            Self::MissingCharacters { .. } => "mapping_incomplete",
        }
    }

    pub fn missing(&self) -> &[String] {
        match self {
            Self::MissingCharacters { missing } => missing,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfirmVideoError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("node is locked: {0}")]
    Locked(NodeId),
    #[error("character mapping incomplete: {}", .missing_character_names.join(", "))]
    MappingIncomplete { missing_character_names: Vec<String> },
    #[error("no image bound")]
    MissingImage,
    #[error("no video ready")]
    MissingVideo,
}

impl ConfirmVideoError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "node_not_found",
            Self::Locked(_) => "locked",
            Self::MappingIncomplete { .. } => "mapping_incomplete",
            Self::MissingImage => "missing_image",
            Self::MissingVideo => "missing_video",
        }
    }
}

impl StoryEditor {
    /// Step3 to step4. A failed check leaves step3 in progress and changes nothing else.
    pub fn confirm_node_step3(&mut self, node_id: &NodeId) -> Result<(), ConfirmStep3Error> {
        let Some(node) = self.node(node_id) else {
            return Err(ConfirmStep3Error::NodeNotFound(node_id.clone()));
        };
        if node.locked {
            warn!(node_id = %node_id, "step3 confirmation denied: node locked");
            self.notify(Notice::NodeLocked {
                node_id: node_id.clone(),
            });
            return Err(ConfirmStep3Error::Locked(node_id.clone()));
        }
        let missing = collect_step3_missing_character_names(node, &self.data);
        let required = required_character_ids(node, &self.data);
        let current = node.step3.status;

        if !missing.is_empty() {
            if current != StepStatus::InProgress {
                self.checkpoint();
                if let Some(node) = self.workflow_node_mut(node_id) {
                    node.step3.status = StepStatus::InProgress;
                }
            }
            self.notify(Notice::MappingIncomplete {
                node_id: node_id.clone(),
                missing_character_names: missing.clone(),
            });
            return Err(ConfirmStep3Error::MissingCharacters { missing });
        }

        self.checkpoint();
        if let Ok(workflow) = self.workflow_mut() {
            if let Some(node) = workflow.node_mut(node_id) {
                node.step3.status = node.step3.derived_status(&required);
            }
            workflow.active_step = StepKey::Step4;
        }
        info!(node_id = %node_id, "step3 confirmed");
        Ok(())
    }

    /// The terminal gate. Blockers are reported mapping first, then image, then video.
    pub fn confirm_node_video(&mut self, node_id: &NodeId) -> Result<(), ConfirmVideoError> {
        let Some(node) = self.node(node_id) else {
            return Err(ConfirmVideoError::NodeNotFound(node_id.clone()));
        };
        let failure = if node.locked {
            Some(ConfirmVideoError::Locked(node_id.clone()))
        } else {
            let readiness = summarize_step4_confirm_readiness(node, &self.data);
            if !readiness.render.mapping_complete {
                Some(ConfirmVideoError::MappingIncomplete {
                    missing_character_names: readiness.render.missing_character_names,
                })
            } else if readiness.render.image_binding_missing {
                Some(ConfirmVideoError::MissingImage)
            } else if !readiness.video_ready {
                Some(ConfirmVideoError::MissingVideo)
            } else {
                None
            }
        };
        if let Some(err) = failure {
            warn!(node_id = %node_id, reason = err.reason(), "video confirmation blocked");
            self.notify(Notice::ConfirmBlocked {
                node_id: node_id.clone(),
                reason: err.reason().to_string(),
            });
            return Err(err);
        }

        self.checkpoint();
        let now = chrono::Utc::now().timestamp_millis();
        if let Ok(workflow) = self.workflow_mut() {
            if let Some(node) = workflow.node_mut(node_id) {
                node.step4.confirmed = true;
                node.step4.status = StepStatus::Done;
            }
            workflow.ui.event_flow_pulse_node_id = Some(node_id.clone());
            workflow.ui.event_flow_pulse_at = Some(now);
        }
        self.advance_selection(node_id);
        if let Ok(workflow) = self.workflow_mut() {
            workflow.active_step = StepKey::Step2;
        }
        info!(node_id = %node_id, "node video confirmed");
        Ok(())
    }

    /// Picks the next node to work on after `current`: the first later unlocked
    /// node still awaiting confirmation, else the first later unlocked node,
    /// else `current` itself.
    fn advance_selection(&mut self, current: &NodeId) {
        let Some(workflow) = self.workflow() else {
            return;
        };
        let Some(current_order) = workflow.node(current).map(|node| node.order) else {
            return;
        };
        let mut later: Vec<_> = workflow
            .nodes
            .iter()
            .filter(|node| node.order > current_order && !node.locked)
            .collect();
        later.sort_by_key(|node| node.order);
        let next = later
            .iter()
            .find(|node| !node.step4.confirmed)
            .or_else(|| later.first())
            .map(|node| node.id.clone())
            .unwrap_or_else(|| current.clone());
        self.select_story_node(&next);
    }

    /// Step4 is refused while the selected unlocked node has unmapped characters.
    pub fn set_active_step(&mut self, step: StepKey) -> bool {
        if step == StepKey::Step4 {
            if let Some(node) = self.workflow().and_then(|workflow| workflow.selected_node()) {
                let missing = collect_step3_missing_character_names(node, &self.data);
                if !node.locked && !missing.is_empty() {
                    let node_id = node.id.clone();
                    warn!(node_id = %node_id, "step4 refused: mapping incomplete");
                    self.notify(Notice::MappingIncomplete {
                        node_id,
                        missing_character_names: missing,
                    });
                    return false;
                }
            }
        }
        match self.workflow_mut() {
            Ok(workflow) => {
                workflow.active_step = step;
                true
            }
            Err(_) => false,
        }
    }

    fn workflow_node_mut(&mut self, node_id: &NodeId) -> Option<&mut StoryNode> {
        self.data.story_workflow.as_mut()?.node_mut(node_id)
    }
}
