use tracing::{debug, info};

use crate::model::EditorData;
use crate::readiness::required_character_ids;
use crate::workflow::{StepStatus, StoryNode, StoryWorkflow};

/// Recomputes every node's `locked` flag from the branch policy.
pub fn apply_lock_policy(workflow: &mut StoryWorkflow) {
    let policy = workflow.branch_policy.clone();
    for node in &mut workflow.nodes {
        node.locked = policy.locks(node.order);
    }
}

/// Length of the contiguous run of persisted nodes at the head of the story.
pub fn infer_branch_boundary_order(nodes: &[StoryNode]) -> u32 {
    let mut ordered: Vec<&StoryNode> = nodes.iter().collect();
    ordered.sort_by_key(|node| node.order);
    let mut boundary = 0;
    for node in ordered {
        if !node.is_persisted() {
            break;
        }
        boundary = node.order + 1;
    }
    boundary
}

/// Moves (or clears) the boundary and marks it as configured.
pub fn set_branch_boundary(workflow: &mut StoryWorkflow, boundary: Option<u32>) {
    workflow.branch_policy.lock_boundary_order = boundary;
    workflow.branch_policy.boundary_configured = true;
    apply_lock_policy(workflow);
    info!(
        branch = %workflow.branch_policy.branch_name,
        boundary = ?boundary,
        "branch boundary set"
    );
}

/// Invalidates the editable tail. Locked nodes are left untouched; step3 status
/// is re-derived from the mapping that survives the reset.
pub fn rewrite_unlocked_nodes(workflow: &mut StoryWorkflow, data: &EditorData) -> usize {
    let mut rewritten = 0;
    for node in workflow.nodes.iter_mut().filter(|node| !node.locked) {
        node.step2.status = StepStatus::Todo;
        node.step4.status = StepStatus::Todo;
        node.step4.confirmed = false;
        node.step4.video_asset_id = None;
        node.step4.video_task_id = None;
        node.step3.status = StepStatus::Todo;
        let required = required_character_ids(node, data);
        node.step3.status = node.step3.derived_status(&required);
        rewritten += 1;
    }
    debug!(rewritten, "unlocked nodes rewritten");
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AssetId, NodeId};
    use crate::workflow::{MappingStep, OutlineStep, RenderStep, DEFAULT_MAIN_BRANCH};

    fn node(order: u32) -> StoryNode {
        StoryNode {
            id: NodeId::from(format!("n{order}")),
            order,
            title: String::new(),
            scene_id: None,
            beat_ids: vec![],
            locked: false,
            step2: OutlineStep::default(),
            step3: MappingStep::default(),
            step4: RenderStep::default(),
        }
    }

    fn workflow(count: u32) -> StoryWorkflow {
        let mut workflow = StoryWorkflow::empty("main", DEFAULT_MAIN_BRANCH);
        workflow.nodes = (0..count).map(node).collect();
        workflow
    }

    #[test]
    fn boundary_flips_only_crossing_nodes() {
        let mut workflow = workflow(4);
        set_branch_boundary(&mut workflow, Some(1));
        let before: Vec<bool> = workflow.nodes.iter().map(|n| n.locked).collect();
        assert_eq!(before, vec![true, false, false, false]);

        set_branch_boundary(&mut workflow, Some(3));
        let after: Vec<bool> = workflow.nodes.iter().map(|n| n.locked).collect();
        assert_eq!(after, vec![true, true, true, false]);
        assert!(workflow.branch_policy.boundary_configured);

        set_branch_boundary(&mut workflow, None);
        assert!(workflow.nodes.iter().all(|n| !n.locked));
    }

    #[test]
    fn infers_persisted_prefix() {
        let mut nodes: Vec<StoryNode> = (0..3).map(node).collect();
        nodes[0].step4.confirmed = true;
        nodes[1].step4.status = StepStatus::Done;
        nodes[1].step4.video_asset_id = Some(AssetId::from("v"));
        assert_eq!(infer_branch_boundary_order(&nodes), 2);

        nodes[0].step4.confirmed = false;
        nodes[0].step2.status = StepStatus::InProgress;
        assert_eq!(infer_branch_boundary_order(&nodes), 0);
        assert_eq!(infer_branch_boundary_order(&[]), 0);
    }

    #[test]
    fn rewrite_skips_locked_prefix() {
        let mut workflow = workflow(2);
        for node in &mut workflow.nodes {
            node.step2.status = StepStatus::Done;
            node.step4.status = StepStatus::Done;
            node.step4.confirmed = true;
            node.step4.video_asset_id = Some(AssetId::from("v"));
        }
        set_branch_boundary(&mut workflow, Some(1));
        let locked_before = workflow.nodes[0].clone();

        let rewritten = rewrite_unlocked_nodes(&mut workflow, &EditorData::default());
        assert_eq!(rewritten, 1);
        assert_eq!(workflow.nodes[0], locked_before);
        let tail = &workflow.nodes[1];
        assert_eq!(tail.step2.status, StepStatus::Todo);
        assert_eq!(tail.step4.status, StepStatus::Todo);
        assert!(!tail.step4.confirmed);
        assert!(tail.step4.video_asset_id.is_none());
    }
}
