use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;
use story_workflow::{
    AssetsImageFilter, EditorData, EditorOptions, NodeId, Selection, StepKey, StoryEditor,
};

/// The per-branch document as stored: the editor state plus the user's view
/// preferences, which are kept apart so they survive a rebuilt workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDocument {
    #[serde(default)]
    pub editor_state: EditorData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_ui: Option<EditorUi>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EditorUi {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_workflow: Option<WorkflowUiPrefs>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowUiPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_step: Option<StepKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step4_auto_fill_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_image_filter: Option<AssetsImageFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_prefer_card: Option<bool>,
}

impl WorkspaceDocument {
    pub fn from_editor(editor: &StoryEditor) -> Self {
        let prefs = editor.workflow().map(|workflow| WorkflowUiPrefs {
            active_step: Some(workflow.active_step),
            selected_node_id: workflow.selected_node_id.clone(),
            step4_auto_fill_enabled: Some(workflow.ui.step4_auto_fill_enabled),
            assets_image_filter: Some(workflow.ui.assets_image_filter),
            preview_prefer_card: Some(workflow.ui.preview_prefer_card),
        });
        Self {
            editor_state: editor.data().clone(),
            editor_ui: Some(EditorUi {
                selection: Some(editor.selection().clone()),
                story_workflow: prefs,
            }),
        }
    }

    /// Opens an editing session. Stored preferences are laid over the
    /// document's workflow first; the session then reconciles the workflow
    /// against the loaded graph. The active step goes through the editor's
    /// guard last, and a refused step4 lands on step3.
    pub fn into_editor(self, branch_name: &str, options: EditorOptions) -> StoryEditor {
        let mut data = self.editor_state;
        let ui = self.editor_ui.unwrap_or_default();
        let mut active_step = None;
        if let (Some(workflow), Some(prefs)) = (data.story_workflow.as_mut(), ui.story_workflow) {
            active_step = prefs.active_step;
            if prefs.selected_node_id.is_some() {
                workflow.selected_node_id = prefs.selected_node_id;
            }
            if let Some(enabled) = prefs.step4_auto_fill_enabled {
                workflow.ui.step4_auto_fill_enabled = enabled;
            }
            if let Some(filter) = prefs.assets_image_filter {
                workflow.ui.assets_image_filter = filter;
            }
            if let Some(prefer_card) = prefs.preview_prefer_card {
                workflow.ui.preview_prefer_card = prefer_card;
            }
        }
        let mut editor =
            StoryEditor::from_data(data, ui.selection.unwrap_or_default(), branch_name, options);
        let step = active_step.or_else(|| editor.workflow().map(|workflow| workflow.active_step));
        if let Some(step) = step {
            if !editor.set_active_step(step) {
                debug!(?step, "stored active step refused");
                editor.set_active_step(StepKey::Step3);
            }
        }
        editor
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("parse workspace document")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize workspace document")
    }
}

pub fn read_document(path: &Path) -> Result<WorkspaceDocument> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("read workspace document {}", path.display()))?;
    WorkspaceDocument::from_json(&json)
}

pub fn write_document(path: &Path, doc: &WorkspaceDocument) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(doc).context("serialize workspace document")?;
    fs::write(path, json).with_context(|| format!("write workspace document {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use story_workflow::storyboard::StoryboardScene;
    use story_workflow::{Character, CharacterId, Notice};

    fn editor() -> StoryEditor {
        let mut editor = StoryEditor::new("main", EditorOptions::default());
        let rows: Vec<_> = (0..3)
            .map(|idx| StoryboardScene {
                scene_number: Some(1),
                narration: Some(format!("beat {idx}")),
                visual_description: None,
            })
            .collect();
        editor.initialize_from_storyboard(&rows, 9.0);
        editor
    }

    #[test]
    fn ui_prefs_override_stored_workflow() {
        let editor = editor();
        let third = editor.workflow().unwrap().nodes[2].id.clone();
        let mut doc = WorkspaceDocument::from_editor(&editor);
        doc.editor_ui = Some(EditorUi {
            selection: None,
            story_workflow: Some(WorkflowUiPrefs {
                active_step: Some(StepKey::Step3),
                selected_node_id: Some(third.clone()),
                preview_prefer_card: Some(true),
                ..Default::default()
            }),
        });

        let reopened = doc.into_editor("main", EditorOptions::default());
        let workflow = reopened.workflow().unwrap();
        assert_eq!(workflow.active_step, StepKey::Step3);
        assert_eq!(workflow.selected_node_id, Some(third.clone()));
        assert!(workflow.ui.preview_prefer_card);
        assert_eq!(reopened.selection().selected_story_node_id, Some(third));
    }

    #[test]
    fn stored_step4_is_refused_while_mapping_is_incomplete() {
        let mut data = editor().data().clone();
        let hero = CharacterId::from("hero");
        data.characters
            .insert(hero.clone(), Character::new(hero.clone(), "Hero"));
        for beat in data.beats.values_mut() {
            beat.character_ids = vec![hero.clone()];
        }
        let editor = StoryEditor::from_data(data, Selection::default(), "main", EditorOptions::default());
        let mut doc = WorkspaceDocument::from_editor(&editor);
        doc.editor_ui = Some(EditorUi {
            selection: None,
            story_workflow: Some(WorkflowUiPrefs {
                active_step: Some(StepKey::Step4),
                ..Default::default()
            }),
        });

        let mut reopened = doc.into_editor("main", EditorOptions::default());
        assert_eq!(reopened.workflow().unwrap().active_step, StepKey::Step3);
        assert!(reopened
            .take_notices()
            .iter()
            .any(|notice| matches!(notice, Notice::MappingIncomplete { .. })));
    }

    #[test]
    fn stale_selected_node_falls_back_to_first() {
        let editor = editor();
        let first = editor.workflow().unwrap().nodes[0].id.clone();
        let mut doc = WorkspaceDocument::from_editor(&editor);
        if let Some(prefs) = doc
            .editor_ui
            .as_mut()
            .and_then(|ui| ui.story_workflow.as_mut())
        {
            prefs.selected_node_id = Some(NodeId::from("gone"));
        }
        let reopened = doc.into_editor("main", EditorOptions::default());
        assert_eq!(reopened.workflow().unwrap().selected_node_id, Some(first));
    }

    #[test]
    fn document_uses_camel_case_and_survives_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("workspace.json");
        let doc = WorkspaceDocument::from_editor(&editor());
        write_document(&path, &doc).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["editorState"]["storyWorkflow"]["nodes"].is_array());
        assert!(raw["editorUi"]["storyWorkflow"]["activeStep"].is_string());

        assert_eq!(read_document(&path).unwrap(), doc);
        assert!(read_document(&dir.path().join("missing.json")).is_err());
    }
}
