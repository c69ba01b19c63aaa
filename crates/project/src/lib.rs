use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use story_workflow::{EditorOptions, StoryEditor};
use tracing::{debug, info};

mod document;
pub use document::*;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("story_workflow")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("workspace.db")
}

pub struct WorkspaceDb {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchInfo {
    pub branch_name: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub updated_at: i64,
}

impl WorkspaceDb {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open workspace db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_project(&self, id: &str, name: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT OR IGNORE INTO projects(id, name, created_at, updated_at) VALUES(?1, ?2, ?3, ?3)",
            params![id, name, now],
        )?;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, updated_at FROM projects ORDER BY updated_at DESC, id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ProjectInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stores the branch document, creating the project row on first save.
    pub fn save_workspace(
        &self,
        project_id: &str,
        branch_name: &str,
        doc: &WorkspaceDocument,
    ) -> Result<()> {
        let json = doc.to_json()?;
        let now = chrono::Utc::now().timestamp();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO projects(id, name, created_at, updated_at) VALUES(?1, ?1, ?2, ?2)",
            params![project_id, now],
        )?;
        tx.execute(
            "INSERT INTO workspaces(project_id, branch_name, json, updated_at) VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(project_id, branch_name) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
            params![project_id, branch_name, json, now],
        )?;
        tx.execute(
            "UPDATE projects SET updated_at = ?2 WHERE id = ?1",
            params![project_id, now],
        )?;
        tx.commit()?;
        debug!(project_id, branch = branch_name, bytes = json.len(), "workspace saved");
        Ok(())
    }

    pub fn load_workspace(
        &self,
        project_id: &str,
        branch_name: &str,
    ) -> Result<Option<WorkspaceDocument>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT json FROM workspaces WHERE project_id = ?1 AND branch_name = ?2 LIMIT 1",
                params![project_id, branch_name],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| {
            WorkspaceDocument::from_json(&json)
                .with_context(|| format!("workspace {project_id}/{branch_name}"))
        })
        .transpose()
    }

    pub fn list_branches(&self, project_id: &str) -> Result<Vec<BranchInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT branch_name, updated_at FROM workspaces WHERE project_id = ?1 ORDER BY branch_name",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok(BranchInfo {
                branch_name: row.get(0)?,
                updated_at: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Returns whether a document was removed.
    pub fn delete_workspace(&self, project_id: &str, branch_name: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM workspaces WHERE project_id = ?1 AND branch_name = ?2",
            params![project_id, branch_name],
        )?;
        Ok(removed > 0)
    }

    /// Opens the branch as an editing session. A branch with no stored
    /// document starts empty.
    pub fn open_session(
        &self,
        project_id: &str,
        branch_name: &str,
        options: EditorOptions,
    ) -> Result<StoryEditor> {
        let doc = self.load_workspace(project_id, branch_name)?;
        let found = doc.is_some();
        let editor = doc.unwrap_or_default().into_editor(branch_name, options);
        info!(
            project_id,
            branch = branch_name,
            found,
            nodes = editor.workflow().map(|workflow| workflow.nodes.len()).unwrap_or(0),
            "workspace session opened"
        );
        Ok(editor)
    }

    pub fn save_session(&self, project_id: &str, editor: &StoryEditor) -> Result<()> {
        self.save_workspace(
            project_id,
            editor.branch_name(),
            &WorkspaceDocument::from_editor(editor),
        )
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__init.sql"))
        .context("apply V0001__init")?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__init"],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use story_workflow::storyboard::StoryboardScene;

    fn open() -> (tempfile::TempDir, WorkspaceDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = WorkspaceDb::open_or_create(&dir.path().join("db").join("ws.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn migrations_are_recorded_once() {
        let (dir, db) = open();
        drop(db);
        let db = WorkspaceDb::open_or_create(&dir.path().join("db").join("ws.db")).unwrap();
        let count: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn save_overwrites_per_branch() {
        let (_dir, db) = open();
        let mut doc = WorkspaceDocument::default();
        db.save_workspace("p1", "main", &doc).unwrap();
        doc.editor_state.scene_order.push("scene_a".into());
        db.save_workspace("p1", "main", &doc).unwrap();
        db.save_workspace("p1", "draft", &WorkspaceDocument::default()).unwrap();

        let loaded = db.load_workspace("p1", "main").unwrap().unwrap();
        assert_eq!(loaded.editor_state.scene_order.len(), 1);
        let branches: Vec<_> = db
            .list_branches("p1")
            .unwrap()
            .into_iter()
            .map(|branch| branch.branch_name)
            .collect();
        assert_eq!(branches, vec!["draft".to_string(), "main".to_string()]);
        assert_eq!(db.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn delete_and_missing_branches() {
        let (_dir, db) = open();
        assert!(db.load_workspace("p1", "main").unwrap().is_none());
        db.save_workspace("p1", "main", &WorkspaceDocument::default()).unwrap();
        assert!(db.delete_workspace("p1", "main").unwrap());
        assert!(!db.delete_workspace("p1", "main").unwrap());
        assert!(db.load_workspace("p1", "main").unwrap().is_none());
    }

    #[test]
    fn corrupt_document_is_an_error() {
        let (_dir, db) = open();
        db.ensure_project("p1", "Project").unwrap();
        db.connection()
            .execute(
                "INSERT INTO workspaces(project_id, branch_name, json, updated_at) VALUES('p1', 'main', '{', 0)",
                [],
            )
            .unwrap();
        assert!(db.load_workspace("p1", "main").is_err());
    }

    #[test]
    fn session_round_trip_keeps_progress() {
        let (_dir, db) = open();
        let mut editor = db.open_session("p1", "main", EditorOptions::default()).unwrap();
        assert!(editor.workflow().unwrap().nodes.is_empty());
        editor.initialize_from_storyboard(
            &[StoryboardScene {
                scene_number: Some(1),
                narration: Some("opening".into()),
                visual_description: None,
            }],
            5.0,
        );
        let node_id = editor.workflow().unwrap().nodes[0].id.clone();
        db.save_session("p1", &editor).unwrap();

        let reopened = db.open_session("p1", "main", EditorOptions::default()).unwrap();
        let workflow = reopened.workflow().unwrap();
        assert_eq!(workflow.nodes[0].id, node_id);
        assert_eq!(workflow.nodes[0].step2.summary, "opening");
    }
}
