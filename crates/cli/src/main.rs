use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use project::{read_document, write_document, WorkspaceDb, WorkspaceDocument};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use story_workflow::storyboard::StoryboardScene;
use story_workflow::{
    AssetId, BindingPatch, CharacterId, EditorOptions, NodeId, Notice, RenderProvider,
    Step2Patch, Step4Patch, StepKey, StoryEditor, StoryNode,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "story-cli")]
#[command(about = "Story workflow CLI - headless node editing over a workspace document")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Branch whose workspace is edited
    #[arg(short, long, global = true, default_value = "main")]
    branch: String,

    /// Directory holding workspace.db (defaults to the app data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Project id inside the database
    #[arg(short, long, global = true, default_value = "default")]
    project: String,

    /// Work on a workspace JSON file instead of the database
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build scenes, beats and nodes from a storyboard JSON array
    Init {
        storyboard: PathBuf,

        /// Total duration in seconds, split across rows
        #[arg(long, default_value = "60")]
        duration: f64,

        /// Append after the existing scenes instead of replacing them
        #[arg(long)]
        append: bool,
    },

    /// Show node progress, or one node's readiness
    Status {
        /// Node id or order
        node: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Focus a node
    Select { node: String },

    /// Edit a node's outline (step2)
    Outline {
        node: String,

        #[arg(long)]
        summary: Option<String>,

        #[arg(long)]
        background: Option<String>,

        /// todo, in_progress or done
        #[arg(long)]
        status: Option<String>,

        /// strict_screenplay, stage_play, dance_drama or narrative
        #[arg(long)]
        script_mode: Option<String>,
    },

    /// Map a character to a reference image asset (step3); omit --asset to unmap
    Map {
        node: String,
        character: String,

        #[arg(long)]
        asset: Option<String>,
    },

    /// Bind an image asset to a step4 slot; omit --asset to clear
    Bind {
        node: String,

        #[arg(value_enum)]
        slot: BindSlot,

        #[arg(long)]
        asset: Option<String>,
    },

    /// Edit a node's render settings (step4)
    Render {
        node: String,

        /// segment or comfyui
        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        template: Option<String>,

        /// Render parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
    },

    /// Confirm a node's character mapping
    ConfirmStep3 { node: String },

    /// Confirm a node's rendered video
    ConfirmVideo { node: String },

    /// Move the lock boundary
    SetBoundary {
        /// Nodes before this order become read-only
        order: Option<u32>,

        /// Remove the boundary
        #[arg(long, conflicts_with = "order")]
        clear: bool,

        /// Pin the boundary at the persisted prefix
        #[arg(long, conflicts_with_all = ["order", "clear"])]
        infer: bool,

        /// Reset the editable tail afterwards
        #[arg(long)]
        rewrite: bool,
    },

    /// Reset progress on every unlocked node
    RewriteTail,

    /// Switch the active step (step1..step4)
    Step { step: String },

    /// Export the workspace document to a JSON file
    Save { output: PathBuf },

    /// Import a workspace document JSON file
    Load { input: PathBuf },

    /// List stored branches of the project
    Branches,
}

#[derive(Clone, Copy, ValueEnum)]
enum BindSlot {
    Background,
    Start,
    End,
}

/// Where the workspace document lives.
enum Store {
    File(PathBuf),
    Db { db: WorkspaceDb, project_id: String },
}

impl Store {
    fn open(cli: &Cli) -> Result<Self> {
        if let Some(path) = &cli.file {
            return Ok(Self::File(path.clone()));
        }
        let dir = cli.data_dir.clone().unwrap_or_else(project::app_data_dir);
        let db = WorkspaceDb::open_or_create(&dir.join("workspace.db"))?;
        Ok(Self::Db {
            db,
            project_id: cli.project.clone(),
        })
    }

    fn load(&self, branch: &str) -> Result<WorkspaceDocument> {
        match self {
            Self::File(path) if path.exists() => read_document(path),
            Self::File(_) => Ok(WorkspaceDocument::default()),
            Self::Db { db, project_id } => Ok(db.load_workspace(project_id, branch)?.unwrap_or_default()),
        }
    }

    fn open_editor(&self, branch: &str) -> Result<StoryEditor> {
        Ok(self.load(branch)?.into_editor(branch, EditorOptions::default()))
    }

    fn save(&self, editor: &StoryEditor) -> Result<()> {
        let doc = WorkspaceDocument::from_editor(editor);
        match self {
            Self::File(path) => write_document(path, &doc),
            Self::Db { db, project_id } => db.save_workspace(project_id, editor.branch_name(), &doc),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let store = Store::open(&cli)?;
    run(&store, &cli.branch, cli.command)
}

fn run(store: &Store, branch: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Save { output } => {
            write_document(&output, &store.load(branch)?)?;
            info!("workspace exported to {:?}", output);
        }
        Commands::Load { input } => {
            let editor = read_document(&input)?.into_editor(branch, EditorOptions::default());
            store.save(&editor)?;
            info!("workspace imported from {:?}", input);
        }
        Commands::Branches => {
            let Store::Db { db, project_id } = store else {
                bail!("branches are only tracked in the database store");
            };
            for branch in db.list_branches(project_id)? {
                println!("{}\t{}", branch.branch_name, branch.updated_at);
            }
        }
        command => {
            let mut editor = store.open_editor(branch)?;
            let outcome = edit(&mut editor, command);
            report_notices(&mut editor);
            if outcome? {
                store.save(&editor)?;
            }
        }
    }
    Ok(())
}

/// Runs one engine command. Returns whether the document should be written back.
fn edit(editor: &mut StoryEditor, command: Commands) -> Result<bool> {
    match command {
        Commands::Init {
            storyboard,
            duration,
            append,
        } => {
            let rows = read_storyboard(&storyboard)?;
            if append {
                editor.append_storyboard(&rows, duration);
            } else {
                editor.initialize_from_storyboard(&rows, duration);
            }
            print_overview(editor);
            Ok(true)
        }
        Commands::Status { node, json } => {
            match node {
                Some(node) => print_node_status(editor, &resolve_node(editor, &node)?, json)?,
                None if json => print_json(&editor.workflow())?,
                None => print_overview(editor),
            }
            Ok(false)
        }
        Commands::Select { node } => {
            let node_id = resolve_node(editor, &node)?;
            editor.select_story_node(&node_id);
            Ok(true)
        }
        Commands::Outline {
            node,
            summary,
            background,
            status,
            script_mode,
        } => {
            let node_id = resolve_node(editor, &node)?;
            let patch = Step2Patch {
                summary,
                background,
                status: status.as_deref().map(parse_enum).transpose()?,
                script_mode: script_mode.as_deref().map(parse_enum).transpose()?,
                ..Default::default()
            };
            Ok(editor.update_node_step2(&node_id, patch))
        }
        Commands::Map {
            node,
            character,
            asset,
        } => {
            let node_id = resolve_node(editor, &node)?;
            let mut mapping = editor
                .node(&node_id)
                .map(|node| node.step3.character_asset_map.clone())
                .unwrap_or_default();
            mapping.insert(CharacterId::from(character), asset.map(AssetId::from));
            let updated = editor.update_node_step3_mapping(&node_id, mapping);
            if let Some(summary) = editor.step3_mapping_summary(&node_id) {
                println!("mapped {}/{}", summary.mapped, summary.total);
            }
            Ok(updated)
        }
        Commands::Bind { node, slot, asset } => {
            let node_id = resolve_node(editor, &node)?;
            let value = Some(asset.map(AssetId::from));
            let patch = match slot {
                BindSlot::Background => BindingPatch {
                    background_asset_id: value,
                    ..Default::default()
                },
                BindSlot::Start => BindingPatch {
                    start_image_asset_id: value,
                    ..Default::default()
                },
                BindSlot::End => BindingPatch {
                    end_image_asset_id: value,
                    ..Default::default()
                },
            };
            Ok(editor.update_node_step4_binding(&node_id, patch))
        }
        Commands::Render {
            node,
            provider,
            template,
            params,
        } => {
            let node_id = resolve_node(editor, &node)?;
            if let Some(raw) = params.as_deref() {
                story_workflow::params::parse_params_object(raw)?;
            }
            let patch = Step4Patch {
                provider: provider
                    .as_deref()
                    .map(parse_enum::<RenderProvider>)
                    .transpose()?,
                comfyui_template_id: template,
                comfyui_params_json: params,
                ..Default::default()
            };
            Ok(editor.update_node_step4(&node_id, patch))
        }
        Commands::ConfirmStep3 { node } => {
            let node_id = resolve_node(editor, &node)?;
            match editor.confirm_node_step3(&node_id) {
                Ok(()) => {
                    println!("step3 confirmed for {node_id}");
                    Ok(true)
                }
                // the gate itself records the step back in progress
                Err(e) if !e.missing().is_empty() => {
                    println!("{}: {}", e.reason(), e.missing().join(", "));
                    Ok(true)
                }
                Err(e) => Err(anyhow!(e)),
            }
        }
        Commands::ConfirmVideo { node } => {
            let node_id = resolve_node(editor, &node)?;
            editor
                .confirm_node_video(&node_id)
                .map_err(|e| anyhow!("{} ({})", e, e.reason()))?;
            let next = editor
                .workflow()
                .and_then(|workflow| workflow.selected_node_id.clone());
            match next {
                Some(next) if next != node_id => println!("confirmed {node_id}; next {next}"),
                _ => println!("confirmed {node_id}"),
            }
            Ok(true)
        }
        Commands::SetBoundary {
            order,
            clear,
            infer,
            rewrite,
        } => {
            if infer {
                let boundary = editor.prepare_for_moved_boundary();
                println!("boundary pinned at {boundary}");
            } else if clear || order.is_some() {
                editor.set_branch_boundary(order);
            } else {
                bail!("give an order, --clear or --infer");
            }
            if rewrite {
                let rewritten = editor.rewrite_unlocked_nodes_from_boundary();
                println!("rewrote {rewritten} nodes");
            }
            Ok(true)
        }
        Commands::RewriteTail => {
            let rewritten = editor.rewrite_unlocked_nodes_from_boundary();
            println!("rewrote {rewritten} nodes");
            Ok(rewritten > 0)
        }
        Commands::Step { step } => Ok(editor.set_active_step(parse_enum::<StepKey>(&step)?)),
        Commands::Save { .. } | Commands::Load { .. } | Commands::Branches => Ok(false),
    }
}

fn read_storyboard(path: &Path) -> Result<Vec<StoryboardScene>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("read storyboard {}", path.display()))?;
    serde_json::from_str(&json).context("parse storyboard")
}

/// Accepts a node id or the node's zero-based order.
fn resolve_node(editor: &StoryEditor, needle: &str) -> Result<NodeId> {
    let workflow = editor
        .workflow()
        .ok_or_else(|| anyhow!("no story workflow; run init first"))?;
    if let Some(node) = workflow.nodes.iter().find(|node| node.id.as_str() == needle) {
        return Ok(node.id.clone());
    }
    if let Ok(order) = needle.parse::<u32>() {
        if let Some(node) = workflow.nodes.iter().find(|node| node.order == order) {
            return Ok(node.id.clone());
        }
    }
    bail!("node not found: {needle}")
}

/// Parses a snake_case enum value the way documents spell it.
fn parse_enum<T: DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("invalid value '{value}'"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn step_cell(node: &StoryNode) -> String {
    format!(
        "{:?}/{:?}/{:?}{}",
        node.step2.status,
        node.step3.status,
        node.step4.status,
        if node.step4.confirmed { " confirmed" } else { "" }
    )
}

fn print_overview(editor: &StoryEditor) {
    let Some(workflow) = editor.workflow() else {
        println!("no story workflow");
        return;
    };
    println!(
        "branch {} | active {:?} | boundary {:?}",
        workflow.branch_policy.branch_name,
        workflow.active_step,
        workflow.branch_policy.lock_boundary_order
    );
    for node in &workflow.nodes {
        let marker = if workflow.selected_node_id.as_ref() == Some(&node.id) {
            '>'
        } else {
            ' '
        };
        let action = editor
            .recommended_action(&node.id)
            .map(|rec| format!("{:?}", rec.action))
            .unwrap_or_default();
        println!(
            "{marker}{:>3} {}{} {} [{}] {}",
            node.order,
            node.id,
            if node.locked { " (locked)" } else { "" },
            node.title,
            step_cell(node),
            action
        );
    }
}

fn print_node_status(editor: &StoryEditor, node_id: &NodeId, json: bool) -> Result<()> {
    let node = editor
        .node(node_id)
        .ok_or_else(|| anyhow!("node not found: {node_id}"))?;
    let mapping = editor.step3_mapping_summary(node_id);
    let readiness = editor.step4_confirm_readiness(node_id);
    let recommendation = editor.recommended_action(node_id);
    if json {
        return print_json(&serde_json::json!({
            "node": node,
            "step3": mapping,
            "step4": readiness,
            "recommendation": recommendation,
        }));
    }
    println!("{} {} [{}]", node.id, node.title, step_cell(node));
    if let Some(mapping) = mapping {
        println!(
            "  mapping {}/{}{}",
            mapping.mapped,
            mapping.total,
            if mapping.complete { "" } else { " (incomplete)" }
        );
    }
    if let Some(readiness) = readiness {
        println!(
            "  image {:?} | video {:?} | params valid {}",
            readiness.render.primary_image_asset_id, readiness.video_asset_id, readiness.params_valid
        );
        if !readiness.block_reasons.is_empty() {
            println!("  blocked by {:?}", readiness.block_reasons);
        }
    }
    if let Some(rec) = recommendation {
        println!("  next: {:?} ({:?})", rec.action, rec.target_step);
    }
    Ok(())
}

fn report_notices(editor: &mut StoryEditor) {
    for notice in editor.take_notices() {
        match notice {
            Notice::NodeLocked { node_id } => warn!("node {node_id} is locked and read-only"),
            Notice::MappingIncomplete {
                node_id,
                missing_character_names,
            } => warn!(
                "node {node_id} is missing mappings for: {}",
                missing_character_names.join(", ")
            ),
            Notice::ConfirmBlocked { node_id, reason } => {
                warn!("node {node_id} cannot be confirmed: {reason}")
            }
        }
    }
}
