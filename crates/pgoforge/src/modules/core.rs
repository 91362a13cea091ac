use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::Module;
use crate::planner::{Plan, Task};
use crate::workspace::WorkspaceConfig;

pub const INIT_TASK_ID: &str = "core.init";

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        if !doc.has_table_path("kernel") && !doc.has_table_path("overlay") {
            return Err(Error::msg(
                "build definition has neither a [kernel] nor an [overlay] table; nothing to do",
            ));
        }

        plan.add(Task {
            id: INIT_TASK_ID.into(),
            label: "Init workspace".into(),
            module: self.id().into(),
            phase: "init".into(),
            // Host checks must pass before any directory is created.
            after: vec!["kernel.preflight?".into()],
            provides: vec!["core:initialized".into()],
        })
    }
}

pub fn exec_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();

    ctx.set_task(INIT_TASK_ID);
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.build_dir = {}", ws.build_dir));
    ctx.log(&format!("workspace.out_dir = {}", ws.out_dir));
    ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));

    if ctx.dry_run {
        let paths = crate::workspace::load_paths(&ws, &doc.base_dir())?;
        ctx.log(&format!(
            "DRY-RUN: would create {} and {}",
            paths.build_dir.display(),
            paths.out_dir.display()
        ));
        ctx.set_workspace_paths(paths);
        return Ok(());
    }

    let paths = crate::workspace::init_dirs(&ws, &doc.base_dir())?;
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!("workspace.build_dir(abs) = {}", paths.build_dir.display()));
    ctx.log(&format!("workspace.out_dir(abs) = {}", paths.out_dir.display()));
    ctx.set_workspace_paths(paths);
    Ok(())
}
