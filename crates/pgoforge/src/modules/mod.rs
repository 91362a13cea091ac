use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod core;
pub mod kernel;
pub mod overlay;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(kernel::KernelModule),
        Box::new(overlay::OverlayModule),
    ]
}

/// Plans every detected module.
pub fn plan_for(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    Ok(plan)
}
