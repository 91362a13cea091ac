use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing `?` makes the dependency optional.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Resolves a dependency to a task id; `None` for a missing optional one.
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        task: &str,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (name, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        if let Some((id, _)) = self.tasks.get_key_value(name) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(name) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::msg(format!(
            "task '{task}' has invalid dependency '{dep}': unknown task or token"
        )))
    }

    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                if let Some(dep_id) = self.resolve_dep(&provides, id, dep)? {
                    out.push((dep_id, id.as_str()));
                }
            }
        }
        Ok(out)
    }

    /// Topological order; ties break by task id so the order is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (from, to) in self.edges()? {
            if outgoing.entry(from).or_default().insert(to)
                && let Some(n) = incoming.get_mut(to)
            {
                *n += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, to) in self.edges()? {
            out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "m".into(),
            phase: "p".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(plan: &Plan) -> Vec<String> {
        plan.ordered()
            .expect("ordered")
            .into_iter()
            .map(|t| t.id.clone())
            .collect()
    }

    #[test]
    fn tokens_and_optional_deps_resolve() {
        let mut plan = Plan::default();
        plan.add(task("z.build", &["a.check", "overlay:written?"], &[]))
            .expect("add");
        plan.add(task("a.check", &[], &["checked"])).expect("add");
        plan.add(task("m.after", &["checked"], &[])).expect("add");
        assert_eq!(ids(&plan), ["a.check", "m.after", "z.build"]);

        plan.add(task("o.write", &[], &["overlay:written"])).expect("add");
        plan.add(task("b.first", &[], &[])).expect("add");
        let order = ids(&plan);
        let pos = |id: &str| order.iter().position(|t| t == id).expect("present");
        assert!(pos("o.write") < pos("z.build"));
    }

    #[test]
    fn unknown_required_dep_and_cycles_fail() {
        let mut plan = Plan::default();
        plan.add(task("a", &["missing"], &[])).expect("add");
        assert!(plan.ordered().is_err());

        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).expect("add");
        plan.add(task("b", &["a"], &[])).expect("add");
        let err = plan.ordered().expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn duplicate_tokens_are_rejected() {
        let mut plan = Plan::default();
        plan.add(task("a", &[], &["t"])).expect("add");
        plan.add(task("b", &[], &["t"])).expect("add");
        assert!(plan.to_dot().is_err());
        assert!(plan.add(task("a", &[], &[])).is_err());
    }
}
