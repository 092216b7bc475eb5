use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::{RegressionFile, SuiteName};
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Execution order for `root`: every transitive dependency before its dependents,
/// each suite exactly once, `root` last. Dependencies are visited in declaration
/// order, so the result is deterministic.
pub fn resolve(registry: &Registry, root: &SuiteName) -> Result<Vec<SuiteName>> {
    let file = registry
        .lookup(root)
        .ok_or_else(|| Error::UnknownSuite(root.to_string()))?;
    let mut walk = Walk::default();
    walk.visit(registry, file)?;
    Ok(walk.order)
}

/// All suites `root` transitively depends on, excluding `root` itself.
pub fn dependency_closure(registry: &Registry, root: &SuiteName) -> Result<HashSet<SuiteName>> {
    let mut order = resolve(registry, root)?;
    order.pop();
    Ok(order.into_iter().collect())
}

#[derive(Default)]
struct Walk {
    order: Vec<SuiteName>,
    done: HashSet<SuiteName>,
}

impl Walk {
    fn visit(&mut self, registry: &Registry, root: Arc<RegressionFile>) -> Result<()> {
        if self.done.contains(&root.name) {
            return Ok(());
        }

        let mut on_stack: HashSet<SuiteName> = HashSet::new();
        on_stack.insert(root.name.clone());
        let mut stack: Vec<(Arc<RegressionFile>, usize)> = vec![(root, 0)];

        loop {
            let next = match stack.last_mut() {
                None => break,
                Some((file, idx)) if *idx < file.depends_on.len() => {
                    let dep = file.depends_on[*idx].clone();
                    *idx += 1;
                    Some((file.name.clone(), dep))
                }
                Some(_) => None,
            };

            match next {
                Some((parent, dep)) => {
                    if self.done.contains(&dep) {
                        continue;
                    }
                    if on_stack.contains(&dep) {
                        return Err(cycle_error(&stack, dep));
                    }
                    let file = registry.lookup(&dep).ok_or_else(|| Error::UnknownDependency {
                        suite: parent,
                        dependency: dep.clone(),
                    })?;
                    on_stack.insert(dep);
                    stack.push((file, 0));
                }
                None => {
                    if let Some((file, _)) = stack.pop() {
                        on_stack.remove(&file.name);
                        self.done.insert(file.name.clone());
                        self.order.push(file.name.clone());
                    }
                }
            }
        }

        Ok(())
    }
}

fn cycle_error(stack: &[(Arc<RegressionFile>, usize)], repeated: SuiteName) -> Error {
    let start = stack
        .iter()
        .position(|(file, _)| file.name == repeated)
        .unwrap_or(0);
    let mut path: Vec<SuiteName> = stack[start..]
        .iter()
        .map(|(file, _)| file.name.clone())
        .collect();
    path.push(repeated);
    Error::CyclicDependency { path }
}
