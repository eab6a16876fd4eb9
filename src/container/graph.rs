use std::collections::HashMap;

use super::error::{ContainerError, ContainerResult};
use super::registry::Registration;
use super::ServiceKey;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Depth-first walk over the declared dependencies with three-coloring
/// (unvisited / in progress / done).
///
/// Returns every key ordered so that dependencies come before their
/// dependents. Reaching a node that is still in progress closes a cycle,
/// reported with its full path; an edge to an unregistered key is reported
/// as a missing dependency.
pub(crate) fn dependency_order(
    entries: &HashMap<ServiceKey, Registration>,
) -> ContainerResult<Vec<ServiceKey>> {
    let mut keys: Vec<&ServiceKey> = entries.keys().collect();
    keys.sort();

    let mut walk = Walk {
        entries,
        marks: HashMap::with_capacity(entries.len()),
        path: vec![],
        order: Vec::with_capacity(entries.len()),
    };
    for key in keys {
        walk.visit(key)?;
    }
    Ok(walk.order)
}

struct Walk<'a> {
    entries: &'a HashMap<ServiceKey, Registration>,
    marks: HashMap<&'a ServiceKey, Mark>,
    path: Vec<&'a ServiceKey>,
    order: Vec<ServiceKey>,
}

impl<'a> Walk<'a> {
    fn visit(&mut self, key: &'a ServiceKey) -> ContainerResult<()> {
        match self.marks.get(key) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = self.path.iter().position(|k| *k == key).unwrap_or(0);
                let mut cycle: Vec<ServiceKey> =
                    self.path[start..].iter().map(|k| (*k).clone()).collect();
                cycle.push(key.clone());
                return Err(ContainerError::CircularDependency { path: cycle });
            }
            None => {}
        }

        let entries = self.entries;
        let Some(registration) = entries.get(key) else {
            return Err(ContainerError::MissingService { key: key.clone() });
        };
        self.marks.insert(key, Mark::InProgress);
        self.path.push(key);
        for dependency in &registration.dependencies {
            if !entries.contains_key(dependency) {
                return Err(ContainerError::MissingDependency {
                    service: key.clone(),
                    dependency: dependency.clone(),
                });
            }
            self.visit(dependency)?;
        }
        self.path.pop();
        self.marks.insert(key, Mark::Done);
        self.order.push(key.clone());
        Ok(())
    }
}
