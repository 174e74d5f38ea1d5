//! Dependency resolution and load ordering
//!
//! Two passes over a batch of descriptors: a constraint check that disables
//! dependents with missing or version-mismatched dependencies, then a Kahn
//! topological sort that yields the load order and isolates cyclic subsets.
//! A failing subset never blocks the rest of the batch.

use std::collections::{BTreeMap, HashMap, VecDeque};

use semver::Version;
use tracing::warn;

use super::metadata::ScriptDescriptor;

/// Synthetic root key used to order every builtin before every non-builtin
const ROOT_KEY: &str = "_host:_builtin";

#[derive(Debug, Default)]
pub struct ResolveOutcome {
    /// Indices into the input batch, in final load order
    pub load_order: Vec<usize>,
    /// Diagnostics keyed by the offending script's key
    pub diagnostics: BTreeMap<String, Vec<String>>,
}

impl ResolveOutcome {
    pub fn report(&self) {
        for (key, msgs) in &self.diagnostics {
            warn!("script '{}' refused to load:\n{}", key, msgs.join("\n"));
        }
    }
}

/// Validate dependencies and compute the load order for a batch. Scripts
/// that fail are disabled in place with their diagnostics recorded; the
/// returned order contains only the survivors.
pub fn resolve(scripts: &mut [ScriptDescriptor]) -> ResolveOutcome {
    let mut outcome = ResolveOutcome::default();

    // Identity keys must be unique across the batch; a later duplicate is
    // disabled, the first occurrence wins.
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut duplicates: Vec<usize> = Vec::new();
    for (i, script) in scripts.iter().enumerate() {
        let key = script.key();
        if index.contains_key(&key) {
            duplicates.push(i);
        } else {
            index.insert(key, i);
        }
    }
    for &i in &duplicates {
        let key = scripts[i].key();
        let msg = format!(
            "'{}' ({}) duplicates an already discovered script key",
            key,
            scripts[i].path.display()
        );
        outcome.diagnostics.entry(key).or_default().push(msg.clone());
        scripts[i].record_errors(&[msg]);
    }

    // Pass 1: every edge must point at an existing script whose version
    // parses and satisfies the constraint. Failure disables the dependent
    // only; transitive fallout is left to the topological pass.
    let mut satisfied: Vec<usize> = Vec::new();
    for i in 0..scripts.len() {
        if duplicates.contains(&i) {
            continue;
        }
        let key = scripts[i].key();
        let mut errs: Vec<String> = Vec::new();
        for dep in &scripts[i].depends {
            let dep_key = dep.key();
            let Some(&target) = index.get(&dep_key) else {
                errs.push(format!(
                    "'{}' depends on '{}' which does not exist, required version: {}",
                    key,
                    dep_key,
                    dep.constraint_text()
                ));
                continue;
            };
            let target_version = match Version::parse(&scripts[target].version) {
                Ok(v) => v,
                Err(_) => {
                    errs.push(format!(
                        "'{}' depends on '{}' whose version '{}' is not valid semver",
                        key, dep_key, scripts[target].version
                    ));
                    continue;
                }
            };
            if let Some(req) = &dep.constraint {
                if !req.matches(&target_version) {
                    errs.push(format!(
                        "'{}' depends on '{}' version {}, found {}",
                        key, dep_key, req, target_version
                    ));
                }
            }
        }
        if errs.is_empty() {
            satisfied.push(i);
        } else {
            scripts[i].record_errors(&errs);
            outcome.diagnostics.entry(key).or_default().extend(errs);
        }
    }

    // Pass 2: Kahn's algorithm over the satisfying subset. Edges run
    // dependency -> dependent; the synthetic root depends on every builtin
    // and is depended on by every non-builtin, so no third-party script is
    // ever ordered before a builtin. Edges to scripts dropped in pass 1
    // stay in the in-degree counts, which is what strands their transitive
    // dependents below.
    let mut relations: HashMap<String, Vec<String>> = HashMap::new();
    let mut in_degrees: HashMap<String, i32> = HashMap::new();
    let mut vertices: Vec<(String, Option<usize>)> = vec![(ROOT_KEY.to_string(), None)];
    in_degrees.insert(ROOT_KEY.to_string(), 0);

    for &i in &satisfied {
        let key = scripts[i].key();
        for dep in &scripts[i].depends {
            relations.entry(dep.key()).or_default().push(key.clone());
            *in_degrees.entry(key.clone()).or_insert(0) += 1;
        }
        if scripts[i].builtin {
            relations.entry(key.clone()).or_default().push(ROOT_KEY.to_string());
            *in_degrees.entry(ROOT_KEY.to_string()).or_insert(0) += 1;
        } else {
            relations
                .entry(ROOT_KEY.to_string())
                .or_default()
                .push(key.clone());
            *in_degrees.entry(key.clone()).or_insert(0) += 1;
        }
        vertices.push((key, Some(i)));
    }

    let vertex_lookup: HashMap<String, usize> = vertices
        .iter()
        .enumerate()
        .map(|(vi, (key, _))| (key.clone(), vi))
        .collect();

    // Ties break by discovery order, keeping the result reproducible for a
    // fixed input order.
    let mut queue: VecDeque<usize> = vertices
        .iter()
        .enumerate()
        .filter(|(_, (key, _))| in_degrees.get(key).copied().unwrap_or(0) == 0)
        .map(|(vi, _)| vi)
        .collect();

    while let Some(vi) = queue.pop_front() {
        let (key, script_idx) = &vertices[vi];
        if let Some(i) = script_idx {
            outcome.load_order.push(*i);
        }
        if let Some(dependents) = relations.get(key) {
            for dep_key in dependents {
                if let Some(degree) = in_degrees.get_mut(dep_key) {
                    *degree -= 1;
                    if *degree == 0 {
                        if let Some(&dvi) = vertex_lookup.get(dep_key) {
                            queue.push_back(dvi);
                        }
                    }
                }
            }
        }
    }

    // Residual nonzero in-degree marks a dependency cycle (or a dependency
    // stranded by pass 1).
    for (key, script_idx) in &vertices {
        if in_degrees.get(key).copied().unwrap_or(0) == 0 {
            continue;
        }
        let Some(i) = script_idx else { continue };
        let deps: Vec<String> = scripts[*i].depends.iter().map(|d| d.raw.clone()).collect();
        let msg = format!(
            "'{}' is part of a dependency cycle, declared dependencies: {}",
            key,
            deps.join(", ")
        );
        scripts[*i].record_errors(std::slice::from_ref(&msg));
        outcome.diagnostics.entry(key.clone()).or_default().push(msg);
    }

    outcome
}
