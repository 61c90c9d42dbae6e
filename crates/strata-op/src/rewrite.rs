//! Post-hoc graph mutation.
//!
//! Changing an op changes its digest, and with it the digest of every op that
//! depends on it. [`recompute`] performs one hop of that propagation against a
//! [`RewriteTable`] of already-rewritten digests. [`propagate`] and
//! [`Definition::rewrite`] drive it over a whole graph in dependency order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::definition::{Definition, OpMetadata};
use crate::digest::{Digest, digest};
use crate::error::OpError;
use crate::op::{Op, OpKind};

/// Stale digest to its replacement.
pub type RewriteTable = HashMap<Digest, Digest>;

#[derive(Debug, Error)]
pub enum RewriteError {
  #[error("op {digest} not found")]
  OpNotFound { digest: Digest },

  #[error("failed to re-encode op {digest}")]
  Encode {
    digest: Digest,
    #[source]
    source: OpError,
  },

  #[error("graph contains a cycle through {digest}")]
  Cycle { digest: Digest },

  #[error("rewritten definition is invalid")]
  Invalid(#[source] OpError),
}

/// Recompute the digest of `target` after its inputs may have been rewritten.
///
/// Inputs found in `table` are replaced. If the digest changes, the new op is
/// inserted, the stale entry is removed and `target` is recorded in `table`.
/// Inputs that still need rewriting must already be in `table`.
pub fn recompute(
  all_ops: &mut BTreeMap<Digest, Op>,
  table: &mut RewriteTable,
  target: &Digest,
) -> Result<Digest, RewriteError> {
  if let Some(rewritten) = table.get(target) {
    return Ok(rewritten.clone());
  }

  let op = all_ops.get(target).ok_or_else(|| RewriteError::OpNotFound {
    digest: target.clone(),
  })?;

  let mut updated = op.clone();
  for input in &mut updated.inputs {
    if let Some(rewritten) = table.get(&input.digest) {
      input.digest = rewritten.clone();
    }
  }

  replace(all_ops, table, target, updated)
}

/// Swap the op stored under `target` for `op`, recording the new digest.
///
/// Returns `target` unchanged when `op` encodes identically. The stale entry
/// is kept when an earlier rewrite already produced `target` as its
/// replacement, since dependents of that rewrite now point at it.
pub fn replace(
  all_ops: &mut BTreeMap<Digest, Op>,
  table: &mut RewriteTable,
  target: &Digest,
  op: Op,
) -> Result<Digest, RewriteError> {
  let new_digest = digest(&op).map_err(|source| RewriteError::Encode {
    digest: target.clone(),
    source,
  })?;

  if &new_digest == target {
    return Ok(new_digest);
  }

  debug!(old = %target.short(), new = %new_digest.short(), "op_rewritten");
  all_ops.insert(new_digest.clone(), op);
  if !table.values().any(|rewritten| rewritten == target) {
    all_ops.remove(target);
  }
  table.insert(target.clone(), new_digest.clone());
  Ok(new_digest)
}

/// Dependency-first order of the ops in `all_ops`.
///
/// Inputs that are not in the map are ignored. Ties break by digest so the
/// order is stable.
pub fn topological_order(all_ops: &BTreeMap<Digest, Op>) -> Result<Vec<Digest>, RewriteError> {
  let mut in_degree: BTreeMap<&Digest, usize> = BTreeMap::new();
  let mut dependents: HashMap<&Digest, Vec<&Digest>> = HashMap::new();

  for (d, op) in all_ops {
    let inputs: BTreeSet<&Digest> = op
      .inputs
      .iter()
      .map(|i| &i.digest)
      .filter(|i| all_ops.contains_key(*i))
      .collect();
    in_degree.insert(d, inputs.len());
    for input in inputs {
      dependents.entry(input).or_default().push(d);
    }
  }

  let mut ready: BTreeSet<&Digest> = in_degree
    .iter()
    .filter(|(_, degree)| **degree == 0)
    .map(|(d, _)| *d)
    .collect();
  let mut order = Vec::with_capacity(all_ops.len());

  while let Some(next) = ready.pop_first() {
    order.push(next.clone());
    for dependent in dependents.get(next).into_iter().flatten() {
      if let Some(degree) = in_degree.get_mut(dependent) {
        *degree -= 1;
        if *degree == 0 {
          ready.insert(*dependent);
        }
      }
    }
  }

  if order.len() != all_ops.len() {
    let stuck = in_degree
      .into_iter()
      .find(|(_, degree)| *degree > 0)
      .map(|(d, _)| d.clone());
    if let Some(digest) = stuck {
      return Err(RewriteError::Cycle { digest });
    }
  }

  Ok(order)
}

/// Recompute every op in dependency order against a seeded table.
pub fn propagate(
  all_ops: &mut BTreeMap<Digest, Op>,
  table: &mut RewriteTable,
) -> Result<(), RewriteError> {
  let order = topological_order(all_ops)?;
  for target in &order {
    recompute(all_ops, table, target)?;
  }
  Ok(())
}

/// Apply `changes` and propagate them through every dependent.
///
/// Each changed op keeps its own input references; inputs that were
/// themselves rewritten are substituted.
fn rewrite_ops(
  all_ops: &mut BTreeMap<Digest, Op>,
  mut changes: BTreeMap<Digest, Op>,
) -> Result<RewriteTable, RewriteError> {
  for old in changes.keys() {
    if !all_ops.contains_key(old) {
      return Err(RewriteError::OpNotFound { digest: old.clone() });
    }
  }

  let order = topological_order(all_ops)?;
  let mut table = RewriteTable::new();
  for target in &order {
    match changes.remove(target) {
      Some(mut op) => {
        for input in &mut op.inputs {
          if let Some(rewritten) = table.get(&input.digest) {
            input.digest = rewritten.clone();
          }
        }
        replace(all_ops, &mut table, target, op)?;
      }
      None => {
        recompute(all_ops, &mut table, target)?;
      }
    }
  }
  Ok(table)
}

impl Definition {
  /// Replace ops and propagate the new digests to every dependent.
  ///
  /// Works on a copy; the definition is left untouched on error. Metadata
  /// follows its op to the new digest and heads are remapped.
  #[instrument(name = "rewrite", skip_all, fields(changes = changes.len()))]
  pub fn rewrite(&mut self, changes: BTreeMap<Digest, Op>) -> Result<RewriteTable, RewriteError> {
    let mut ops = self.ops.clone();
    let table = rewrite_ops(&mut ops, changes)?;

    let mut metadata = BTreeMap::new();
    for (d, meta) in &self.metadata {
      let target = table.get(d).unwrap_or(d).clone();
      metadata
        .entry(target)
        .and_modify(|existing: &mut OpMetadata| existing.merge(meta))
        .or_insert_with(|| meta.clone());
    }

    let heads = self
      .heads
      .iter()
      .map(|head| {
        let mut head = head.clone();
        if let Some(rewritten) = table.get(&head.digest) {
          head.digest = rewritten.clone();
        }
        head
      })
      .collect();

    let rewritten = Definition {
      ops,
      metadata,
      heads,
    };
    rewritten.validate().map_err(RewriteError::Invalid)?;
    *self = rewritten;

    info!(rewritten = table.len(), "definition_rewritten");
    Ok(table)
  }

  /// Point every source op with identifier `from` at `to`.
  pub fn pin_source(&mut self, from: &str, to: &str) -> Result<RewriteTable, RewriteError> {
    let changes: BTreeMap<Digest, Op> = self
      .ops
      .iter()
      .filter_map(|(d, op)| match &op.op {
        OpKind::Source(source) if source.identifier == from => {
          let mut pinned = op.clone();
          if let OpKind::Source(source) = &mut pinned.op {
            source.identifier = to.to_string();
          }
          Some((d.clone(), pinned))
        }
        _ => None,
      })
      .collect();
    self.rewrite(changes)
  }
}
