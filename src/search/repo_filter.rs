//! Skip shards whose repositories cannot satisfy the query's repository atoms

use crate::query::Q;
use crate::search::registry::RankedShard;
use std::sync::Arc;

/// Repository atoms that constrain every match: the root itself, or direct
/// children of a root conjunction
fn required_repo_atoms(q: &Q) -> Vec<&Q> {
    let is_repo_atom = |q: &Q| {
        matches!(
            q,
            Q::Repo(_) | Q::RepoSet(_) | Q::RepoIds(_) | Q::BranchesRepos(_) | Q::RawConfig(_)
        )
    };
    match q {
        Q::And(children) => children.iter().filter(|c| is_repo_atom(*c)).collect(),
        other if is_repo_atom(other) => vec![other],
        _ => Vec::new(),
    }
}

/// Shards that may match `q`, in their original order, and the number skipped
///
/// Shards without known repositories are always kept.
pub fn select_repo_set(shards: &[Arc<RankedShard>], q: &Q) -> (Vec<Arc<RankedShard>>, usize) {
    let atoms = required_repo_atoms(q);
    if atoms.is_empty() {
        return (shards.to_vec(), 0);
    }

    let mut kept = Vec::with_capacity(shards.len());
    let mut skipped = 0;
    for shard in shards {
        let possible = shard.repos.is_empty()
            || atoms.iter().all(|atom| {
                shard
                    .repos
                    .iter()
                    .any(|repo| !atom.simplify_for_repo(repo).is_const(false))
            });
        if possible {
            kept.push(Arc::clone(shard));
        } else {
            skipped += 1;
        }
    }
    (kept, skipped)
}
