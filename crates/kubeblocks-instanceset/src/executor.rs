//! Applies the writes computed from a tree

use tracing::{debug, info};

use kubeblocks_common::Result;

use crate::store::InstanceSetStore;
use crate::tree::Mutation;

/// Apply `plan` in order
///
/// Stops at the first failed write; the next pass reloads the tree and
/// recomputes whatever is left. Deleting an object that is already gone
/// counts as success.
pub async fn apply_plan(store: &dyn InstanceSetStore, plan: &[Mutation]) -> Result<()> {
    for mutation in plan {
        debug!(mutation = %mutation.describe(), "applying");
        match mutation {
            Mutation::Create(object) => store.create_object(object).await?,
            Mutation::Update(object) => store.update_object(object).await?,
            Mutation::Delete(object) => {
                info!(kind = %object.kind(), name = %object.name(), "deleting");
                match store.delete_object(object).await {
                    Err(e) if e.is_not_found() => {}
                    other => other?,
                }
            }
            Mutation::UpdateRoot(its) => store.update_instance_set(its).await?,
            Mutation::RootStatus(its) => store.patch_instance_set_status(its).await?,
        }
    }
    Ok(())
}
