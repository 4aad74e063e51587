use std::ops::ControlFlow;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::db::{subscribe_to_updates, DocumentStore, StoreError, StoreEvent};

use super::hub::HubCommand;

/// Subscribe the hub of `doc_id` to store updates from other replicas.
///
/// Snapshots this replica wrote itself are dropped. Returns once the
/// subscription is live; the forwarding loop runs until the hub goes away.
pub async fn spawn_synchronizer(
    store: &dyn DocumentStore,
    doc_id: &str,
    instance_id: String,
    hub_tx: mpsc::UnboundedSender<HubCommand>,
) -> Result<JoinHandle<()>, StoreError> {
    let pump = subscribe_to_updates(store, doc_id, move |event| {
        let command = match event {
            StoreEvent::Updated(state) if state.origin.as_deref() == Some(instance_id.as_str()) => {
                return ControlFlow::Continue(());
            }
            StoreEvent::Updated(state) => HubCommand::Remote(state),
            StoreEvent::Deleted => HubCommand::RemoteDeleted,
        };
        match hub_tx.send(command) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    })
    .await?;

    debug!("Synchronizer subscribed to document {}", doc_id);
    Ok(tokio::spawn(pump))
}
