//! Client registration.

use crate::client::{delete_client, get_clients, set_clients, Client};
use crate::client_group::{
    get_client_groups, normalize_mutator_names, set_client_group, ClientGroup, ClientGroupId,
    IndexDefinitions,
};
use crate::error::{ClientError, Result};
use tabsync_dag::{put_commit, ClientId, Commit, Write};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub client: Client,
    /// Whether a new group was created for this client.
    pub new_client_group: bool,
}

/// Register `client_id`, joining the first enabled group with the same
/// schema or creating a fresh one rooted at a genesis snapshot.
pub fn register_client<W, I, S>(
    tx: &mut W,
    client_id: &ClientId,
    mutator_names: I,
    indexes: IndexDefinitions,
    now_ms: u64,
) -> Result<Registration>
where
    W: Write,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut clients = get_clients(tx)?;
    if clients.contains_key(client_id) {
        return Err(ClientError::AlreadyRegistered(client_id.clone()));
    }

    let mutator_names = normalize_mutator_names(mutator_names);
    let existing = get_client_groups(tx)?
        .into_iter()
        .find(|(_, group)| group.accepts(&mutator_names, &indexes));

    let (group_id, head, new_client_group) = match existing {
        Some((id, group)) => (id, group.head_hash, false),
        None => {
            let genesis = put_commit(tx, &Commit::genesis())?;
            let id = ClientGroupId::random();
            set_client_group(tx, &id, ClientGroup::new(genesis, mutator_names, indexes))?;
            (id, genesis, true)
        }
    };

    let client = Client::new(group_id.clone(), head, now_ms);
    clients.insert(client_id.clone(), client.clone());
    set_clients(tx, &clients)?;

    info!(
        client_id = %client_id,
        client_group_id = %group_id,
        new_client_group,
        "registered client"
    );
    Ok(Registration {
        client,
        new_client_group,
    })
}

/// Remove the client's record. Its group is left for client-group GC.
pub fn unregister_client<W: Write>(tx: &mut W, client_id: &ClientId) -> Result<Option<Client>> {
    let removed = delete_client(tx, client_id)?;
    if removed.is_some() {
        info!(client_id = %client_id, "unregistered client");
    }
    Ok(removed)
}
