//! Identity and session tracking.
//!
//! Maintains the identity table, a secondary index from network address to
//! identity (reconnect without a token), and the address/user ban lists.
//!
//! Every client behind the same address (NAT, shared proxy) resolves to the
//! same identity through the address index.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use parley_shared::constants::{AI_PARTICIPANT, GUEST_NAME_PREFIX, GUEST_NAME_SUFFIX_LEN};
use parley_shared::transport::ConnectionId;
use parley_shared::{ParticipantInfo, Transport, UserId};

use crate::error::{Result, StoreError};
use crate::models::{BannedAddress, Identity, IdentityInfo, Registration};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    identities: HashMap<UserId, Identity>,
    by_address: HashMap<String, UserId>,
    banned_addresses: HashSet<String>,
    banned_users: HashSet<UserId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to an identity by its network address.
    ///
    /// An address that already owns an identity gets that identity back with
    /// its transport replaced. Otherwise a fresh identity with a unique
    /// default name is created and indexed under the address.
    pub fn register(&mut self, transport: Transport, address: &str) -> Registration {
        if let Some(user_id) = self.by_address.get(address).cloned() {
            if let Some(identity) = self.identities.get_mut(&user_id) {
                replace_transport(identity, transport);
                debug!(user = %user_id, address, "Rebound identity by address");
                return Registration {
                    user_id,
                    name: identity.name.clone(),
                    reconnected: true,
                };
            }
            self.by_address.remove(address);
        }

        let user_id = UserId::new();
        let name = self.unique_guest_name(&user_id);

        self.identities.insert(
            user_id.clone(),
            Identity {
                id: user_id.clone(),
                transport: Some(transport),
                name: name.clone(),
                address: address.to_string(),
            },
        );
        self.by_address.insert(address.to_string(), user_id.clone());

        info!(user = %user_id, name = %name, address, "Registered new identity");

        Registration {
            user_id,
            name,
            reconnected: false,
        }
    }

    /// Rebind an identity the client already holds the id of.
    ///
    /// The identity moves to `address`, so later bans and address lookups
    /// follow the connection it is actually using.
    pub fn rebind_by_token(
        &mut self,
        user_id: &UserId,
        transport: Transport,
        address: &str,
    ) -> Result<String> {
        let identity = self
            .identities
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.clone()))?;
        replace_transport(identity, transport);

        if identity.address != address {
            if self.by_address.get(&identity.address) == Some(user_id) {
                self.by_address.remove(&identity.address);
            }
            debug!(user = %user_id, from = %identity.address, to = address, "Identity moved address");
            identity.address = address.to_string();
            self.by_address.insert(address.to_string(), user_id.clone());
        }

        debug!(user = %user_id, "Rebound identity by token");
        Ok(identity.name.clone())
    }

    /// Overwrite the display name. Names chosen this way may collide.
    pub fn rename(&mut self, user_id: &UserId, name: &str) {
        if let Some(identity) = self.identities.get_mut(user_id) {
            debug!(user = %user_id, from = %identity.name, to = name, "Renamed identity");
            identity.name = name.to_string();
        }
    }

    pub fn lookup(&self, user_id: &UserId) -> Option<&Identity> {
        self.identities.get(user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.identities.contains_key(user_id)
    }

    /// Snapshot of every identity, ordered by name then id.
    pub fn all(&self) -> Vec<IdentityInfo> {
        let mut all: Vec<IdentityInfo> = self.identities.values().map(Identity::info).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Identity currently carrying `name`. Ties go to the smallest id.
    pub fn find_by_name(&self, name: &str) -> Option<UserId> {
        self.identities
            .values()
            .filter(|identity| identity.name == name)
            .map(|identity| identity.id.clone())
            .min()
    }

    /// Participant id with its display name, `"AI"` for the sentinel.
    pub fn resolve(&self, user_id: &UserId) -> ParticipantInfo {
        let name = if user_id.is_ai() {
            Some(AI_PARTICIPANT.to_string())
        } else {
            self.identities.get(user_id).map(|i| i.name.clone())
        };
        ParticipantInfo {
            id: user_id.clone(),
            name,
        }
    }

    /// Transport of an identity if it is still open.
    pub fn live_transport(&self, user_id: &UserId) -> Option<&Transport> {
        self.identities
            .get(user_id)
            .and_then(|identity| identity.transport.as_ref())
            .filter(|transport| transport.is_open())
    }

    /// Forget the transport of a closed connection.
    ///
    /// Only clears it when the identity is still bound to `connection_id`;
    /// a newer connection that rebound the identity is left alone.
    pub fn detach(&mut self, user_id: &UserId, connection_id: ConnectionId) -> bool {
        let Some(identity) = self.identities.get_mut(user_id) else {
            return false;
        };
        match &identity.transport {
            Some(transport) if transport.id() == connection_id => {
                identity.transport = None;
                debug!(user = %user_id, "Detached transport");
                true
            }
            _ => false,
        }
    }

    /// Delete an identity and its address index entry.
    pub fn remove(&mut self, user_id: &UserId) -> Option<Identity> {
        let identity = self.identities.remove(user_id)?;
        if self.by_address.get(&identity.address) == Some(user_id) {
            self.by_address.remove(&identity.address);
        }
        info!(user = %user_id, "Removed identity");
        Some(identity)
    }

    /// Ban an address and close every live transport registered from it.
    ///
    /// Returns the number of transports closed; banning an address that is
    /// already banned closes nothing.
    pub fn ban(&mut self, address: &str) -> usize {
        if !self.banned_addresses.insert(address.to_string()) {
            return 0;
        }

        let mut closed = 0;
        for identity in self
            .identities
            .values_mut()
            .filter(|identity| identity.address == address)
        {
            if close_transport(identity) {
                closed += 1;
            }
        }

        info!(address, closed, "Banned address");
        closed
    }

    /// Lift an address ban. Closed transports stay closed.
    pub fn unban(&mut self, address: &str) -> bool {
        let removed = self.banned_addresses.remove(address);
        if removed {
            info!(address, "Unbanned address");
        }
        removed
    }

    pub fn is_banned(&self, address: &str) -> bool {
        self.banned_addresses.contains(address)
    }

    /// Ban a single identity and close its live transport.
    ///
    /// Returns `false` if the identity was already banned.
    pub fn ban_user(&mut self, user_id: &UserId) -> bool {
        if !self.banned_users.insert(user_id.clone()) {
            return false;
        }
        if let Some(identity) = self.identities.get_mut(user_id) {
            close_transport(identity);
        }
        info!(user = %user_id, "Banned identity");
        true
    }

    pub fn unban_user(&mut self, user_id: &UserId) -> bool {
        self.banned_users.remove(user_id)
    }

    pub fn is_user_banned(&self, user_id: &UserId) -> bool {
        self.banned_users.contains(user_id)
    }

    /// Banned addresses, sorted, each with the identities registered from it.
    pub fn banned_with_owners(&self) -> Vec<BannedAddress> {
        let mut addresses: Vec<&String> = self.banned_addresses.iter().collect();
        addresses.sort();

        addresses
            .into_iter()
            .map(|address| {
                let mut owners: Vec<IdentityInfo> = self
                    .identities
                    .values()
                    .filter(|identity| &identity.address == address)
                    .map(Identity::info)
                    .collect();
                owners.sort_by(|a, b| a.id.cmp(&b.id));
                BannedAddress {
                    address: address.clone(),
                    owners,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Default name derived from `user_id`, regenerated until no current
    /// identity carries it.
    fn unique_guest_name(&self, user_id: &UserId) -> String {
        let mut name = guest_name(user_id);
        while self.name_taken(&name) {
            name = guest_name(&UserId::new());
        }
        name
    }

    fn name_taken(&self, name: &str) -> bool {
        self.identities.values().any(|identity| identity.name == name)
    }
}

fn guest_name(user_id: &UserId) -> String {
    format!("{GUEST_NAME_PREFIX}{}", user_id.short(GUEST_NAME_SUFFIX_LEN))
}

/// Install `transport`, closing a different transport the identity held.
fn replace_transport(identity: &mut Identity, transport: Transport) {
    if let Some(previous) = identity.transport.replace(transport) {
        let same = identity
            .transport
            .as_ref()
            .is_some_and(|current| current.id() == previous.id());
        if !same && previous.close() {
            debug!(user = %identity.id, "Closed superseded transport");
        }
    }
}

/// Close and clear the identity's transport. Returns whether it was live.
fn close_transport(identity: &mut Identity) -> bool {
    match identity.transport.take() {
        Some(transport) => {
            let live = transport.is_open();
            transport.close();
            live
        }
        None => false,
    }
}
