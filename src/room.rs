//! Room state: users, directed host→client sessions, and broadcasts.
//!
//! Rooms, users, and sessions reference each other by opaque [`Id`] only.
//! Everything here is owned by the hub task; other tasks reach users solely
//! through the per-user `write`/`close` channels stored on [`RoomUser`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::sync::mpsc;
use tracing::warn;

use crate::client::PING_PERIOD;
use crate::id::Id;
use crate::protocol::{ConnectionMode, IceServer, Outgoing, RoomInfo, SessionInit, UserInfo};
use crate::relay::TurnAuth;

pub struct Room {
    pub id: String,
    pub close_on_owner_leave: bool,
    pub connection_mode: ConnectionMode,
    pub users: HashMap<Id, RoomUser>,
    pub sessions: HashMap<Id, Session>,
}

pub struct RoomUser {
    pub id: Id,
    pub addr: IpAddr,
    pub name: String,
    pub streaming: bool,
    pub owner: bool,
    pub write: mpsc::Sender<Outgoing>,
    pub close: mpsc::Sender<String>,
}

/// A directed stream relationship: the host's media is negotiated for the
/// client.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub host: Id,
    pub client: Id,
}

impl RoomUser {
    /// Pushes a message onto the user's write queue. The writer is expected
    /// to drain within one ping period; a consumer slower than that is
    /// considered dead and gets a close reason instead.
    pub async fn deliver(&self, message: Outgoing) {
        if let Err(err) = self.write.send_timeout(message, PING_PERIOD).await {
            warn!(client = %self.id, %err, "write queue not drained, marking connection dead");
            let _ = self
                .close
                .try_send(format!("client {} stopped reading", self.id));
        }
    }
}

impl Room {
    pub fn new(id: String, close_on_owner_leave: bool, connection_mode: ConnectionMode) -> Self {
        Room {
            id,
            close_on_owner_leave,
            connection_mode,
            users: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Opens a session between `host` and `client` and hands both ends their
    /// ICE configuration. In TURN mode this issues one relay credential per
    /// participant, bound to that participant's peer IP.
    pub async fn new_session(
        &mut self,
        host: Id,
        client: Id,
        turn: &dyn TurnAuth,
        turn_port: u16,
        v4: Option<Ipv4Addr>,
        v6: Option<Ipv6Addr>,
    ) {
        let (Some(host_user), Some(client_user)) = (self.users.get(&host), self.users.get(&client))
        else {
            warn!(room = %self.id, %host, %client, "session participants missing");
            return;
        };

        let id = Id::new();
        self.sessions.insert(id, Session { host, client });

        let (ice_host, ice_client) = match self.connection_mode {
            ConnectionMode::Local => (Vec::new(), Vec::new()),
            ConnectionMode::Stun => {
                let urls = ice_urls("stun", v4, v6, turn_port, false);
                (
                    vec![IceServer {
                        urls: urls.clone(),
                        username: None,
                        credential: None,
                    }],
                    vec![IceServer {
                        urls,
                        username: None,
                        credential: None,
                    }],
                )
            }
            ConnectionMode::Turn => {
                let urls = ice_urls("turn", v4, v6, turn_port, true);
                let (host_name, host_password) =
                    turn.credentials(&format!("{id}host"), host_user.addr);
                let (client_name, client_password) =
                    turn.credentials(&format!("{id}client"), client_user.addr);
                (
                    vec![IceServer {
                        urls: urls.clone(),
                        username: Some(host_name),
                        credential: Some(host_password),
                    }],
                    vec![IceServer {
                        urls,
                        username: Some(client_name),
                        credential: Some(client_password),
                    }],
                )
            }
        };

        host_user
            .deliver(Outgoing::HostSession(SessionInit {
                peer: client,
                id,
                ice_servers: ice_host,
            }))
            .await;
        client_user
            .deliver(Outgoing::ClientSession(SessionInit {
                peer: host,
                id,
                ice_servers: ice_client,
            }))
            .await;
    }

    /// Removes a session, revoking both relay credentials in TURN mode.
    pub fn close_session(&mut self, turn: &dyn TurnAuth, id: Id) {
        if self.connection_mode == ConnectionMode::Turn {
            turn.ban(&format!("{id}host"));
            turn.ban(&format!("{id}client"));
        }
        self.sessions.remove(&id);
    }

    /// Sends every user an up-to-date room snapshot with its own `you` flag.
    pub async fn notify_info_changed(&self) {
        for current in self.users.values() {
            let users = sorted_users(&self.users, current.id);
            current
                .deliver(Outgoing::Room(RoomInfo {
                    id: self.id.clone(),
                    users,
                }))
                .await;
        }
    }
}

/// Deterministic user-list ordering: owners first, then streamers, then by
/// name ascending.
pub fn sorted_users(users: &HashMap<Id, RoomUser>, you: Id) -> Vec<UserInfo> {
    let mut list: Vec<UserInfo> = users
        .values()
        .map(|user| UserInfo {
            id: user.id,
            name: user.name.clone(),
            streaming: user.streaming,
            owner: user.owner,
            you: user.id == you,
        })
        .collect();
    list.sort_by(|a, b| {
        b.owner
            .cmp(&a.owner)
            .then_with(|| b.streaming.cmp(&a.streaming))
            .then_with(|| a.name.cmp(&b.name))
    });
    list
}

/// STUN/TURN URL list for the configured address families. TCP transport
/// forms are emitted for TURN only.
pub fn ice_urls(
    scheme: &str,
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
    port: u16,
    tcp: bool,
) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(v4) = v4 {
        urls.push(format!("{scheme}:{v4}:{port}"));
        if tcp {
            urls.push(format!("{scheme}:{v4}:{port}?transport=tcp"));
        }
    }
    if let Some(v6) = v6 {
        urls.push(format!("{scheme}:[{v6}]:{port}"));
        if tcp {
            urls.push(format!("{scheme}:[{v6}]:{port}?transport=tcp"));
        }
    }
    urls
}
