//! The room hub: a single task owning all rooms, users, and sessions.
//!
//! Every connection pushes `ClientMessage`s onto one unbounded channel; the
//! hub consumes them serially and is the only task that ever mutates room
//! state. Handler errors are returned to the offending client through its
//! close channel and never affect other rooms.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::BoxError;
use crate::client::{CLOSE_OWNER_LEFT, ClientInfo, ClientMessage};
use crate::config::{AuthMode, Config};
use crate::id::Id;
use crate::ip::IpProvider;
use crate::names::NameGenerator;
use crate::protocol::{ConnectionMode, CreateRoom, Incoming, JoinRoom, Outgoing, P2pMessage};
use crate::relay::TurnAuth;
use crate::room::{Room, RoomUser};

pub struct Hub {
    rooms: HashMap<String, Room>,
    config: Arc<Config>,
    turn: Arc<dyn TurnAuth>,
    ips: Arc<dyn IpProvider>,
    names: NameGenerator,
}

impl Hub {
    pub fn new(config: Arc<Config>, turn: Arc<dyn TurnAuth>, ips: Arc<dyn IpProvider>) -> Self {
        Hub {
            rooms: HashMap::new(),
            config,
            turn,
            ips,
            names: NameGenerator::new(),
        }
    }

    /// Consumes the shared event channel until every sender is gone.
    pub async fn run(mut self, mut incoming: mpsc::UnboundedReceiver<ClientMessage>) {
        while let Some(message) = incoming.recv().await {
            debug!(
                client = %message.info.id,
                user = %message.info.username,
                event = ?message.incoming,
                "hub received event"
            );
            if let Err(err) = self.execute(message.incoming, &message.info).await {
                error!(client = %message.info.id, %err, "event handler failed");
                let _ = message.info.close.try_send(err.to_string());
            }
        }
    }

    async fn execute(&mut self, event: Incoming, info: &ClientInfo) -> Result<(), BoxError> {
        match event {
            Incoming::Create(create) => self.create(create, info).await,
            Incoming::Join(join) => self.join(join, info).await,
            Incoming::Share => self.start_share(info).await,
            Incoming::StopShare => self.stop_share(info).await,
            Incoming::HostOffer(msg) => self.relay(msg, info, true, Outgoing::HostOffer).await,
            Incoming::ClientAnswer(msg) => {
                self.relay(msg, info, false, Outgoing::ClientAnswer).await
            }
            Incoming::HostIce(msg) => self.relay(msg, info, true, Outgoing::HostIce).await,
            Incoming::ClientIce(msg) => self.relay(msg, info, false, Outgoing::ClientIce).await,
            Incoming::Disconnected => self.disconnected(info).await,
        }
    }

    async fn create(&mut self, event: CreateRoom, info: &ClientInfo) -> Result<(), BoxError> {
        if !info.room_id.is_empty() {
            return Err("cannot join room, you are already in one".into());
        }

        let id = if event.id.is_empty() {
            self.names.room_name()
        } else {
            event.id.clone()
        };

        if self.rooms.contains_key(&id) {
            if event.join_if_exist {
                let join = JoinRoom {
                    id,
                    username: event.username,
                };
                return self.join(join, info).await;
            }
            return Err(format!("room with id {id} does already exist").into());
        }

        match self.config.auth_mode {
            AuthMode::None => {}
            AuthMode::All => {
                if !info.authenticated {
                    return Err("you need to login".into());
                }
            }
            AuthMode::Turn => {
                if event.connection_mode == ConnectionMode::Turn && !info.authenticated {
                    return Err("you need to login".into());
                }
            }
        }

        let name = if info.authenticated {
            info.username.clone()
        } else {
            self.names.user_name()
        };

        let mut room = Room::new(id.clone(), event.close_on_owner_leave, event.connection_mode);
        room.users.insert(
            info.id,
            RoomUser {
                id: info.id,
                addr: info.addr,
                name,
                streaming: false,
                owner: true,
                write: info.write.clone(),
                close: info.close.clone(),
            },
        );
        debug!(room = %id, owner = %info.id, mode = ?event.connection_mode, "room created");
        let room = self.rooms.entry(id).or_insert(room);
        room.notify_info_changed().await;
        Ok(())
    }

    async fn join(&mut self, event: JoinRoom, info: &ClientInfo) -> Result<(), BoxError> {
        if !info.room_id.is_empty() {
            return Err("cannot join room, you are already in one".into());
        }

        let name = if info.authenticated {
            info.username.clone()
        } else {
            self.names.user_name()
        };
        let (v4, v6) = self.ips.get()?;

        let Hub {
            rooms,
            turn,
            config,
            ..
        } = self;
        let room = rooms
            .get_mut(&event.id)
            .ok_or_else(|| format!("room with id {} does not exist", event.id))?;
        room.users.insert(
            info.id,
            RoomUser {
                id: info.id,
                addr: info.addr,
                name,
                streaming: false,
                owner: false,
                write: info.write.clone(),
                close: info.close.clone(),
            },
        );
        debug!(room = %event.id, client = %info.id, "user joined");

        let hosts: Vec<Id> = room
            .users
            .values()
            .filter(|user| user.streaming && user.id != info.id)
            .map(|user| user.id)
            .collect();
        for host in hosts {
            room.new_session(host, info.id, turn.as_ref(), config.turn_port, v4, v6)
                .await;
        }
        room.notify_info_changed().await;
        Ok(())
    }

    async fn start_share(&mut self, info: &ClientInfo) -> Result<(), BoxError> {
        let (v4, v6) = self.ips.get()?;
        let Hub {
            rooms,
            turn,
            config,
            ..
        } = self;
        let room = lookup_room(rooms, info)?;
        room.users
            .get_mut(&info.id)
            .ok_or("not a member of this room")?
            .streaming = true;

        let viewers: Vec<Id> = room
            .users
            .values()
            .filter(|user| user.id != info.id)
            .map(|user| user.id)
            .collect();
        for viewer in viewers {
            room.new_session(info.id, viewer, turn.as_ref(), config.turn_port, v4, v6)
                .await;
        }
        room.notify_info_changed().await;
        Ok(())
    }

    async fn stop_share(&mut self, info: &ClientInfo) -> Result<(), BoxError> {
        let Hub { rooms, turn, .. } = self;
        let room = lookup_room(rooms, info)?;
        room.users
            .get_mut(&info.id)
            .ok_or("not a member of this room")?
            .streaming = false;

        let hosted: Vec<Id> = room
            .sessions
            .iter()
            .filter(|(_, session)| session.host == info.id)
            .map(|(id, _)| *id)
            .collect();
        for sid in hosted {
            let session = room.sessions[&sid];
            if let Some(viewer) = room.users.get(&session.client) {
                viewer.deliver(Outgoing::EndShare(sid)).await;
            }
            room.close_session(turn.as_ref(), sid);
        }
        room.notify_info_changed().await;
        Ok(())
    }

    /// Forwards an SDP or ICE payload to the opposite end of its session,
    /// enforcing that offers/host ICE come from the host and answers/client
    /// ICE from the client.
    async fn relay(
        &mut self,
        message: P2pMessage,
        info: &ClientInfo,
        from_host: bool,
        wrap: fn(P2pMessage) -> Outgoing,
    ) -> Result<(), BoxError> {
        let room = lookup_room(&mut self.rooms, info)?;
        let Some(session) = room.sessions.get(&message.sid) else {
            // Benign race with session close.
            debug!(session = %message.sid, "unknown session");
            return Ok(());
        };
        let (expected, target) = if from_host {
            (session.host, session.client)
        } else {
            (session.client, session.host)
        };
        if expected != info.id {
            return Err(format!("permission denied for session {}", message.sid).into());
        }
        if let Some(peer) = room.users.get(&target) {
            peer.deliver(wrap(message)).await;
        }
        Ok(())
    }

    async fn disconnected(&mut self, info: &ClientInfo) -> Result<(), BoxError> {
        if info.room_id.is_empty() {
            return Ok(());
        }
        let Hub { rooms, turn, .. } = self;
        let Some(room) = rooms.get_mut(&info.room_id) else {
            return Ok(());
        };
        let Some(user) = room.users.remove(&info.id) else {
            return Ok(());
        };
        debug!(room = %info.room_id, client = %info.id, "user disconnected");

        let involved: Vec<Id> = room
            .sessions
            .iter()
            .filter(|(_, session)| session.host == info.id || session.client == info.id)
            .map(|(id, _)| *id)
            .collect();
        for sid in involved {
            let session = room.sessions[&sid];
            let peer = if session.host == info.id {
                session.client
            } else {
                session.host
            };
            if let Some(peer) = room.users.get(&peer) {
                peer.deliver(Outgoing::EndShare(sid)).await;
            }
            room.close_session(turn.as_ref(), sid);
        }

        if user.owner && room.close_on_owner_leave {
            for member in room.users.values() {
                let _ = member.close.try_send(CLOSE_OWNER_LEFT.to_string());
            }
            close_room(rooms, turn.as_ref(), &info.room_id);
        } else if room.users.is_empty() {
            rooms.remove(&info.room_id);
            debug!(room = %info.room_id, "empty room deleted");
        } else {
            room.notify_info_changed().await;
        }
        Ok(())
    }
}

fn lookup_room<'a>(
    rooms: &'a mut HashMap<String, Room>,
    info: &ClientInfo,
) -> Result<&'a mut Room, BoxError> {
    if info.room_id.is_empty() {
        return Err("not in a room".into());
    }
    rooms
        .get_mut(&info.room_id)
        .ok_or_else(|| format!("room with id {} does not exist", info.room_id).into())
}

/// Closes every session in a room, then deletes it.
fn close_room(rooms: &mut HashMap<String, Room>, turn: &dyn TurnAuth, room_id: &str) {
    let Some(room) = rooms.get_mut(room_id) else {
        error!(room = %room_id, "no room to close");
        return;
    };
    let sessions: Vec<Id> = room.sessions.keys().copied().collect();
    for sid in sessions {
        room.close_session(turn, sid);
    }
    rooms.remove(room_id);
    debug!(room = %room_id, "room closed");
}
