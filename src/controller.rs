//! Controller glue: translates application-level operations (broadcast/PM, group create/join/
//! leave, connect-time snapshot) into causally-ordered `COM.send` calls, and turns delivered
//! payloads back into application state changes via the 3-character header dispatch of spec
//! §4.E / §6.
//!
//! The COM never calls back into the controller directly while holding its mutex: `deliver` (see
//! [`ControllerDeliverer`]) only forwards payload bytes over a channel, and a dedicated task
//! drains that channel and runs [`Controller::handle_delivery`], which is free to issue further
//! `COM.send` calls (e.g. a join acknowledgement) without re-entering the COM's own lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tracing::warn;

use crate::causal::{CausalOrderManager, Deliverer};
use crate::entry::PeerId;
use crate::error::ChatError;
use crate::roster::{ConnectHook, PeerRoster, Transport};

/// Ring-buffer capacity for each group's message history, matching the source's `deque(maxlen=10)`.
const HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub enum Target {
    /// A group name, e.g. `"all"`.
    Group(String),
    /// A full `"name@peer-id"` user identity.
    User(String),
}

impl Target {
    pub fn parse(raw: &str) -> Self {
        if raw.contains('@') {
            Target::User(raw.to_string())
        } else {
            Target::Group(raw.to_string())
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    users: HashMap<String, Vec<String>>,
    groups: HashMap<String, Vec<String>>,
    history: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupEventData {
    group: String,
    members: Vec<String>,
    group_history: Vec<String>,
}

struct ControllerState {
    users: HashMap<String, Vec<String>>,
    groups: HashMap<String, Vec<String>>,
    histories: HashMap<String, VecDeque<String>>,
}

/// Forwards delivered payloads from the COM to the controller's delivery-processing task.
/// Deliberately does no work beyond the channel send: it runs while the COM mutex in
/// [`CausalOrderManager::receive`] is held, so anything heavier belongs on the receiving end.
struct ControllerDeliverer {
    tx: UnboundedSender<Vec<u8>>,
}

impl Deliverer for ControllerDeliverer {
    fn deliver(&self, payload: Vec<u8>) {
        let _ = self.tx.send(payload);
    }
}

pub struct Controller<T: Transport> {
    user_name: String,
    self_peer: PeerId,
    com: Arc<CausalOrderManager<T>>,
    roster: Arc<PeerRoster<T>>,
    state: Mutex<ControllerState>,
}

/// Fires [`Controller::snapshot_on_connect`] for every connection the roster reports, regardless
/// of which transport path established it (accept loop, discovery dial, or a statically
/// configured peer). Holds only a `Weak` reference: the roster it is attached to is itself owned
/// by the `Controller` it calls back into, so a strong reference here would be a cycle.
struct SnapshotHook<T: Transport> {
    controller: Weak<Controller<T>>,
}

impl<T: Transport> ConnectHook for SnapshotHook<T> {
    fn on_connect(&self, peer: PeerId) {
        let Some(controller) = self.controller.upgrade() else { return };
        tokio::spawn(async move {
            controller.snapshot_on_connect(peer).await;
        });
    }
}

impl<T: Transport> Controller<T> {
    /// Wires up a COM, a roster, and a controller for a single node, and spawns the task that
    /// drains delivered payloads into the controller. Mirrors the teacher's `main.rs`, which
    /// spawns the network actor and runs the app loop concurrently, joined by a channel.
    pub fn bootstrap(user_name: String, self_peer: PeerId, transport: Arc<T>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deliverer = Arc::new(ControllerDeliverer { tx });
        let com = CausalOrderManager::new(self_peer.clone(), deliverer, transport);
        let roster = Arc::new(PeerRoster::new(com.clone()));

        let full_name = format!("{user_name}@{self_peer}");
        let mut users = HashMap::new();
        users.insert(full_name.clone(), vec!["all".to_string()]);
        let mut groups = HashMap::new();
        groups.insert("all".to_string(), vec![full_name.clone()]);
        let mut histories = HashMap::new();
        histories.insert("all".to_string(), VecDeque::with_capacity(HISTORY_CAPACITY));

        let controller = Arc::new(Self {
            user_name: full_name,
            self_peer,
            com,
            roster,
            state: Mutex::new(ControllerState { users, groups, histories }),
        });

        let worker = controller.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                worker.handle_delivery(payload).await;
            }
        });

        let hook: Arc<dyn ConnectHook> = Arc::new(SnapshotHook { controller: Arc::downgrade(&controller) });
        controller.roster.set_connect_hook(hook);

        controller
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn com(&self) -> &Arc<CausalOrderManager<T>> {
        &self.com
    }

    pub fn roster(&self) -> &Arc<PeerRoster<T>> {
        &self.roster
    }

    /// Resolves `target` to a destination peer-id set, drops self, short-circuits if empty,
    /// records the message, and hands it to the COM.
    pub async fn handle_outgoing(&self, target: &Target, message: String, delay: Duration) {
        let dests = self.resolve_dests(target).await;
        if dests.is_empty() {
            return;
        }
        self.record_message(&message).await;
        self.com.send(message.into_bytes(), dests, delay).await;
    }

    async fn resolve_dests(&self, target: &Target) -> HashSet<PeerId> {
        let mut dests = match target {
            Target::User(full_name) => full_name
                .rsplit_once('@')
                .map(|(_, peer)| HashSet::from([peer.to_string()]))
                .unwrap_or_default(),
            Target::Group(group) => {
                let state = self.state.lock().await;
                state
                    .groups
                    .get(group)
                    .map(|members| {
                        members
                            .iter()
                            .filter_map(|m| m.rsplit_once('@').map(|(_, peer)| peer.to_string()))
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };
        dests.remove(&self.self_peer);
        dests
    }

    /// Invoked by the delivery-processing task once the COM has handed us a payload in causal
    /// order. Dispatches by the 3-character header, per spec §4.E.
    async fn handle_delivery(&self, payload: Vec<u8>) {
        let message = String::from_utf8_lossy(&payload).to_string();
        self.record_message(&message).await;
        if message.len() < 4 {
            warn!(%message, "delivered payload too short to carry a header");
            return;
        }
        let (header, body) = (&message[0..3], &message[4..]);
        match header {
            "MSG" => println!("{body}"),
            "DAT" => self.update_state(body).await,
            "CRG" | "JNG" | "LVG" | "AJG" => self.update_group(header, body).await,
            other => warn!(header = %other, "unknown payload header, ignoring"),
        }
    }

    /// Records a delivered or locally-sent `MSG` line into its group's bounded history.
    async fn record_message(&self, message: &str) {
        if !message.starts_with("MSG ") {
            return;
        }
        let body = &message[4..];
        let Some(rest) = body.strip_prefix('@') else { return };
        let Some(space) = rest.find(' ') else { return };
        let target = &rest[..space];

        let mut state = self.state.lock().await;
        if let Some(history) = state.histories.get_mut(target) {
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(message.to_string());
        }
    }

    /// Issues the connect-time `DAT` snapshot to a newly-seen peer: current users, groups, and
    /// the bounded `@all` history. Best-effort and not causally ordered with subsequent traffic
    /// (documented in DESIGN.md, not fixed — out of scope per spec §9).
    pub async fn snapshot_on_connect(&self, new_peer: PeerId) {
        let data = {
            let state = self.state.lock().await;
            SnapshotData {
                users: state.users.clone(),
                groups: state.groups.clone(),
                history: state.histories.get("all").map(|h| h.iter().cloned().collect()).unwrap_or_default(),
            }
        };
        let body = serde_json::to_string(&data).expect("snapshot data is always serializable");
        let message = format!("DAT {body}");
        self.com.send(message.into_bytes(), HashSet::from([new_peer]), Duration::ZERO).await;
    }

    async fn update_state(&self, body: &str) {
        let data: SnapshotData = match serde_json::from_str(body) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "malformed DAT payload, ignoring");
                return;
            }
        };
        let mut state = self.state.lock().await;
        for (user, groups) in data.users {
            state.users.entry(user.clone()).or_insert_with(|| {
                println!("{user} joined @all");
                groups
            });
        }
        for (group, members) in data.groups {
            match state.groups.get_mut(&group) {
                None => {
                    state.groups.insert(group, members);
                }
                Some(existing) if existing.is_empty() => {
                    state.groups.remove(&group);
                }
                Some(existing) => {
                    for member in members {
                        if !existing.contains(&member) {
                            existing.push(member);
                        }
                    }
                }
            }
        }
        let all_history = state.histories.entry("all".to_string()).or_insert_with(|| VecDeque::with_capacity(HISTORY_CAPACITY));
        for line in data.history {
            if !all_history.contains(&line) {
                if all_history.len() == HISTORY_CAPACITY {
                    all_history.pop_front();
                }
                println!("{line}");
                all_history.push_back(line);
            }
        }
    }

    async fn update_group(&self, header: &str, body: &str) {
        let data: GroupEventData = match serde_json::from_str(body) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, %header, "malformed group event payload, ignoring");
                return;
            }
        };
        match header {
            "CRG" => self.handle_create_group_bcast(data).await,
            "JNG" => self.handle_join_group_bcast(data).await,
            "LVG" => self.handle_leave_group_bcast(data).await,
            "AJG" => self.handle_join_group_ack(data).await,
            _ => unreachable!("update_group only called for CRG/JNG/LVG/AJG"),
        }
    }

    async fn handle_create_group_bcast(&self, data: GroupEventData) {
        let user = data.members.first().cloned().unwrap_or_default();
        let mut state = self.state.lock().await;
        state.groups.entry(data.group.clone()).or_insert_with(|| data.members.clone());
        if let Some(groups) = state.users.get_mut(&user) {
            groups.push(data.group.clone());
        }
        state.histories.entry(data.group.clone()).or_insert_with(|| VecDeque::with_capacity(HISTORY_CAPACITY));
        println!("{user} created and joined group {}", data.group);
    }

    async fn handle_join_group_bcast(&self, data: GroupEventData) {
        let user = data.members.first().cloned().unwrap_or_default();
        let we_are_member = {
            let mut state = self.state.lock().await;
            match state.groups.get_mut(&data.group) {
                Some(members) if !members.contains(&user) => members.push(user.clone()),
                Some(_) => {}
                None => {
                    state.groups.insert(data.group.clone(), data.members.clone());
                }
            }
            if let Some(groups) = state.users.get_mut(&user) {
                if !groups.contains(&data.group) {
                    groups.push(data.group.clone());
                }
            }
            state.groups.get(&data.group).map(|m| m.contains(&self.user_name)).unwrap_or(false)
        };

        if we_are_member {
            let group_history = {
                let state = self.state.lock().await;
                state.histories.get(&data.group).map(|h| h.iter().cloned().collect()).unwrap_or_default()
            };
            let ack = GroupEventData { group: data.group.clone(), members: data.members.clone(), group_history };
            let body = serde_json::to_string(&ack).expect("group ack data is always serializable");
            self.handle_outgoing(&Target::User(user.clone()), format!("AJG {body}"), Duration::ZERO).await;
        }
        println!("{user} joined group {}", data.group);
    }

    async fn handle_leave_group_bcast(&self, data: GroupEventData) {
        let user = data.members.first().cloned().unwrap_or_default();
        let mut state = self.state.lock().await;
        if let Some(members) = state.groups.get_mut(&data.group) {
            members.retain(|m| m != &user);
            if members.is_empty() {
                state.groups.remove(&data.group);
            }
        }
        if let Some(groups) = state.users.get_mut(&user) {
            groups.retain(|g| g != &data.group);
        }
        println!("{user} left group {}", data.group);
    }

    async fn handle_join_group_ack(&self, data: GroupEventData) {
        let mut state = self.state.lock().await;
        let we_are_member = state.groups.get(&data.group).map(|m| m.contains(&self.user_name)).unwrap_or(false);
        if !we_are_member {
            return;
        }
        let history = state.histories.entry(data.group.clone()).or_insert_with(|| VecDeque::with_capacity(HISTORY_CAPACITY));
        for line in data.group_history {
            if !history.contains(&line) {
                if history.len() == HISTORY_CAPACITY {
                    history.pop_front();
                }
                println!("{line}");
                history.push_back(line);
            }
        }
    }

    pub async fn create_group(&self, group: &str) -> Result<(), ChatError> {
        let mut state = self.state.lock().await;
        if state.groups.contains_key(group) {
            return Err(ChatError::GroupExists(group.to_string()));
        }
        state.groups.insert(group.to_string(), vec![self.user_name.clone()]);
        state.users.entry(self.user_name.clone()).or_default().push(group.to_string());
        state.histories.entry(group.to_string()).or_insert_with(|| VecDeque::with_capacity(HISTORY_CAPACITY));
        drop(state);

        let data = GroupEventData { group: group.to_string(), members: vec![self.user_name.clone()], group_history: Vec::new() };
        let body = serde_json::to_string(&data).expect("group data is always serializable");
        self.handle_outgoing(&Target::Group("all".to_string()), format!("CRG {body}"), Duration::ZERO).await;
        println!("{} created and joined group {group}", self.user_name);
        Ok(())
    }

    pub async fn join_group(&self, group: &str) -> Result<(), ChatError> {
        let mut state = self.state.lock().await;
        let members = state.groups.get_mut(group).ok_or_else(|| ChatError::UnknownTarget(group.to_string()))?;
        if members.contains(&self.user_name) {
            return Err(ChatError::NotAMember(group.to_string()));
        }
        members.push(self.user_name.clone());
        state.users.entry(self.user_name.clone()).or_default().push(group.to_string());
        state.histories.entry(group.to_string()).or_insert_with(|| VecDeque::with_capacity(HISTORY_CAPACITY));
        drop(state);

        let data = GroupEventData { group: group.to_string(), members: vec![self.user_name.clone()], group_history: Vec::new() };
        let body = serde_json::to_string(&data).expect("group data is always serializable");
        self.handle_outgoing(&Target::Group("all".to_string()), format!("JNG {body}"), Duration::ZERO).await;
        println!("{} joined group {group}", self.user_name);
        Ok(())
    }

    pub async fn leave_group(&self, group: &str) -> Result<(), ChatError> {
        if group == "all" {
            return Err(ChatError::CannotLeaveAll);
        }
        let mut state = self.state.lock().await;
        let members = state.groups.get_mut(group).ok_or_else(|| ChatError::UnknownTarget(group.to_string()))?;
        if !members.contains(&self.user_name) {
            return Err(ChatError::NotAMember(group.to_string()));
        }
        members.retain(|m| m != &self.user_name);
        if members.is_empty() {
            state.groups.remove(group);
            state.histories.remove(group);
        }
        if let Some(groups) = state.users.get_mut(&self.user_name) {
            groups.retain(|g| g != group);
        }
        drop(state);

        let data = GroupEventData { group: group.to_string(), members: vec![self.user_name.clone()], group_history: Vec::new() };
        let body = serde_json::to_string(&data).expect("group data is always serializable");
        self.handle_outgoing(&Target::Group("all".to_string()), format!("LVG {body}"), Duration::ZERO).await;
        println!("{} left group {group}", self.user_name);
        Ok(())
    }

    pub async fn list_users(&self) -> Vec<(String, Vec<String>)> {
        let state = self.state.lock().await;
        state.users.iter().map(|(u, g)| (u.clone(), g.clone())).collect()
    }

    pub async fn find_user(&self, needle: &str) -> Vec<(String, Vec<String>)> {
        let state = self.state.lock().await;
        state.users.iter().filter(|(u, _)| u.contains(needle)).map(|(u, g)| (u.clone(), g.clone())).collect()
    }

    pub async fn list_groups(&self) -> Vec<(String, Vec<String>)> {
        let state = self.state.lock().await;
        state.groups.iter().map(|(g, m)| (g.clone(), m.clone())).collect()
    }

    pub async fn find_group(&self, needle: &str) -> Vec<(String, Vec<String>)> {
        let state = self.state.lock().await;
        state.groups.iter().filter(|(g, _)| g.contains(needle)).map(|(g, m)| (g.clone(), m.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tokio::sync::mpsc::UnboundedSender;

    struct ChannelTransport {
        sink: UnboundedSender<(PeerId, Vec<u8>)>,
    }

    impl Transport for ChannelTransport {
        async fn send_to(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<()> {
            let _ = self.sink.send((peer.clone(), bytes));
            Ok(())
        }
    }

    type Sink = tokio::sync::mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>;

    fn controller_with_sink() -> (Arc<Controller<ChannelTransport>>, Sink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Controller::bootstrap("alice".into(), "10.0.0.1".into(), Arc::new(ChannelTransport { sink: tx }));
        (controller, rx)
    }

    #[tokio::test]
    async fn create_group_rejects_duplicate() {
        let (controller, _rx) = controller_with_sink();
        controller.create_group("friends").await.expect("first create succeeds");
        let err = controller.create_group("friends").await.unwrap_err();
        assert!(matches!(err, ChatError::GroupExists(_)));
    }

    #[tokio::test]
    async fn leave_all_is_rejected() {
        let (controller, _rx) = controller_with_sink();
        let err = controller.leave_group("all").await.unwrap_err();
        assert!(matches!(err, ChatError::CannotLeaveAll));
    }

    #[tokio::test]
    async fn broadcast_to_all_has_no_destinations_when_alone() {
        let (controller, mut rx) = controller_with_sink();
        controller
            .handle_outgoing(&Target::Group("all".to_string()), "MSG @all alice> hi".to_string(), Duration::ZERO)
            .await;
        assert!(rx.try_recv().is_err(), "no peers yet, nothing should be sent");
    }

    #[tokio::test]
    async fn snapshot_on_connect_targets_only_the_new_peer() {
        let (controller, mut rx) = controller_with_sink();
        controller.com().add_peer("10.0.0.2".to_string()).await;
        controller.snapshot_on_connect("10.0.0.2".to_string()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (peer, bytes) = rx.try_recv().expect("snapshot should have been sent");
        assert_eq!(peer, "10.0.0.2");
        assert!(!bytes.is_empty());
    }
}
