//! Peer notifications and the durable profile-task queue.
//!
//! After a successful operation, a notification process fans out direct
//! messages to the peers of every affected user. Own peers only need the
//! transient ping (the profile is shared state); foreign users additionally
//! get a durable profile task appended to their DHT message queue, drained
//! by whichever of their peers receives the ping, or at their next login.
//!
//! Send failures reveal unfriendly logouts: peers that denied contact are
//! pruned from the own user's locations afterwards.

use crate::error::CoreError;
use crate::model::locations::Locations;
use crate::model::message_queue::{ProfileTask, UserMessageQueue};
use crate::model::tree::IndexKind;
use crate::network::content::{content_keys, NetworkContent};
use crate::network::data_manager::{AcceptanceReply, DataManager, MessageHandler};
use crate::network::messages::{DirectMessage, NotificationPayload, PeerAddress};
use crate::network::parameters::Parameters;
use crate::session::Session;
use meshvault_crypto::location_key;
use meshvault_process::{
    CancelToken, ProcessStep, RollbackReason, SequentialProcess, StepError, WithResult,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Produces the messages of one notification round.
pub trait MessageFactory: Send + Sync {
    /// Transient payload delivered to the peers of `receiver`.
    fn direct_payload(&self, receiver: &str) -> NotificationPayload;

    /// Durable task for foreign recipients, if the change concerns them.
    fn profile_task(&self) -> Option<ProfileTask>;
}

/// Factory carrying pre-built messages: own peers get the change ping,
/// foreign users carrying a durable task get a queue-check ping.
pub struct SimpleMessageFactory {
    own_user: String,
    payload: NotificationPayload,
    task: Option<ProfileTask>,
}

impl SimpleMessageFactory {
    pub fn new(
        own_user: impl Into<String>,
        payload: NotificationPayload,
        task: Option<ProfileTask>,
    ) -> Self {
        Self {
            own_user: own_user.into(),
            payload,
            task,
        }
    }
}

impl MessageFactory for SimpleMessageFactory {
    fn direct_payload(&self, receiver: &str) -> NotificationPayload {
        if receiver != self.own_user && self.task.is_some() {
            NotificationPayload::CheckMessageQueue {
                from_user: self.own_user.clone(),
            }
        } else {
            self.payload.clone()
        }
    }

    fn profile_task(&self) -> Option<ProfileTask> {
        self.task.clone()
    }
}

/// Delivery accounting of one notification round.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyStats {
    pub sent: usize,
    pub arrived: usize,
}

struct NotifyContext {
    locations: BTreeMap<String, Locations>,
    queue_lengths: BTreeMap<String, usize>,
    stats: NotifyStats,
    unreachable_own: Vec<PeerAddress>,
}

/// DHT round-trips for the locations record.
pub(crate) fn fetch_locations(
    data_manager: &Arc<dyn DataManager>,
    user_id: &str,
) -> Result<Option<Locations>, CoreError> {
    let params = Parameters::new(location_key(user_id.as_bytes()), content_keys::LOCATIONS);
    match data_manager.get(&params)? {
        Some(record) => Ok(Some(record.content.into_locations()?)),
        None => Ok(None),
    }
}

pub(crate) fn store_locations(
    data_manager: &Arc<dyn DataManager>,
    locations: &Locations,
    protection: &meshvault_crypto::KeyPair,
    ttl: Duration,
) -> Result<(), CoreError> {
    let params = Parameters::new(
        location_key(locations.user_id().as_bytes()),
        content_keys::LOCATIONS,
    )
    .with_data(NetworkContent::Locations(locations.clone()))
    .with_protection_keys(protection.clone())
    .with_ttl(ttl);
    data_manager.put(&params)
}

/// DHT round-trips for the message queue record. A missing record is an
/// empty queue.
pub(crate) fn fetch_queue(
    data_manager: &Arc<dyn DataManager>,
    user_id: &str,
) -> Result<UserMessageQueue, CoreError> {
    let params = Parameters::new(
        location_key(user_id.as_bytes()),
        content_keys::USER_MESSAGE_QUEUE,
    );
    match data_manager.get(&params)? {
        Some(record) => record.content.into_message_queue(),
        None => Ok(UserMessageQueue::new(user_id)),
    }
}

pub(crate) fn store_queue(
    data_manager: &Arc<dyn DataManager>,
    queue: &UserMessageQueue,
    ttl: Duration,
) -> Result<(), CoreError> {
    let params = Parameters::new(
        location_key(queue.user_id().as_bytes()),
        content_keys::USER_MESSAGE_QUEUE,
    )
    .with_data(NetworkContent::MessageQueue(queue.clone()))
    .with_ttl(ttl);
    data_manager.put(&params)
}

/// Build the notification process for a set of recipient user ids. The
/// typed result carries the delivery counts.
pub fn notify_process(
    session: Arc<Session>,
    factory: Arc<dyn MessageFactory>,
    recipients: BTreeSet<String>,
) -> WithResult<NotifyStats> {
    let context = Arc::new(Mutex::new(NotifyContext {
        locations: BTreeMap::new(),
        queue_lengths: BTreeMap::new(),
        stats: NotifyStats::default(),
        unreachable_own: Vec::new(),
    }));

    let mut process = SequentialProcess::new("notify");
    process
        .add_step(GetLocationsStep {
            session: session.clone(),
            recipients: recipients.clone(),
            context: context.clone(),
        })
        .add_step(PutProfileTasksStep {
            session: session.clone(),
            factory: factory.clone(),
            recipients: recipients.clone(),
            context: context.clone(),
        })
        .add_step(SendNotificationsStep {
            session: session.clone(),
            factory,
            recipients,
            context: context.clone(),
        })
        .add_step(CleanupLocationsStep {
            session,
            context: context.clone(),
        });

    WithResult::new(process, move || Some(context.lock().stats))
}

struct GetLocationsStep {
    session: Arc<Session>,
    recipients: BTreeSet<String>,
    context: Arc<Mutex<NotifyContext>>,
}

impl ProcessStep for GetLocationsStep {
    fn name(&self) -> &str {
        "get locations"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        for recipient in &self.recipients {
            match fetch_locations(self.session.data_manager(), recipient) {
                Ok(Some(locations)) => {
                    self.context
                        .lock()
                        .locations
                        .insert(recipient.clone(), locations);
                }
                Ok(None) => {
                    debug!(user = %recipient, "recipient has no locations record");
                }
                Err(e) => {
                    // One unreachable locations record must not silence the
                    // other recipients.
                    warn!(user = %recipient, error = %e, "could not fetch locations");
                }
            }
        }
        Ok(())
    }
}

struct PutProfileTasksStep {
    session: Arc<Session>,
    factory: Arc<dyn MessageFactory>,
    recipients: BTreeSet<String>,
    context: Arc<Mutex<NotifyContext>>,
}

impl ProcessStep for PutProfileTasksStep {
    fn name(&self) -> &str {
        "put profile tasks"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let Some(task) = self.factory.profile_task() else {
            return Ok(());
        };
        let own_user = self.session.user_id().to_string();

        for recipient in self.recipients.iter().filter(|r| **r != own_user) {
            let data_manager = self.session.data_manager();
            let mut queue = fetch_queue(data_manager, recipient)
                .map_err(|e| StepError::with_source("could not fetch message queue", e))?;
            self.context
                .lock()
                .queue_lengths
                .insert(recipient.clone(), queue.len());
            queue.push(task.clone());
            store_queue(data_manager, &queue, self.session.ttl().user_message_queue)
                .map_err(|e| StepError::with_source("could not store message queue", e))?;
            debug!(user = %recipient, "profile task queued");
        }
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        // Trim the queues back to their pre-step lengths.
        let lengths = std::mem::take(&mut self.context.lock().queue_lengths);
        for (recipient, length) in lengths {
            let data_manager = self.session.data_manager();
            let result = fetch_queue(data_manager, &recipient).and_then(|mut queue| {
                let mut tasks = queue.drain();
                tasks.truncate(length);
                for task in tasks {
                    queue.push(task);
                }
                store_queue(data_manager, &queue, self.session.ttl().user_message_queue)
            });
            if let Err(e) = result {
                warn!(user = %recipient, error = %e, "could not roll back profile task");
            }
        }
    }
}

struct SendNotificationsStep {
    session: Arc<Session>,
    factory: Arc<dyn MessageFactory>,
    recipients: BTreeSet<String>,
    context: Arc<Mutex<NotifyContext>>,
}

impl ProcessStep for SendNotificationsStep {
    fn name(&self) -> &str {
        "send notifications"
    }

    fn run(&mut self, cancel: &CancelToken) -> Result<(), StepError> {
        if self.recipients.is_empty() {
            return Ok(());
        }
        let own_user = self.session.user_id().to_string();
        let own_address = self.session.address().clone();
        let mut any_delivered = false;
        let mut any_peer_listed = false;

        for recipient in &self.recipients {
            if cancel.is_cancelled() {
                return Err(StepError::new("notification cancelled"));
            }

            let peers: Vec<PeerAddress> = {
                let context = self.context.lock();
                context
                    .locations
                    .get(recipient)
                    .map(|l| l.ordered_peers())
                    .unwrap_or_default()
            };
            if peers.is_empty() {
                debug!(user = %recipient, "no peers to notify");
                continue;
            }
            any_peer_listed = true;

            let message = DirectMessage {
                sender: own_address.clone(),
                sender_user: own_user.clone(),
                payload: self.factory.direct_payload(recipient),
            };

            if recipient == &own_user {
                // All own peers share the profile; each gets the ping. The
                // own address is not skipped: the overlay loops it back to
                // the local handler.
                for peer in peers {
                    let mut context = self.context.lock();
                    context.stats.sent += 1;
                    drop(context);
                    match self
                        .session
                        .data_manager()
                        .send_direct(&peer, message.clone())
                    {
                        Ok(AcceptanceReply::Ok) => {
                            self.context.lock().stats.arrived += 1;
                            any_delivered = true;
                        }
                        Ok(_) | Err(_) => {
                            warn!(peer = %peer, "own peer denied notification, scheduling cleanup");
                            self.context.lock().unreachable_own.push(peer);
                        }
                    }
                }
            } else {
                // Initial peer first, fall back through the rest until one
                // accepts; the durable task makes one delivery sufficient.
                let mut delivered = false;
                for peer in peers {
                    self.context.lock().stats.sent += 1;
                    match self
                        .session
                        .data_manager()
                        .send_direct(&peer, message.clone())
                    {
                        Ok(AcceptanceReply::Ok) => {
                            self.context.lock().stats.arrived += 1;
                            delivered = true;
                            break;
                        }
                        Ok(_) | Err(_) => {
                            debug!(peer = %peer, user = %recipient, "peer did not accept, trying next");
                        }
                    }
                }
                if delivered {
                    any_delivered = true;
                } else {
                    warn!(user = %recipient, "all peers of recipient exhausted");
                }
            }
        }

        // Only a complete failure fails the notification round.
        if any_peer_listed && !any_delivered {
            return Err(StepError::new("no recipient could be notified"));
        }
        Ok(())
    }
}

struct CleanupLocationsStep {
    session: Arc<Session>,
    context: Arc<Mutex<NotifyContext>>,
}

impl ProcessStep for CleanupLocationsStep {
    fn name(&self) -> &str {
        "clean up locations"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let unreachable = {
            let mut context = self.context.lock();
            std::mem::take(&mut context.unreachable_own)
        };
        if unreachable.is_empty() {
            return Ok(());
        }

        // Only the own locations can be pruned: writing another user's
        // record requires protection keys this session does not hold.
        let data_manager = self.session.data_manager();
        let mut locations = match fetch_locations(data_manager, self.session.user_id()) {
            Ok(Some(locations)) => locations,
            Ok(None) => return Ok(()),
            Err(e) => return Err(StepError::with_source("could not re-fetch locations", e)),
        };
        let before = locations.entries().len();
        locations.prune(&unreachable);

        let protection = self
            .session
            .profile_manager()
            .protection_keys()
            .map_err(|e| StepError::with_source("could not load protection keys", e))?;
        store_locations(
            data_manager,
            &locations,
            &protection,
            self.session.ttl().locations,
        )
        .map_err(|e| StepError::with_source("could not store pruned locations", e))?;

        info!(
            pruned = before - locations.entries().len(),
            "removed unreachable peers from locations"
        );
        Ok(())
    }
}

/// Receiver registered for the local peer address: acknowledges pings and
/// drains the durable task queue.
pub struct QueueMessageHandler {
    session: Arc<Session>,
}

impl QueueMessageHandler {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

impl MessageHandler for QueueMessageHandler {
    fn handle(&self, message: &DirectMessage) -> AcceptanceReply {
        debug!(
            from = %message.sender,
            user = %message.sender_user,
            "direct message received"
        );
        match &message.payload {
            NotificationPayload::CheckMessageQueue { .. } => {
                match process_message_queue(&self.session) {
                    Ok(applied) => {
                        if applied > 0 {
                            info!(applied, "applied queued profile tasks");
                        }
                        AcceptanceReply::Ok
                    }
                    Err(e) => {
                        warn!(error = %e, "could not process message queue");
                        AcceptanceReply::Failure
                    }
                }
            }
            // Same-user change pings: the profile is shared state, the next
            // profile get observes the change.
            _ => AcceptanceReply::Ok,
        }
    }
}

/// Drain the own task queue and apply every task to the own profile in one
/// modification cycle. Returns the number of applied tasks.
pub fn process_message_queue(session: &Arc<Session>) -> Result<usize, CoreError> {
    let data_manager = session.data_manager();
    let mut queue = fetch_queue(data_manager, session.user_id())?;
    if queue.is_empty() {
        return Ok(0);
    }
    let tasks = queue.drain();
    // Clear the slot first so a concurrent ping does not re-apply.
    store_queue(data_manager, &queue, session.ttl().user_message_queue)?;

    let manager = session.profile_manager();
    let pid = manager.new_process_id();
    let mut profile = manager.get_user_profile(pid, true)?;
    let mut applied = 0usize;
    for task in &tasks {
        match apply_task(&mut profile, task) {
            Ok(()) => applied += 1,
            Err(e) => warn!(error = %e, "skipping profile task"),
        }
    }
    manager.ready_to_put(profile, pid)?;
    Ok(applied)
}

fn apply_task(
    profile: &mut crate::model::profile::UserProfile,
    task: &ProfileTask,
) -> Result<(), CoreError> {
    let root = profile.tree().root();
    match task {
        ProfileTask::ShareFolder {
            from_user,
            folder_name,
            folder,
        } => {
            info!(from = %from_user, folder = %folder_name, "adopting shared folder");
            profile
                .tree_mut()
                .adopt_subtree(root, folder_name.clone(), folder)?;
            Ok(())
        }
        ProfileTask::IndexAdded {
            path, keys, digest, ..
        } => {
            let path = Path::new(path);
            let parent = path
                .parent()
                .and_then(|p| profile.tree().find_by_path(p))
                .ok_or_else(|| {
                    CoreError::IllegalFileLocation("unknown parent of added index".to_string())
                })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| CoreError::IllegalFileLocation("nameless index".to_string()))?;
            profile
                .tree_mut()
                .add_file(parent, name, keys.clone(), *digest)?;
            Ok(())
        }
        ProfileTask::FolderAdded { path, keys, .. } => {
            let path = Path::new(path);
            let parent = path
                .parent()
                .and_then(|p| profile.tree().find_by_path(p))
                .ok_or_else(|| {
                    CoreError::IllegalFileLocation("unknown parent of added folder".to_string())
                })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| CoreError::IllegalFileLocation("nameless folder".to_string()))?;
            profile.tree_mut().add_folder(parent, name, keys.clone())?;
            Ok(())
        }
        ProfileTask::IndexUpdated { path, digest, .. } => {
            let node = profile
                .tree()
                .find_by_path(Path::new(path))
                .ok_or_else(|| {
                    CoreError::IllegalFileLocation(format!("unknown index '{path}'"))
                })?;
            if let Some(node) = profile.tree_mut().node_mut(node) {
                if let IndexKind::File { digest: current } = &mut node.kind {
                    *current = *digest;
                }
            }
            Ok(())
        }
        ProfileTask::IndexRemoved { path, .. } => {
            let node = profile
                .tree()
                .find_by_path(Path::new(path))
                .ok_or_else(|| {
                    CoreError::IllegalFileLocation(format!("unknown index '{path}'"))
                })?;
            profile.tree_mut().remove(node)?;
            Ok(())
        }
        ProfileTask::IndexMoved {
            from_path, to_path, ..
        } => {
            let node = profile
                .tree()
                .find_by_path(Path::new(from_path))
                .ok_or_else(|| {
                    CoreError::IllegalFileLocation(format!("unknown index '{from_path}'"))
                })?;
            let to = Path::new(to_path);
            let parent = to
                .parent()
                .and_then(|p| profile.tree().find_by_path(p))
                .ok_or_else(|| {
                    CoreError::IllegalFileLocation("unknown destination parent".to_string())
                })?;
            let name = to
                .file_name()
                .map(|n| n.to_string_lossy().to_string());
            profile.tree_mut().move_node(node, parent, name)?;
            Ok(())
        }
    }
}
