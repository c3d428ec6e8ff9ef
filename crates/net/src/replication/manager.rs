use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Mutex, PoisonError};

use crate::message::{IncomingMessage, MessageClass, OutgoingMessage};
use crate::net::{ConnectionRegistry, GroupId, PeerId, RecipientFilter, sequence_greater_than};
use crate::wire::{WireEncode, WireReader, WireWriter};

use super::entity::{Entity, EntityType};
use super::error::ReplicationError;
use super::role::{Client, Role, Server};
use super::variable::{Binding, ChangeNotifier, ReplicatedVariable};
use super::{EntityId, ReplicationConfig, VariableIndex};

const LOG_TARGET: &str = "tether::replication";

pub const ENTITY_CREATE: &str = "EntityCreate";
pub const ENTITY_UPDATE: &str = "EntityUpdate";
pub const ENTITY_DESTROY: &str = "EntityDestroy";

/// Every variable count fits in the update header's count byte.
const MAX_VARIABLES_PER_UPDATE: usize = u8::MAX as usize;

/// Updates held per entity while its create is still in flight.
const MAX_DEFERRED_UPDATES: usize = 64;

/// How far behind the newest sequence an update may arrive and still count
/// as a late delivery rather than a wrap.
const REORDER_WINDOW: u16 = 4096;

/// Client baselines older than this are dropped, keeping every comparison
/// inside half the sequence space.
const MAX_SEQUENCE_AGE: u16 = 16384;
const EXPIRY_INTERVAL: u16 = 8192;

pub type ServerEntityManager = EntityManager<Server>;
pub type ClientEntityManager = EntityManager<Client>;

/// Messages bound for the peers of one group combination. An empty group
/// set means every connected peer.
#[derive(Debug)]
pub struct ReplicationBatch {
    pub groups: BTreeSet<GroupId>,
    pub messages: Vec<OutgoingMessage>,
}

impl ReplicationBatch {
    pub fn filter(&self, registry: &ConnectionRegistry) -> RecipientFilter {
        let mut filter = RecipientFilter::new();
        if self.groups.is_empty() {
            filter.add_all_users(registry);
        } else {
            for &group in &self.groups {
                filter.add_group(registry, group);
            }
        }
        filter
    }

    /// Whether `peer_groups` makes a peer one of this batch's recipients.
    pub fn reaches(&self, peer_groups: &BTreeSet<GroupId>) -> bool {
        self.groups.is_empty() || !self.groups.is_disjoint(peer_groups)
    }
}

#[derive(Clone, Copy)]
struct Factory {
    create: fn() -> Box<dyn Entity>,
    variables: &'static [&'static str],
}

fn create_boxed<T: EntityType>() -> Box<dyn Entity> {
    Box::new(T::create())
}

struct EntityRecord {
    type_name: &'static str,
    groups: BTreeSet<GroupId>,
    entity: Box<dyn Entity>,
}

/// Arena of entities addressed by [`EntityId`]. Variables point back at
/// their entity through `(EntityId, VariableIndex)` handles and a shared
/// [`ChangeNotifier`], never through references.
pub struct EntityManager<R: Role> {
    config: ReplicationConfig,
    factories: HashMap<&'static str, Factory>,
    slots: Vec<Option<EntityRecord>>,
    notifier: ChangeNotifier,
    free_ids: Mutex<VecDeque<EntityId>>,
    spawned: Vec<EntityId>,
    destroyed: Vec<(EntityId, BTreeSet<GroupId>)>,
    sequence: u16,
    mirror: MirrorState,
    _role: PhantomData<R>,
}

/// Client bookkeeping for entity messages that arrive out of order.
#[derive(Debug, Default)]
struct MirrorState {
    /// Update bodies (after the id) for entities not created yet.
    deferred: BTreeMap<EntityId, Vec<Vec<u8>>>,
    /// Destroys that overtook their create.
    early_destroys: BTreeSet<EntityId>,
    /// Destroyed since their last create; late updates are discarded.
    retired: BTreeSet<EntityId>,
    newest_sequence: Option<u16>,
    last_expiry: u16,
}

impl<R: Role> EntityManager<R> {
    pub fn new(config: ReplicationConfig) -> Self {
        let max = config.max_entities.min(usize::from(u16::MAX) + 1);
        let free_ids: VecDeque<EntityId> = (0..max).map(|id| EntityId(id as u16)).collect();
        Self {
            config,
            factories: HashMap::new(),
            slots: Vec::new(),
            notifier: ChangeNotifier::new(),
            free_ids: Mutex::new(free_ids),
            spawned: Vec::new(),
            destroyed: Vec::new(),
            sequence: 0,
            mirror: MirrorState::default(),
            _role: PhantomData,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn register<T: EntityType>(&mut self) {
        log::debug!(
            target: LOG_TARGET,
            "{} registered entity type {} ({} variables)",
            R::NAME,
            T::TYPE_NAME,
            T::VARIABLES.len()
        );
        self.factories.insert(
            T::TYPE_NAME,
            Factory {
                create: create_boxed::<T>,
                variables: T::VARIABLES,
            },
        );
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn get_entity(&self, id: EntityId) -> Option<&dyn Entity> {
        self.record(id).map(|record| &*record.entity)
    }

    pub fn get_entity_mut(&mut self, id: EntityId) -> Option<&mut (dyn Entity + 'static)> {
        self.record_mut(id).map(|record| record.entity.as_mut())
    }

    pub fn get<T: EntityType>(&self, id: EntityId) -> Option<&T> {
        self.get_entity(id)?.as_any().downcast_ref::<T>()
    }

    pub fn get_mut<T: EntityType>(&mut self, id: EntityId) -> Option<&mut T> {
        self.get_entity_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    pub fn type_name(&self, id: EntityId) -> Option<&'static str> {
        self.record(id).map(|record| record.type_name)
    }

    pub fn groups(&self, id: EntityId) -> Option<&BTreeSet<GroupId>> {
        self.record(id).map(|record| &record.groups)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.record(id).is_some()
    }

    pub fn entity_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| EntityId(id as u16))
            .collect()
    }

    /// Sequence stamped on the most recent update tick.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    fn record(&self, id: EntityId) -> Option<&EntityRecord> {
        self.slots.get(usize::from(id.0))?.as_ref()
    }

    fn record_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        self.slots.get_mut(usize::from(id.0))?.as_mut()
    }

    /// Builds an entity from its factory and binds each variable to its
    /// declared name and index.
    fn instantiate(
        &self,
        type_name: &str,
        id: EntityId,
        notifier: Option<&ChangeNotifier>,
    ) -> Result<EntityRecord, ReplicationError> {
        let (&key, factory) = self
            .factories
            .get_key_value(type_name)
            .ok_or_else(|| ReplicationError::UnknownType(type_name.to_owned()))?;

        let mut entity = (factory.create)();
        let mut variables = entity.variables_mut();
        if variables.len() != factory.variables.len() || variables.len() > MAX_VARIABLES_PER_UPDATE {
            return Err(ReplicationError::VariableMismatch {
                type_name: key,
                expected: factory.variables.len(),
                found: variables.len(),
            });
        }

        for (index, (variable, name)) in variables.iter_mut().zip(factory.variables).enumerate() {
            variable.bind(
                name,
                Binding {
                    entity: id,
                    index: VariableIndex(index as u8),
                    notifier: notifier.cloned(),
                },
            );
        }
        drop(variables);

        Ok(EntityRecord {
            type_name: key,
            groups: BTreeSet::new(),
            entity,
        })
    }

    fn place(&mut self, id: EntityId, record: EntityRecord) -> Option<EntityRecord> {
        let index = usize::from(id.0);
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index].replace(record)
    }

    fn take(&mut self, id: EntityId) -> Option<EntityRecord> {
        self.slots.get_mut(usize::from(id.0))?.take()
    }

    fn lock_free_ids(&self) -> std::sync::MutexGuard<'_, VecDeque<EntityId>> {
        self.free_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EntityManager<Server> {
    pub fn create_entity_by_name(&mut self, type_name: &str) -> Result<EntityId, ReplicationError> {
        if !self.factories.contains_key(type_name) {
            log::warn!(target: LOG_TARGET, "Cannot create unknown entity type {:?}", type_name);
            return Err(ReplicationError::UnknownType(type_name.to_owned()));
        }

        let Some(id) = self.lock_free_ids().pop_front() else {
            log::warn!(
                target: LOG_TARGET,
                "Cannot create {}: all {} entity ids in use",
                type_name,
                self.config.max_entities
            );
            return Err(ReplicationError::PoolExhausted {
                max: self.config.max_entities,
            });
        };

        let notifier = self.notifier.clone();
        let record = match self.instantiate(type_name, id, Some(&notifier)) {
            Ok(record) => record,
            Err(e) => {
                log::error!(target: LOG_TARGET, "Failed to create {}: {}", type_name, e);
                self.lock_free_ids().push_front(id);
                return Err(e);
            }
        };

        self.place(id, record);
        self.spawned.push(id);
        log::debug!(target: LOG_TARGET, "Created {} {}", type_name, id);
        Ok(id)
    }

    pub fn create_entity<T: EntityType>(&mut self) -> Result<EntityId, ReplicationError> {
        if !self.is_registered(T::TYPE_NAME) {
            self.register::<T>();
        }
        self.create_entity_by_name(T::TYPE_NAME)
    }

    /// Frees the id and queues a destroy for peers that saw the entity.
    pub fn destroy_entity(&mut self, id: EntityId) -> Result<(), ReplicationError> {
        let Some(record) = self.take(id) else {
            log::warn!(target: LOG_TARGET, "Cannot destroy unknown {}", id);
            return Err(ReplicationError::UnknownEntity(id));
        };

        self.notifier.forget(id);
        if let Some(position) = self.spawned.iter().position(|&spawned| spawned == id) {
            // never announced, nothing to retract
            self.spawned.remove(position);
        } else {
            self.destroyed.push((id, record.groups));
        }
        self.lock_free_ids().push_back(id);
        log::debug!(target: LOG_TARGET, "Destroyed {} {}", record.type_name, id);
        Ok(())
    }

    /// Restricts replication of `id` to peers in any of `groups`. An empty
    /// set replicates to everyone.
    pub fn set_groups<I>(&mut self, id: EntityId, groups: I) -> Result<(), ReplicationError>
    where
        I: IntoIterator<Item = GroupId>,
    {
        let record = self
            .record_mut(id)
            .ok_or(ReplicationError::UnknownEntity(id))?;
        record.groups = groups.into_iter().collect();
        Ok(())
    }

    pub fn on_variable_change(&self, entity: EntityId, index: VariableIndex) {
        self.notifier.notify_variable_changed(entity, index);
    }

    pub fn free_ids(&self) -> usize {
        self.lock_free_ids().len()
    }

    /// Drains pending destroys, creates and variable changes into one batch
    /// per group combination. Dirty flags are cleared.
    pub fn collect_updates(&mut self) -> Vec<ReplicationBatch> {
        let mut batches: BTreeMap<BTreeSet<GroupId>, Vec<OutgoingMessage>> = BTreeMap::new();

        for (id, groups) in std::mem::take(&mut self.destroyed) {
            let mut message = OutgoingMessage::entity(ENTITY_DESTROY);
            message.write(&id.0);
            batches.entry(groups).or_default().push(message);
        }

        for id in std::mem::take(&mut self.spawned) {
            if let Some(record) = self.record(id) {
                let message = create_message(id, record.type_name);
                batches.entry(record.groups.clone()).or_default().push(message);
            }
        }

        let changed = self.notifier.take();
        if !changed.is_empty() {
            self.sequence = self.sequence.wrapping_add(1);
        }
        let sequence = self.sequence;
        let max_message_size = self.config.max_message_size;

        for (id, indices) in changed {
            let Some(record) = self.record_mut(id) else {
                continue;
            };
            let mut variables = record.entity.variables_mut();
            let mut chunks = Vec::new();
            for (index, variable) in variables.iter_mut().enumerate() {
                if !indices.contains(&VariableIndex(index as u8)) || !variable.is_dirty() {
                    continue;
                }
                variable.clear_dirty();
                match encode_variable(&**variable, max_message_size) {
                    Some(chunk) => chunks.push(chunk),
                    None => log::error!(
                        target: LOG_TARGET,
                        "{} variable {} does not fit in a {} byte update",
                        id,
                        variable.name(),
                        max_message_size
                    ),
                }
            }
            drop(variables);

            let groups = record.groups.clone();
            let messages = update_messages(id, sequence, &chunks, max_message_size);
            if !messages.is_empty() {
                log::trace!(
                    target: LOG_TARGET,
                    "{} update seq {}: {} variables in {} messages",
                    id,
                    sequence,
                    chunks.len(),
                    messages.len()
                );
                batches.entry(groups).or_default().extend(messages);
            }
        }

        batches
            .into_iter()
            .map(|(groups, messages)| ReplicationBatch { groups, messages })
            .collect()
    }

    /// Collects this tick's changes and sends each batch reliably to the
    /// peers its groups select. Returns the number of message deliveries.
    pub fn replicate(&mut self, registry: &ConnectionRegistry) -> usize {
        let mut sent = 0;
        for batch in self.collect_updates() {
            let mut filter = batch.filter(registry);
            if filter.is_empty() {
                continue;
            }
            for message in &batch.messages {
                sent += message.send(&mut filter, registry);
            }
        }
        sent
    }

    /// Create plus a full update for every live entity, for a peer that
    /// has seen nothing yet. Dirty state is left alone.
    pub fn full_state(&self) -> Vec<ReplicationBatch> {
        let mut batches: BTreeMap<BTreeSet<GroupId>, Vec<OutgoingMessage>> = BTreeMap::new();
        let max_message_size = self.config.max_message_size;

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(record) = slot else {
                continue;
            };
            let id = EntityId(index as u16);
            let messages = batches.entry(record.groups.clone()).or_default();
            messages.push(create_message(id, record.type_name));

            let chunks: Vec<Vec<u8>> = record
                .entity
                .variables()
                .into_iter()
                .filter_map(|variable| encode_variable(variable, max_message_size))
                .collect();
            messages.extend(update_messages(id, self.sequence, &chunks, max_message_size));
        }

        batches
            .into_iter()
            .map(|(groups, messages)| ReplicationBatch { groups, messages })
            .collect()
    }

    /// Sends [`full_state`](Self::full_state) to one peer, limited to the
    /// entities its groups can see.
    pub fn send_full_state(
        &self,
        registry: &ConnectionRegistry,
        peer: PeerId,
        peer_groups: &BTreeSet<GroupId>,
    ) -> usize {
        let mut filter = RecipientFilter::single(peer);
        let mut sent = 0;
        for batch in self.full_state() {
            if !batch.reaches(peer_groups) {
                continue;
            }
            for message in &batch.messages {
                sent += message.send(&mut filter, registry);
            }
        }
        sent
    }
}

impl EntityManager<Client> {
    /// Applies one entity message from the server.
    pub fn apply_message(&mut self, message: &mut IncomingMessage<'_>) -> Result<(), ReplicationError> {
        if message.class() != MessageClass::Entity {
            return Err(ReplicationError::NotEntityMessage);
        }

        let name = message.name().to_owned();
        let result = match name.as_str() {
            ENTITY_CREATE => self.apply_create(message),
            ENTITY_UPDATE => self.apply_update(message),
            ENTITY_DESTROY => self.apply_destroy(message),
            other => Err(ReplicationError::UnknownMessage(other.to_owned())),
        };
        if let Err(e) = &result {
            log::warn!(target: LOG_TARGET, "Dropping {} message: {}", name, e);
        }
        result
    }

    pub fn apply_bytes(&mut self, payload: &[u8]) -> Result<(), ReplicationError> {
        let mut message = IncomingMessage::parse(payload)?;
        self.apply_message(&mut message)
    }

    fn apply_create(&mut self, message: &mut IncomingMessage<'_>) -> Result<(), ReplicationError> {
        let id = EntityId(message.try_read::<u16>()?);
        let type_name = message.try_read::<String>()?;
        if self.mirror.early_destroys.remove(&id) {
            self.mirror.deferred.remove(&id);
            log::debug!(target: LOG_TARGET, "Skipping {} {}, already destroyed", type_name, id);
            return Ok(());
        }

        let record = match self.instantiate(&type_name, id, None) {
            Ok(record) => record,
            Err(e) => {
                self.mirror.deferred.remove(&id);
                return Err(e);
            }
        };
        if self.place(id, record).is_some() {
            log::debug!(target: LOG_TARGET, "Recreated {} as {}", id, type_name);
        } else {
            log::debug!(target: LOG_TARGET, "Mirrored {} {}", type_name, id);
        }
        self.mirror.retired.remove(&id);

        for body in self.mirror.deferred.remove(&id).unwrap_or_default() {
            if let Err(e) = self.apply_variables(id, &mut WireReader::new(&body)) {
                log::warn!(target: LOG_TARGET, "Dropping deferred update for {}: {}", id, e);
            }
        }
        Ok(())
    }

    fn apply_update(&mut self, message: &mut IncomingMessage<'_>) -> Result<(), ReplicationError> {
        let id = EntityId(message.try_read::<u16>()?);
        if self.contains(id) {
            return self.apply_variables(id, message.reader());
        }
        self.defer_update(id, message.reader().rest())
    }

    /// Holds an update that overtook its create.
    fn defer_update(&mut self, id: EntityId, body: &[u8]) -> Result<(), ReplicationError> {
        if usize::from(id.0) >= self.config.max_entities {
            return Err(ReplicationError::UnknownEntity(id));
        }
        if self.mirror.early_destroys.contains(&id) || self.mirror.retired.contains(&id) {
            log::debug!(target: LOG_TARGET, "Discarding update for destroyed {}", id);
            return Ok(());
        }

        let deferred = self.mirror.deferred.entry(id).or_default();
        if deferred.len() >= MAX_DEFERRED_UPDATES {
            log::warn!(target: LOG_TARGET, "Too many updates waiting on {}, dropping oldest", id);
            deferred.remove(0);
        }
        deferred.push(body.to_vec());
        log::debug!(target: LOG_TARGET, "Deferred update for {} until it is created", id);
        Ok(())
    }

    fn apply_variables(
        &mut self,
        id: EntityId,
        reader: &mut WireReader<'_>,
    ) -> Result<(), ReplicationError> {
        let sequence = reader.try_read::<u16>()?;
        let count = reader.try_read::<u8>()?;
        self.observe_sequence(sequence);

        let record = self
            .slots
            .get_mut(usize::from(id.0))
            .and_then(Option::as_mut)
            .ok_or(ReplicationError::UnknownEntity(id))?;
        let mut variables = record.entity.variables_mut();

        for _ in 0..count {
            let name = reader.try_read::<String>()?;
            let variable = variables
                .iter_mut()
                .find(|variable| variable.name() == name)
                .ok_or(ReplicationError::UnknownVariable { entity: id, name })?;
            if !variable.apply_update(reader, sequence)? {
                log::debug!(
                    target: LOG_TARGET,
                    "Ignored stale update {} for {}.{}",
                    sequence,
                    id,
                    variable.name()
                );
            }
        }
        Ok(())
    }

    /// Tracks the newest sequence seen and periodically expires baselines
    /// of variables that have been quiet for a long time.
    fn observe_sequence(&mut self, sequence: u16) {
        let Some(newest) = self.mirror.newest_sequence else {
            self.mirror.newest_sequence = Some(sequence);
            self.mirror.last_expiry = sequence;
            return;
        };

        let behind = newest.wrapping_sub(sequence);
        if behind <= REORDER_WINDOW {
            return;
        }
        self.mirror.newest_sequence = Some(sequence);

        let gap = !sequence_greater_than(sequence, newest);
        if !gap && sequence.wrapping_sub(self.mirror.last_expiry) < EXPIRY_INTERVAL {
            return;
        }

        // a jump past the reorder window means every baseline is older than it looks
        let max_age = if gap { 0 } else { MAX_SEQUENCE_AGE };
        self.mirror.last_expiry = sequence;
        for record in self.slots.iter_mut().flatten() {
            for variable in record.entity.variables_mut() {
                variable.expire_sequence(sequence, max_age);
            }
        }
        log::trace!(target: LOG_TARGET, "Expired variable baselines at sequence {}", sequence);
    }

    fn apply_destroy(&mut self, message: &mut IncomingMessage<'_>) -> Result<(), ReplicationError> {
        let id = EntityId(message.try_read::<u16>()?);
        match self.take(id) {
            Some(record) => {
                self.mirror.retired.insert(id);
                log::debug!(target: LOG_TARGET, "Removed mirrored {} {}", record.type_name, id);
            }
            None if usize::from(id.0) < self.config.max_entities => {
                self.mirror.deferred.remove(&id);
                self.mirror.early_destroys.insert(id);
                log::debug!(target: LOG_TARGET, "Destroy for {} arrived before its create", id);
            }
            None => return Err(ReplicationError::UnknownEntity(id)),
        }
        Ok(())
    }
}

fn create_message(id: EntityId, type_name: &str) -> OutgoingMessage {
    let mut message = OutgoingMessage::entity(ENTITY_CREATE);
    message.write(&id.0).write_string(type_name);
    message
}

/// `name` then value, as one unit that is never split across messages.
/// `None` when that unit alone overflows an update.
fn encode_variable(variable: &dyn ReplicatedVariable, max_message_size: usize) -> Option<Vec<u8>> {
    let mut writer = WireWriter::new(max_message_size.saturating_sub(update_header_len()));
    if !writer.write(variable.name()) || !variable.write_value(&mut writer) {
        return None;
    }
    Some(writer.into_bytes())
}

fn update_header_len() -> usize {
    1 + ENTITY_UPDATE.encoded_len() + 2 + 2 + 1
}

/// Packs encoded variables into as few updates as `max_message_size`
/// allows.
fn update_messages(
    id: EntityId,
    sequence: u16,
    chunks: &[Vec<u8>],
    max_message_size: usize,
) -> Vec<OutgoingMessage> {
    let budget = max_message_size.saturating_sub(update_header_len());
    let mut messages = Vec::new();
    let mut pending: Vec<&[u8]> = Vec::new();
    let mut size = 0;

    for chunk in chunks {
        let full = size + chunk.len() > budget || pending.len() == MAX_VARIABLES_PER_UPDATE;
        if !pending.is_empty() && full {
            messages.push(update_message(id, sequence, &pending, max_message_size));
            pending.clear();
            size = 0;
        }
        size += chunk.len();
        pending.push(chunk);
    }
    if !pending.is_empty() {
        messages.push(update_message(id, sequence, &pending, max_message_size));
    }
    messages
}

fn update_message(
    id: EntityId,
    sequence: u16,
    chunks: &[&[u8]],
    max_message_size: usize,
) -> OutgoingMessage {
    let mut message =
        OutgoingMessage::with_capacity(MessageClass::Entity, ENTITY_UPDATE, max_message_size);
    message
        .write(&id.0)
        .write(&sequence)
        .write(&(chunks.len() as u8));
    for chunk in chunks {
        message.write_array(chunk);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Variable;

    #[derive(Debug)]
    struct Crate {
        weight: Variable<u16>,
        label: Variable<String>,
    }

    impl Entity for Crate {
        fn variables(&self) -> Vec<&dyn ReplicatedVariable> {
            vec![&self.weight as &dyn ReplicatedVariable, &self.label]
        }

        fn variables_mut(&mut self) -> Vec<&mut dyn ReplicatedVariable> {
            vec![&mut self.weight as &mut dyn ReplicatedVariable, &mut self.label]
        }
    }

    impl EntityType for Crate {
        const TYPE_NAME: &'static str = "Crate";
        const VARIABLES: &'static [&'static str] = &["Weight", "Label"];

        fn create() -> Self {
            Self {
                weight: Variable::new(10),
                label: Variable::new(String::new()),
            }
        }
    }

    struct Broken {
        only: Variable<u8>,
    }

    impl Entity for Broken {
        fn variables(&self) -> Vec<&dyn ReplicatedVariable> {
            vec![&self.only]
        }

        fn variables_mut(&mut self) -> Vec<&mut dyn ReplicatedVariable> {
            vec![&mut self.only]
        }
    }

    impl EntityType for Broken {
        const TYPE_NAME: &'static str = "Broken";
        const VARIABLES: &'static [&'static str] = &["A", "B"];

        fn create() -> Self {
            Self {
                only: Variable::new(0),
            }
        }
    }

    fn server(max_entities: usize) -> ServerEntityManager {
        let mut manager = ServerEntityManager::new(ReplicationConfig {
            max_entities,
            ..Default::default()
        });
        manager.register::<Crate>();
        manager
    }

    fn mirror(server: &mut ServerEntityManager, client: &mut ClientEntityManager) {
        for batch in server.collect_updates() {
            for message in batch.messages {
                client.apply_bytes(&message.into_bytes().unwrap()).unwrap();
            }
        }
    }

    #[test]
    fn test_create_binds_declared_names() {
        let mut manager = server(4);
        let id = manager.create_entity_by_name("Crate").unwrap();

        let entity = manager.get_entity(id).unwrap();
        let names: Vec<&str> = entity.variables().iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["Weight", "Label"]);
        assert_eq!(manager.type_name(id), Some("Crate"));
        assert_eq!(manager.get::<Crate>(id).map(|c| *c.weight.get()), Some(10));
    }

    #[test]
    fn creation_errors() {
        let mut manager = server(1);
        manager.register::<Broken>();

        assert_eq!(
            manager.create_entity_by_name("Barrel"),
            Err(ReplicationError::UnknownType("Barrel".into()))
        );
        assert!(matches!(
            manager.create_entity_by_name("Broken"),
            Err(ReplicationError::VariableMismatch { expected: 2, found: 1, .. })
        ));
        assert_eq!(manager.free_ids(), 1);

        manager.create_entity_by_name("Crate").unwrap();
        assert_eq!(
            manager.create_entity_by_name("Crate"),
            Err(ReplicationError::PoolExhausted { max: 1 })
        );
    }

    #[test]
    fn destroyed_ids_return_to_pool() {
        let mut manager = server(1);
        let id = manager.create_entity::<Crate>().unwrap();
        manager.collect_updates();

        manager.destroy_entity(id).unwrap();
        assert_eq!(manager.destroy_entity(id), Err(ReplicationError::UnknownEntity(id)));
        assert_eq!(manager.free_ids(), 1);

        let batches = manager.collect_updates();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].messages[0].name(), ENTITY_DESTROY);
        assert!(manager.create_entity::<Crate>().is_ok());
    }

    #[test]
    fn unannounced_destroy_sends_nothing() {
        let mut manager = server(2);
        let id = manager.create_entity::<Crate>().unwrap();
        manager.destroy_entity(id).unwrap();
        assert!(manager.collect_updates().is_empty());
    }

    #[test]
    fn only_dirty_variables_are_sent() {
        let mut manager = server(2);
        let id = manager.create_entity::<Crate>().unwrap();
        manager.collect_updates();

        manager.get_mut::<Crate>(id).unwrap().label.set("fragile".into());
        let batches = manager.collect_updates();
        let message = &batches[0].messages[0];
        let bytes = message.bytes().to_vec();

        let mut incoming = IncomingMessage::parse(&bytes).unwrap();
        assert_eq!(incoming.name(), ENTITY_UPDATE);
        assert_eq!(incoming.read::<u16>(), id.0);
        assert_eq!(incoming.read::<u16>(), manager.sequence());
        assert_eq!(incoming.read_byte(), 1);
        assert_eq!(incoming.read_string(), "Label");
        assert_eq!(incoming.read_string(), "fragile");
        assert!(!manager.get::<Crate>(id).unwrap().label.is_dirty());
    }

    #[test]
    fn groups_split_batches() {
        let mut manager = server(4);
        let open = manager.create_entity::<Crate>().unwrap();
        let red = manager.create_entity::<Crate>().unwrap();
        manager.set_groups(red, [GroupId(1)]).unwrap();

        let batches = manager.collect_updates();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].groups.is_empty());
        assert_eq!(batches[1].groups, BTreeSet::from([GroupId(1)]));
        assert!(batches[1].reaches(&BTreeSet::from([GroupId(1), GroupId(2)])));
        assert!(!batches[1].reaches(&BTreeSet::from([GroupId(2)])));
        assert!(manager.contains(open));
        assert_eq!(
            manager.set_groups(EntityId(99), [GroupId(1)]),
            Err(ReplicationError::UnknownEntity(EntityId(99)))
        );
    }

    #[test]
    fn large_updates_split() {
        let mut manager = ServerEntityManager::new(ReplicationConfig {
            max_entities: 1,
            max_message_size: 40,
        });
        let id = manager.create_entity::<Crate>().unwrap();
        manager.collect_updates();

        let crate_entity = manager.get_mut::<Crate>(id).unwrap();
        crate_entity.weight.set(99);
        crate_entity.label.set("twelve chars".into());
        let messages: Vec<OutgoingMessage> = manager
            .collect_updates()
            .into_iter()
            .flat_map(|batch| batch.messages)
            .collect();

        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.len() <= 40));
    }

    #[test]
    fn client_mirrors_server() {
        let mut server = server(4);
        let mut client = ClientEntityManager::new(ReplicationConfig::default());
        client.register::<Crate>();

        let id = server.create_entity::<Crate>().unwrap();
        server.get_mut::<Crate>(id).unwrap().weight.set(55);
        mirror(&mut server, &mut client);
        assert_eq!(client.get::<Crate>(id).map(|c| *c.weight.get()), Some(55));

        server.destroy_entity(id).unwrap();
        mirror(&mut server, &mut client);
        assert!(!client.contains(id));
    }

    #[test]
    fn full_state_carries_every_variable() {
        let mut server = server(4);
        let id = server.create_entity::<Crate>().unwrap();
        server.get_mut::<Crate>(id).unwrap().label.set("late".into());
        server.collect_updates();

        let mut client = ClientEntityManager::new(ReplicationConfig::default());
        client.register::<Crate>();
        for batch in server.full_state() {
            for message in batch.messages {
                client.apply_bytes(message.bytes()).unwrap();
            }
        }
        let mirrored = client.get::<Crate>(id).unwrap();
        assert_eq!(*mirrored.weight.get(), 10);
        assert_eq!(mirrored.label.get(), "late");
    }

    #[test]
    fn client_rejects_unknown_targets() {
        let mut client = ClientEntityManager::new(ReplicationConfig {
            max_entities: 8,
            ..Default::default()
        });
        client.register::<Crate>();

        let mut outside = OutgoingMessage::entity(ENTITY_UPDATE);
        outside.write(&8u16).write(&1u16).write_byte(0);
        assert_eq!(
            client.apply_bytes(outside.bytes()),
            Err(ReplicationError::UnknownEntity(EntityId(8)))
        );

        let mut create = OutgoingMessage::entity(ENTITY_CREATE);
        create.write(&7u16).write_string("Crate");
        client.apply_bytes(create.bytes()).unwrap();

        let mut bad = OutgoingMessage::entity(ENTITY_UPDATE);
        bad.write(&7u16).write(&1u16).write_byte(1).write_string("Colour");
        assert_eq!(
            client.apply_bytes(bad.bytes()),
            Err(ReplicationError::UnknownVariable {
                entity: EntityId(7),
                name: "Colour".into(),
            })
        );

        let user = OutgoingMessage::user("Chat");
        assert_eq!(
            client.apply_bytes(user.bytes()),
            Err(ReplicationError::NotEntityMessage)
        );
    }

    fn client() -> ClientEntityManager {
        let mut client = ClientEntityManager::new(ReplicationConfig::default());
        client.register::<Crate>();
        client
    }

    fn tick_bytes(server: &mut ServerEntityManager) -> Vec<Vec<u8>> {
        server
            .collect_updates()
            .into_iter()
            .flat_map(|batch| batch.messages)
            .map(|message| message.into_bytes().unwrap())
            .collect()
    }

    #[test]
    fn test_update_before_create_applies_once_created() {
        let mut server = server(4);
        let id = server.create_entity::<Crate>().unwrap();
        server.get_mut::<Crate>(id).unwrap().label.set("ada".into());
        let first = tick_bytes(&mut server);
        assert_eq!(first.len(), 2);

        server.get_mut::<Crate>(id).unwrap().weight.set(3);
        let second = tick_bytes(&mut server);

        let mut client = client();
        client.apply_bytes(&second[0]).unwrap();
        client.apply_bytes(&first[1]).unwrap();
        assert!(!client.contains(id));

        client.apply_bytes(&first[0]).unwrap();
        let mirrored = client.get::<Crate>(id).unwrap();
        assert_eq!(mirrored.label.get(), "ada");
        assert_eq!(*mirrored.weight.get(), 3);
    }

    #[test]
    fn test_destroy_before_create_leaves_nothing() {
        let mut server = server(4);
        let id = server.create_entity::<Crate>().unwrap();
        server.get_mut::<Crate>(id).unwrap().weight.set(1);
        let created = tick_bytes(&mut server);
        server.destroy_entity(id).unwrap();
        let destroyed = tick_bytes(&mut server);

        let mut client = client();
        client.apply_bytes(&destroyed[0]).unwrap();
        client.apply_bytes(&created[1]).unwrap();
        client.apply_bytes(&created[0]).unwrap();
        assert!(!client.contains(id));
        assert_eq!(client.entity_count(), 0);
    }

    #[test]
    fn late_update_after_destroy_is_discarded() {
        let mut server = server(4);
        let id = server.create_entity::<Crate>().unwrap();
        let created = tick_bytes(&mut server);
        server.get_mut::<Crate>(id).unwrap().label.set("old".into());
        let updated = tick_bytes(&mut server);
        server.destroy_entity(id).unwrap();
        let destroyed = tick_bytes(&mut server);

        let mut client = client();
        client.apply_bytes(&created[0]).unwrap();
        client.apply_bytes(&destroyed[0]).unwrap();
        client.apply_bytes(&updated[0]).unwrap();

        let mut recreate = OutgoingMessage::entity(ENTITY_CREATE);
        recreate.write(&id.0).write_string("Crate");
        client.apply_bytes(recreate.bytes()).unwrap();
        assert_eq!(client.get::<Crate>(id).unwrap().label.get(), "");
    }

    #[test]
    fn test_quiet_variable_accepts_update_after_long_gap() {
        let mut server = server(4);
        let mut client = client();
        let id = server.create_entity::<Crate>().unwrap();
        server.get_mut::<Crate>(id).unwrap().label.set("ada".into());
        mirror(&mut server, &mut client);

        for tick in 0..33_000u32 {
            server.get_mut::<Crate>(id).unwrap().weight.set(tick as u16);
            mirror(&mut server, &mut client);
        }

        server.get_mut::<Crate>(id).unwrap().label.set("grace".into());
        mirror(&mut server, &mut client);
        let mirrored = client.get::<Crate>(id).unwrap();
        assert_eq!(mirrored.label.get(), "grace");
        assert_eq!(*mirrored.weight.get(), 32_999);
    }

    #[test]
    fn update_after_sequence_gap_applies() {
        let mut client = client();
        let mut create = OutgoingMessage::entity(ENTITY_CREATE);
        create.write(&1u16).write_string("Crate");
        client.apply_bytes(create.bytes()).unwrap();

        let update = |sequence: u16, weight: u16| {
            let mut message = OutgoingMessage::entity(ENTITY_UPDATE);
            message
                .write(&1u16)
                .write(&sequence)
                .write_byte(1)
                .write_string("Weight")
                .write(&weight);
            message.into_bytes().unwrap()
        };

        client.apply_bytes(&update(100, 1)).unwrap();
        // nothing visible to this client for 40000 sequences
        client.apply_bytes(&update(40_100, 2)).unwrap();
        assert_eq!(*client.get::<Crate>(EntityId(1)).unwrap().weight.get(), 2);

        // still rejects genuinely late deliveries
        client.apply_bytes(&update(40_099, 9)).unwrap();
        assert_eq!(*client.get::<Crate>(EntityId(1)).unwrap().weight.get(), 2);
    }

    #[test]
    fn entity_access_through_trait_object() {
        let mut server = server(2);
        let id = server.create_entity::<Crate>().unwrap();
        server.collect_updates();

        let entity = server.get_entity_mut(id).unwrap();
        assert_eq!(entity.variables_mut().len(), 2);
        assert!(entity.as_any_mut().downcast_mut::<Crate>().is_some());
        assert!(server.get_mut::<Crate>(EntityId(1)).is_none());
    }
}
