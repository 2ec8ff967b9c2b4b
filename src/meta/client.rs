//! The metadata client: a concurrency-safe facade over the snapshot.
//!
//! Every mutation runs the same pipeline under the writer lock: clone the
//! cached snapshot, apply the change to the clone, bump its version, persist
//! through the snapshot store, swap the clone in, and wake change waiters.
//! A failure at any step leaves the cached snapshot untouched.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crossbeam::channel::{bounded, Receiver, Sender};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::MetaConfig;

use super::data::{
    default_retention_policy, Data, DatabaseInfo, NodeInfo, Privilege, RetentionPolicyInfo,
    RetentionPolicySpec, RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, Source, Timestamp,
    UserInfo,
};
use super::{MetaError, MetaResult};

pub const META_FILE: &str = "meta.db";

const SALT_LENGTH: usize = 32;

/// Persistence hook invoked inside the commit pipeline, while the writer
/// lock is held; implementations must be fast.
pub trait SnapshotStore: Send + Sync {
    fn snapshot(&self, path: &Path, data: &Data) -> MetaResult<()>;
    fn load(&self, path: &Path) -> MetaResult<Option<Data>>;
}

/// Keeps the snapshot purely in memory.
pub struct NullSnapshotStore;

impl SnapshotStore for NullSnapshotStore {
    fn snapshot(&self, _path: &Path, _data: &Data) -> MetaResult<()> {
        Ok(())
    }

    fn load(&self, _path: &Path) -> MetaResult<Option<Data>> {
        Ok(None)
    }
}

/// Writes the marshaled snapshot to `<dir>/meta.db` via a temp file rename.
pub struct FsSnapshotStore;

impl FsSnapshotStore {
    fn io(path: &Path, source: std::io::Error) -> MetaError {
        MetaError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn snapshot(&self, path: &Path, data: &Data) -> MetaResult<()> {
        fs::create_dir_all(path).map_err(|e| Self::io(path, e))?;
        let bytes = data.marshal_binary()?;
        let tmp = path.join(format!("{META_FILE}.tmp"));
        let target = path.join(META_FILE);
        fs::write(&tmp, &bytes).map_err(|e| Self::io(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| Self::io(&target, e))?;
        Ok(())
    }

    fn load(&self, path: &Path) -> MetaResult<Option<Data>> {
        let target = path.join(META_FILE);
        match fs::read(&target) {
            Ok(bytes) => Ok(Some(Data::unmarshal_binary(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io(&target, err)),
        }
    }
}

#[derive(Clone)]
struct AuthUser {
    bhash: String,
    salt: [u8; SALT_LENGTH],
    hash: [u8; 32],
}

struct ClientState {
    cache: Data,
    auth_cache: HashMap<String, AuthUser>,
    // Dropping the sender disconnects every receiver handed out since the
    // last commit; that disconnect is the change signal.
    changed_tx: Option<Sender<()>>,
    changed_rx: Receiver<()>,
    closed: bool,
}

impl ClientState {
    /// Disconnects every receiver handed out since the last commit and
    /// installs a fresh channel pair.
    fn notify_changed(&mut self) {
        let (tx, rx) = bounded(0);
        drop(self.changed_tx.take());
        self.changed_tx = Some(tx);
        self.changed_rx = rx;
    }
}

pub struct MetaClient {
    state: RwLock<ClientState>,
    store: Box<dyn SnapshotStore>,
    path: PathBuf,
    retention_auto_create: bool,
}

impl MetaClient {
    pub fn new(config: &MetaConfig) -> Self {
        Self::with_store(config, Box::new(NullSnapshotStore))
    }

    pub fn with_store(config: &MetaConfig, store: Box<dyn SnapshotStore>) -> Self {
        let (changed_tx, changed_rx) = bounded(0);
        Self {
            state: RwLock::new(ClientState {
                cache: Data {
                    index: 1,
                    ..Data::default()
                },
                auth_cache: HashMap::new(),
                changed_tx: Some(changed_tx),
                changed_rx,
                closed: false,
            }),
            store,
            path: config.dir.clone(),
            retention_auto_create: config.retention_auto_create,
        }
    }

    /// Loads the persisted snapshot; a brand-new cache is persisted
    /// immediately so the store always has a current copy.
    pub fn open(&self) -> MetaResult<()> {
        let mut state = self.write_state();
        if let Some(data) = self.store.load(&self.path)? {
            state.cache = data;
        }
        if state.cache.index == 1 {
            self.store.snapshot(&self.path, &state.cache)?;
        }
        state.closed = false;
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.write_state();
        state.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.read_state().closed
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ClientState> {
        self.state.read().expect("meta client lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ClientState> {
        self.state.write().expect("meta client lock poisoned")
    }

    /// The commit pipeline. Assumes the writer lock is held.
    fn commit(&self, state: &mut ClientState, mut data: Data) -> MetaResult<()> {
        data.index += 1;
        self.store.snapshot(&self.path, &data)?;
        state.cache = data;
        state.notify_changed();
        Ok(())
    }

    // ---- versioning and change notification ----

    pub fn cluster_id(&self) -> u64 {
        self.read_state().cache.cluster_id
    }

    pub fn data_index(&self) -> u64 {
        self.read_state().cache.index
    }

    /// A clone of the current snapshot.
    pub fn data(&self) -> Data {
        self.read_state().cache.clone()
    }

    /// The returned channel disconnects once any later commit lands; compare
    /// `data_index` before and after to identify the commit observed.
    pub fn wait_for_data_changed(&self) -> Receiver<()> {
        self.read_state().changed_rx.clone()
    }

    /// Replaces the snapshot through the commit pipeline, guaranteeing an
    /// observable change even for an identical payload.
    pub fn set_data(&self, data: &Data) -> MetaResult<()> {
        let mut state = self.write_state();
        state.cache.index = 0;
        self.commit(&mut state, data.clone())
    }

    /// Installs the snapshot as-is, without a version bump. Bootstrap and
    /// restore path.
    pub fn replace_data(&self, data: Data) -> MetaResult<()> {
        let mut state = self.write_state();
        self.store.snapshot(&self.path, &data)?;
        state.cache = data;
        state.notify_changed();
        Ok(())
    }

    pub fn marshal_binary(&self) -> MetaResult<Vec<u8>> {
        self.read_state().cache.marshal_binary()
    }

    // ---- nodes ----

    pub fn data_node(&self, id: u64) -> MetaResult<NodeInfo> {
        self.read_state()
            .cache
            .data_node(id)
            .cloned()
            .ok_or(MetaError::NodeNotFound { id })
    }

    pub fn data_nodes(&self) -> Vec<NodeInfo> {
        self.read_state().cache.data_nodes.clone()
    }

    pub fn data_node_by_http_host(&self, host: &str) -> MetaResult<NodeInfo> {
        self.read_state()
            .cache
            .data_node_by_http_host(host)
            .cloned()
            .ok_or(MetaError::NodeNotFound { id: 0 })
    }

    pub fn data_node_by_tcp_host(&self, tcp_host: &str) -> MetaResult<NodeInfo> {
        self.read_state()
            .cache
            .data_node_by_tcp_host(tcp_host)
            .cloned()
            .ok_or(MetaError::NodeNotFound { id: 0 })
    }

    pub fn create_data_node(&self, host: &str, tcp_host: &str) -> MetaResult<NodeInfo> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        let id = data.create_data_node(host, tcp_host)?;
        let node = data
            .data_node(id)
            .cloned()
            .ok_or(MetaError::NodeNotFound { id })?;
        self.commit(&mut state, data)?;
        Ok(node)
    }

    pub fn delete_data_node(&self, id: u64) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.delete_data_node(id)?;
        self.commit(&mut state, data)
    }

    pub fn meta_nodes(&self) -> Vec<NodeInfo> {
        self.read_state().cache.meta_nodes.clone()
    }

    pub fn is_data_node_frozen(&self, id: u64) -> bool {
        self.read_state().cache.is_data_node_frozen(id)
    }

    pub fn freeze_data_node(&self, id: u64) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.freeze_data_node(id)?;
        self.commit(&mut state, data)
    }

    pub fn unfreeze_data_node(&self, id: u64) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.unfreeze_data_node(id)?;
        self.commit(&mut state, data)
    }

    // ---- databases ----

    pub fn database(&self, name: &str) -> Option<DatabaseInfo> {
        self.read_state().cache.database(name).cloned()
    }

    pub fn databases(&self) -> Vec<DatabaseInfo> {
        self.read_state().cache.databases.clone()
    }

    /// Creates a database, or returns the existing one unchanged. With
    /// retention auto-create enabled, a brand-new database gets the default
    /// policy in the same commit.
    pub fn create_database(&self, name: &str) -> MetaResult<DatabaseInfo> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();

        if let Some(db) = data.database(name) {
            return Ok(db.clone());
        }

        data.create_database(name)?;
        if self.retention_auto_create {
            data.create_retention_policy(name, default_retention_policy(), true)?;
        }
        let db = data
            .database(name)
            .cloned()
            .ok_or_else(|| MetaError::DatabaseNotFound {
                name: name.to_string(),
            })?;
        self.commit(&mut state, data)?;
        Ok(db)
    }

    /// Creates a database whose default policy is exactly `spec`. Idempotent
    /// only when the spec matches an existing default policy.
    pub fn create_database_with_retention_policy(
        &self,
        name: &str,
        spec: &RetentionPolicySpec,
    ) -> MetaResult<DatabaseInfo> {
        if spec.name.is_empty() {
            return Err(MetaError::RetentionPolicyNameRequired);
        }
        let mut state = self.write_state();
        let mut data = state.cache.clone();

        if let Some(duration) = spec.duration {
            if duration > 0 && duration < super::data::MIN_RETENTION_POLICY_DURATION {
                return Err(MetaError::RetentionPolicyDurationTooLow);
            }
        }

        if data.database(name).is_none() {
            data.create_database(name)?;
        }

        let policy = spec.to_policy();
        let has_policies = !data
            .database(name)
            .map(|db| db.retention_policies.is_empty())
            .unwrap_or(true);
        if !has_policies {
            data.create_retention_policy(name, policy.clone(), true)?;
        } else {
            let matched = data
                .database(name)
                .and_then(|db| db.retention_policy(&policy.name))
                .map(|existing| spec.matches(existing))
                .unwrap_or(false);
            if !matched {
                return Err(MetaError::RetentionPolicyConflict);
            }
        }

        let is_default = data
            .database(name)
            .map(|db| db.default_retention_policy == policy.name)
            .unwrap_or(false);
        if !is_default {
            return Err(MetaError::RetentionPolicyConflict);
        }

        let db = data
            .database(name)
            .cloned()
            .ok_or_else(|| MetaError::DatabaseNotFound {
                name: name.to_string(),
            })?;
        self.commit(&mut state, data)?;
        Ok(db)
    }

    pub fn drop_database(&self, name: &str) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.drop_database(name)?;
        self.commit(&mut state, data)
    }

    // ---- retention policies ----

    pub fn retention_policy(&self, database: &str, name: &str) -> MetaResult<Option<RetentionPolicyInfo>> {
        Ok(self
            .read_state()
            .cache
            .retention_policy(database, name)?
            .cloned())
    }

    pub fn create_retention_policy(
        &self,
        database: &str,
        spec: &RetentionPolicySpec,
        make_default: bool,
    ) -> MetaResult<RetentionPolicyInfo> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        let policy = spec.to_policy();
        data.create_retention_policy(database, policy.clone(), make_default)?;
        self.commit(&mut state, data)?;
        Ok(policy)
    }

    pub fn drop_retention_policy(&self, database: &str, name: &str) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.drop_retention_policy(database, name)?;
        self.commit(&mut state, data)
    }

    pub fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
        make_default: bool,
    ) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.update_retention_policy(database, name, update, make_default)?;
        self.commit(&mut state, data)
    }

    // ---- users and authentication ----

    pub fn users(&self) -> Vec<UserInfo> {
        self.read_state().cache.users.clone()
    }

    pub fn user(&self, name: &str) -> MetaResult<UserInfo> {
        self.read_state()
            .cache
            .user(name)
            .cloned()
            .ok_or_else(|| MetaError::UserNotFound {
                name: name.to_string(),
            })
    }

    pub fn user_count(&self) -> usize {
        self.read_state().cache.users.len()
    }

    /// Idempotent against an identical `(hash, admin)` pair; any mismatch is
    /// a user-exists error.
    pub fn create_user(&self, name: &str, hash: &str, admin: bool) -> MetaResult<UserInfo> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();

        if let Some(existing) = data.user(name) {
            if existing.hash != hash || existing.admin != admin {
                return Err(MetaError::UserExists {
                    name: name.to_string(),
                });
            }
            return Ok(existing.clone());
        }

        data.create_user(name, hash, admin)?;
        let user = data
            .user(name)
            .cloned()
            .ok_or_else(|| MetaError::UserNotFound {
                name: name.to_string(),
            })?;
        self.commit(&mut state, data)?;
        Ok(user)
    }

    pub fn update_user(&self, name: &str, hash: &str) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.update_user(name, hash)?;
        state.auth_cache.remove(name);
        self.commit(&mut state, data)
    }

    pub fn drop_user(&self, name: &str) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.drop_user(name)?;
        state.auth_cache.remove(name);
        self.commit(&mut state, data)
    }

    pub fn set_privilege(&self, name: &str, database: &str, privilege: Privilege) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.set_privilege(name, database, privilege)?;
        self.commit(&mut state, data)
    }

    pub fn set_admin_privilege(&self, name: &str, admin: bool) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.set_admin_privilege(name, admin)?;
        self.commit(&mut state, data)
    }

    pub fn user_privileges(&self, name: &str) -> MetaResult<std::collections::BTreeMap<String, Privilege>> {
        self.read_state().cache.user_privileges(name)
    }

    pub fn user_privilege(&self, name: &str, database: &str) -> MetaResult<Privilege> {
        self.read_state().cache.user_privilege(name, database)
    }

    pub fn admin_user_exists(&self) -> bool {
        self.read_state().cache.admin_user_exists()
    }

    fn hash_with_salt(salt: &[u8], password: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    }

    /// Two-tier password check: a salted-SHA256 cache entry from the last
    /// successful authentication fronts the bcrypt verification. The bcrypt
    /// hash stays the authority; the cache is never persisted.
    pub fn authenticate(&self, username: &str, password: &str) -> MetaResult<UserInfo> {
        let (user, cached) = {
            let state = self.read_state();
            let user = state
                .cache
                .user(username)
                .cloned()
                .ok_or_else(|| MetaError::UserNotFound {
                    name: username.to_string(),
                })?;
            (user, state.auth_cache.get(username).cloned())
        };

        if let Some(entry) = cached {
            if entry.bhash == user.hash
                && Self::hash_with_salt(&entry.salt, password) == entry.hash
            {
                return Ok(user);
            }
            // Stale or mismatched entry: fall through to the full bcrypt check.
        }

        match bcrypt::verify(password, &user.hash) {
            Ok(true) => {}
            _ => return Err(MetaError::AuthenticationFailed),
        }

        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        let hash = Self::hash_with_salt(&salt, password);
        let mut state = self.write_state();
        state.auth_cache.insert(
            username.to_string(),
            AuthUser {
                bhash: user.hash.clone(),
                salt,
                hash,
            },
        );
        Ok(user)
    }

    // ---- shards and shard groups ----

    pub fn shard_ids(&self) -> Vec<u64> {
        self.read_state().cache.shard_ids()
    }

    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        tmin: Timestamp,
        tmax: Timestamp,
    ) -> MetaResult<Vec<ShardGroupInfo>> {
        self.read_state()
            .cache
            .shard_groups_by_time_range(database, policy, tmin, tmax)
    }

    pub fn shards_by_time_range(
        &self,
        sources: &[Source],
        tmin: Timestamp,
        tmax: Timestamp,
    ) -> MetaResult<Vec<ShardInfo>> {
        self.read_state().cache.shards_by_time_range(sources, tmin, tmax)
    }

    pub fn shard_owner(&self, shard_id: u64) -> Option<(String, String, ShardGroupInfo)> {
        self.read_state()
            .cache
            .shard_owner(shard_id)
            .map(|(db, rp, group)| (db.to_string(), rp.to_string(), group.clone()))
    }

    pub fn shard_group_by_timestamp(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Option<ShardGroupInfo> {
        self.read_state()
            .cache
            .shard_group_by_timestamp(database, policy, timestamp)
            .ok()
            .flatten()
            .cloned()
    }

    pub fn add_shard_owner(&self, shard_id: u64, node_id: u64) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.add_shard_owner(shard_id, node_id);
        self.commit(&mut state, data)
    }

    pub fn remove_shard_owner(&self, shard_id: u64, node_id: u64) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.remove_shard_owner(shard_id, node_id);
        self.commit(&mut state, data)
    }

    pub fn drop_shard(&self, id: u64) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.drop_shard(id);
        self.commit(&mut state, data)
    }

    pub fn truncate_shard_groups(&self, at: Timestamp) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.truncate_shard_groups(at);
        self.commit(&mut state, data)
    }

    /// Physically removes groups whose deletion predates `expiration`. No
    /// commit when nothing qualifies.
    pub fn prune_shard_groups(&self, expiration: Timestamp) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        if data.prune_shard_groups(expiration) {
            return self.commit(&mut state, data);
        }
        Ok(())
    }

    /// Returns the group covering `timestamp`, creating it if needed. The
    /// read-lock fast path avoids cloning when the group already exists.
    pub fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> MetaResult<ShardGroupInfo> {
        if let Some(group) = self.shard_group_by_timestamp(database, policy, timestamp) {
            return Ok(group);
        }

        let mut state = self.write_state();
        let mut data = state.cache.clone();

        // Recheck on the fresh clone; another writer may have won the race.
        if let Some(group) = data.shard_group_by_timestamp(database, policy, timestamp)? {
            return Ok(group.clone());
        }

        data.create_shard_group(database, policy, timestamp)?;
        let group = data
            .shard_group_by_timestamp(database, policy, timestamp)?
            .cloned()
            .ok_or(MetaError::ShardGroupExists { timestamp })?;
        self.commit(&mut state, data)?;
        Ok(group)
    }

    pub fn delete_shard_group(
        &self,
        database: &str,
        policy: &str,
        id: u64,
        at: Timestamp,
    ) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.delete_shard_group(database, policy, id, at)?;
        self.commit(&mut state, data)
    }

    /// Creates the successor for every policy whose last live group ends
    /// inside `(from, to)`, so the write path never has to allocate a group
    /// inline. One commit covers every creation; none if nothing changed.
    pub fn precreate_shard_groups(&self, from: Timestamp, to: Timestamp) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();

        let mut candidates = Vec::new();
        for db in &data.databases {
            for rp in &db.retention_policies {
                let Some(last) = rp.shard_groups.last() else {
                    continue;
                };
                if !last.deleted() && last.end_time < to && last.end_time > from {
                    candidates.push((db.name.clone(), rp.name.clone(), last.end_time + 1));
                }
            }
        }

        let mut changed = false;
        for (db, rp, next_ts) in candidates {
            if let Some(existing) = data.shard_group_by_timestamp(&db, &rp, next_ts)? {
                tracing::info!(
                    group_id = existing.id,
                    database = %db,
                    retention_policy = %rp,
                    "shard group already exists"
                );
                continue;
            }
            if let Err(err) = data.create_shard_group(&db, &rp, next_ts) {
                tracing::info!(
                    database = %db,
                    retention_policy = %rp,
                    error = %err,
                    "failed to precreate successive shard group"
                );
                continue;
            }
            changed = true;
            tracing::info!(
                database = %db,
                retention_policy = %rp,
                "new shard group successfully precreated"
            );
        }

        if changed {
            return self.commit(&mut state, data);
        }
        Ok(())
    }

    // ---- continuous queries and subscriptions ----

    pub fn create_continuous_query(&self, database: &str, name: &str, query: &str) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.create_continuous_query(database, name, query)?;
        self.commit(&mut state, data)
    }

    pub fn drop_continuous_query(&self, database: &str, name: &str) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.drop_continuous_query(database, name)?;
        self.commit(&mut state, data)
    }

    pub fn create_subscription(
        &self,
        database: &str,
        policy: &str,
        name: &str,
        mode: &str,
        destinations: &[String],
    ) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.create_subscription(database, policy, name, mode, destinations)?;
        self.commit(&mut state, data)
    }

    pub fn drop_subscription(&self, database: &str, policy: &str, name: &str) -> MetaResult<()> {
        let mut state = self.write_state();
        let mut data = state.cache.clone();
        data.drop_subscription(database, policy, name)?;
        self.commit(&mut state, data)
    }
}
