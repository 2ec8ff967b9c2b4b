//! The metadata snapshot: an owning value type mutated only on clones.
//!
//! Timestamps and durations are nanoseconds since the Unix epoch / plain
//! nanosecond counts, matching the precision of the write path.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{MetaError, MetaResult};

pub type Timestamp = i64;

pub const NANOS_PER_HOUR: i64 = 3_600_000_000_000;
pub const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;

/// Policies with a finite duration below this are rejected.
pub const MIN_RETENTION_POLICY_DURATION: i64 = NANOS_PER_HOUR;

pub const DEFAULT_RETENTION_POLICY_NAME: &str = "autogen";
pub const DEFAULT_RETENTION_POLICY_REPLICA_N: usize = 1;

/// A `(database, retention policy)` pair naming a shard source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub database: String,
    pub retention_policy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    None,
    Read,
    Write,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    Any,
    All,
}

impl SubscriptionMode {
    pub fn parse(mode: &str) -> MetaResult<Self> {
        match mode.to_ascii_uppercase().as_str() {
            "ANY" => Ok(Self::Any),
            "ALL" => Ok(Self::All),
            _ => Err(MetaError::InvalidSubscriptionMode {
                mode: mode.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    pub host: String,
    pub tcp_host: String,
    pub frozen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: u64,
    pub owners: Vec<u64>,
}

impl ShardInfo {
    pub fn owned_by(&self, node_id: u64) -> bool {
        self.owners.contains(&node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroupInfo {
    pub id: u64,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub deleted_at: Option<Timestamp>,
    pub truncated_at: Option<Timestamp>,
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    pub fn deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether a point with this timestamp belongs in the group. A truncated
    /// group no longer accepts points at or past the truncation mark.
    pub fn covers(&self, timestamp: Timestamp) -> bool {
        if self.deleted() {
            return false;
        }
        if let Some(truncated_at) = self.truncated_at {
            if timestamp >= truncated_at {
                return false;
            }
        }
        self.start_time <= timestamp && timestamp < self.end_time
    }

    pub fn overlaps(&self, tmin: Timestamp, tmax: Timestamp) -> bool {
        self.start_time <= tmax && self.end_time > tmin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub name: String,
    pub mode: SubscriptionMode,
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQueryInfo {
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    pub replica_n: usize,
    /// 0 means the policy keeps data forever.
    pub duration: i64,
    pub shard_group_duration: i64,
    pub shard_groups: Vec<ShardGroupInfo>,
    pub subscriptions: Vec<SubscriptionInfo>,
}

impl RetentionPolicyInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replica_n: DEFAULT_RETENTION_POLICY_REPLICA_N,
            duration: 0,
            shard_group_duration: 0,
            shard_groups: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn shard_group_by_timestamp(&self, timestamp: Timestamp) -> Option<&ShardGroupInfo> {
        self.shard_groups.iter().find(|g| g.covers(timestamp))
    }

    fn subscription(&self, name: &str) -> Option<&SubscriptionInfo> {
        self.subscriptions.iter().find(|s| s.name == name)
    }
}

/// What `default_retention_policy` produces when databases auto-create one.
pub fn default_retention_policy() -> RetentionPolicyInfo {
    RetentionPolicyInfo {
        name: DEFAULT_RETENTION_POLICY_NAME.to_string(),
        replica_n: DEFAULT_RETENTION_POLICY_REPLICA_N,
        duration: 0,
        shard_group_duration: normalized_shard_group_duration(0),
        shard_groups: Vec::new(),
        subscriptions: Vec::new(),
    }
}

/// Caller-facing shape of a policy to create; unset fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetentionPolicySpec {
    pub name: String,
    pub replica_n: Option<usize>,
    pub duration: Option<i64>,
    /// 0 derives the group duration from the policy duration.
    pub shard_group_duration: i64,
}

impl RetentionPolicySpec {
    pub fn to_policy(&self) -> RetentionPolicyInfo {
        let duration = self.duration.unwrap_or(0);
        RetentionPolicyInfo {
            name: self.name.clone(),
            replica_n: self.replica_n.unwrap_or(DEFAULT_RETENTION_POLICY_REPLICA_N),
            duration,
            shard_group_duration: if self.shard_group_duration > 0 {
                self.shard_group_duration
            } else {
                normalized_shard_group_duration(duration)
            },
            shard_groups: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Whether an existing policy is exactly what this spec asks for.
    pub fn matches(&self, policy: &RetentionPolicyInfo) -> bool {
        let want = self.to_policy();
        policy.name == want.name
            && policy.replica_n == want.replica_n
            && policy.duration == want.duration
            && policy.shard_group_duration == want.shard_group_duration
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetentionPolicyUpdate {
    pub name: Option<String>,
    pub duration: Option<i64>,
    pub replica_n: Option<usize>,
    pub shard_group_duration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub default_retention_policy: String,
    pub retention_policies: Vec<RetentionPolicyInfo>,
    pub continuous_queries: Vec<ContinuousQueryInfo>,
}

impl DatabaseInfo {
    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        self.retention_policies
            .iter_mut()
            .find(|rp| rp.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// bcrypt hash of the password.
    pub hash: String,
    pub admin: bool,
    pub privileges: BTreeMap<String, Privilege>,
}

/// The whole-cluster metadata snapshot. Every mutation below is applied to a
/// clone held by the caller; the committed snapshot is never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Data {
    pub term: u64,
    pub index: u64,
    pub cluster_id: u64,
    pub meta_nodes: Vec<NodeInfo>,
    pub data_nodes: Vec<NodeInfo>,
    pub databases: Vec<DatabaseInfo>,
    pub users: Vec<UserInfo>,
    pub max_node_id: u64,
    pub max_shard_group_id: u64,
    pub max_shard_id: u64,
}

/// Derive a shard group duration from the policy duration.
pub fn normalized_shard_group_duration(duration: i64) -> i64 {
    if duration <= 0 {
        7 * NANOS_PER_DAY
    } else if duration < 2 * NANOS_PER_DAY {
        NANOS_PER_HOUR
    } else if duration < 180 * NANOS_PER_DAY {
        NANOS_PER_DAY
    } else {
        7 * NANOS_PER_DAY
    }
}

fn validate_policy_duration(duration: i64) -> MetaResult<()> {
    if duration < 0 || (duration > 0 && duration < MIN_RETENTION_POLICY_DURATION) {
        return Err(MetaError::RetentionPolicyDurationTooLow);
    }
    Ok(())
}

impl Data {
    // ---- nodes ----

    pub fn data_node(&self, id: u64) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.id == id)
    }

    pub fn data_node_by_http_host(&self, host: &str) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.host == host)
    }

    pub fn data_node_by_tcp_host(&self, tcp_host: &str) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.tcp_host == tcp_host)
    }

    /// Adds a data node; ids are allocated from a counter shared with meta
    /// nodes and never reused within a snapshot lineage.
    pub fn create_data_node(&mut self, host: &str, tcp_host: &str) -> MetaResult<u64> {
        if self
            .data_nodes
            .iter()
            .any(|n| n.host == host || n.tcp_host == tcp_host)
        {
            return Err(MetaError::NodeExists {
                addr: tcp_host.to_string(),
            });
        }

        let observed_max = self
            .data_nodes
            .iter()
            .chain(self.meta_nodes.iter())
            .map(|n| n.id)
            .max()
            .unwrap_or(0);
        let id = self.max_node_id.max(observed_max) + 1;
        self.max_node_id = id;
        self.data_nodes.push(NodeInfo {
            id,
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
            frozen: false,
        });
        Ok(id)
    }

    pub fn delete_data_node(&mut self, id: u64) -> MetaResult<()> {
        let before = self.data_nodes.len();
        self.data_nodes.retain(|n| n.id != id);
        if self.data_nodes.len() == before {
            return Err(MetaError::NodeNotFound { id });
        }
        Ok(())
    }

    pub fn freeze_data_node(&mut self, id: u64) -> MetaResult<()> {
        self.set_data_node_frozen(id, true)
    }

    pub fn unfreeze_data_node(&mut self, id: u64) -> MetaResult<()> {
        self.set_data_node_frozen(id, false)
    }

    fn set_data_node_frozen(&mut self, id: u64, frozen: bool) -> MetaResult<()> {
        match self.data_nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.frozen = frozen;
                Ok(())
            }
            None => Err(MetaError::NodeNotFound { id }),
        }
    }

    pub fn is_data_node_frozen(&self, id: u64) -> bool {
        self.data_node(id).map(|n| n.frozen).unwrap_or(false)
    }

    // ---- databases ----

    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|d| d.name == name)
    }

    fn database_mut(&mut self, name: &str) -> MetaResult<&mut DatabaseInfo> {
        self.databases
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| MetaError::DatabaseNotFound {
                name: name.to_string(),
            })
    }

    pub fn create_database(&mut self, name: &str) -> MetaResult<()> {
        if name.is_empty() {
            return Err(MetaError::DatabaseNameRequired);
        }
        if self.database(name).is_some() {
            return Err(MetaError::DatabaseExists {
                name: name.to_string(),
            });
        }
        self.databases.push(DatabaseInfo {
            name: name.to_string(),
            default_retention_policy: String::new(),
            retention_policies: Vec::new(),
            continuous_queries: Vec::new(),
        });
        Ok(())
    }

    pub fn drop_database(&mut self, name: &str) -> MetaResult<()> {
        let before = self.databases.len();
        self.databases.retain(|d| d.name != name);
        if self.databases.len() == before {
            return Err(MetaError::DatabaseNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    // ---- retention policies ----

    pub fn retention_policy(&self, database: &str, name: &str) -> MetaResult<Option<&RetentionPolicyInfo>> {
        let db = self
            .database(database)
            .ok_or_else(|| MetaError::DatabaseNotFound {
                name: database.to_string(),
            })?;
        Ok(db.retention_policy(name))
    }

    pub fn create_retention_policy(
        &mut self,
        database: &str,
        policy: RetentionPolicyInfo,
        make_default: bool,
    ) -> MetaResult<()> {
        if policy.name.is_empty() {
            return Err(MetaError::RetentionPolicyNameRequired);
        }
        if policy.replica_n < 1 {
            return Err(MetaError::InvalidReplicationFactor);
        }
        validate_policy_duration(policy.duration)?;

        let mut policy = policy;
        if policy.shard_group_duration <= 0 {
            policy.shard_group_duration = normalized_shard_group_duration(policy.duration);
        }

        let db = self.database_mut(database)?;
        if let Some(existing) = db.retention_policy(&policy.name) {
            let identical = existing.replica_n == policy.replica_n
                && existing.duration == policy.duration
                && existing.shard_group_duration == policy.shard_group_duration;
            if !identical {
                return Err(MetaError::RetentionPolicyExists { name: policy.name });
            }
        } else {
            db.retention_policies.push(policy.clone());
        }
        if make_default {
            db.default_retention_policy = policy.name;
        }
        Ok(())
    }

    pub fn drop_retention_policy(&mut self, database: &str, name: &str) -> MetaResult<()> {
        let db = self.database_mut(database)?;
        let before = db.retention_policies.len();
        db.retention_policies.retain(|rp| rp.name != name);
        if db.retention_policies.len() == before {
            return Err(MetaError::RetentionPolicyNotFound {
                name: name.to_string(),
            });
        }
        if db.default_retention_policy == name {
            db.default_retention_policy.clear();
        }
        Ok(())
    }

    pub fn update_retention_policy(
        &mut self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
        make_default: bool,
    ) -> MetaResult<()> {
        if let Some(duration) = update.duration {
            validate_policy_duration(duration)?;
        }
        if let Some(replica_n) = update.replica_n {
            if replica_n < 1 {
                return Err(MetaError::InvalidReplicationFactor);
            }
        }

        let db = self.database_mut(database)?;
        if let Some(new_name) = &update.name {
            if new_name != name && db.retention_policy(new_name).is_some() {
                return Err(MetaError::RetentionPolicyExists {
                    name: new_name.clone(),
                });
            }
        }

        let policy = db
            .retention_policy_mut(name)
            .ok_or_else(|| MetaError::RetentionPolicyNotFound {
                name: name.to_string(),
            })?;

        let new_duration = update.duration.unwrap_or(policy.duration);
        let new_group_duration = match update.shard_group_duration {
            Some(d) if d > 0 => d,
            Some(_) => normalized_shard_group_duration(new_duration),
            None => policy.shard_group_duration,
        };
        if new_duration > 0 && new_duration < new_group_duration {
            return Err(MetaError::IncompatibleDurations);
        }

        policy.duration = new_duration;
        policy.shard_group_duration = new_group_duration;
        if let Some(replica_n) = update.replica_n {
            policy.replica_n = replica_n;
        }
        let final_name = match &update.name {
            Some(new_name) => {
                policy.name = new_name.clone();
                new_name.clone()
            }
            None => name.to_string(),
        };
        // A rename carries the default pointer with it.
        if make_default || db.default_retention_policy == name {
            db.default_retention_policy = final_name;
        }
        Ok(())
    }

    // ---- shard groups ----

    pub fn shard_group_by_timestamp(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> MetaResult<Option<&ShardGroupInfo>> {
        match self.retention_policy(database, policy)? {
            Some(rp) => Ok(rp.shard_group_by_timestamp(timestamp)),
            None => Err(MetaError::RetentionPolicyNotFound {
                name: policy.to_string(),
            }),
        }
    }

    /// Allocates the shard group covering `timestamp`. Owners are assigned
    /// round-robin over the non-frozen data nodes in id order; a snapshot
    /// with no data nodes still gets one ownerless shard so a single-node
    /// deployment has somewhere to write.
    pub fn create_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> MetaResult<()> {
        if self.shard_group_by_timestamp(database, policy, timestamp)?.is_some() {
            return Err(MetaError::ShardGroupExists { timestamp });
        }

        let mut nodes: Vec<u64> = self
            .data_nodes
            .iter()
            .filter(|n| !n.frozen)
            .map(|n| n.id)
            .collect();
        nodes.sort_unstable();

        let group_id = self.max_shard_group_id + 1;
        self.max_shard_group_id = group_id;

        let db_name = database.to_string();
        let policy_name = policy.to_string();

        // Resolve replica count and group bounds before the mutable borrow.
        let (replica_n, group_duration) = {
            let rp = self
                .retention_policy(&db_name, &policy_name)?
                .ok_or_else(|| MetaError::RetentionPolicyNotFound {
                    name: policy_name.clone(),
                })?;
            let group_duration = if rp.shard_group_duration > 0 {
                rp.shard_group_duration
            } else {
                normalized_shard_group_duration(rp.duration)
            };
            (rp.replica_n, group_duration)
        };

        let start_time = timestamp - timestamp.rem_euclid(group_duration);
        let end_time = start_time + group_duration;

        let replica_n = if nodes.is_empty() {
            0
        } else {
            replica_n.min(nodes.len())
        };
        let shard_n = if nodes.is_empty() {
            1
        } else {
            (nodes.len() / replica_n).max(1)
        };

        let mut shards = Vec::with_capacity(shard_n);
        for i in 0..shard_n {
            let shard_id = self.max_shard_id + 1;
            self.max_shard_id = shard_id;
            let mut owners = Vec::with_capacity(replica_n);
            for j in 0..replica_n {
                owners.push(nodes[(i * replica_n + j) % nodes.len()]);
            }
            shards.push(ShardInfo {
                id: shard_id,
                owners,
            });
        }

        let group = ShardGroupInfo {
            id: group_id,
            start_time,
            end_time,
            deleted_at: None,
            truncated_at: None,
            shards,
        };

        let db = self.database_mut(&db_name)?;
        let rp = db
            .retention_policy_mut(&policy_name)
            .ok_or_else(|| MetaError::RetentionPolicyNotFound {
                name: policy_name.clone(),
            })?;
        let pos = rp
            .shard_groups
            .iter()
            .position(|g| g.start_time > group.start_time)
            .unwrap_or(rp.shard_groups.len());
        rp.shard_groups.insert(pos, group);
        Ok(())
    }

    pub fn delete_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        id: u64,
        at: Timestamp,
    ) -> MetaResult<()> {
        let db = self.database_mut(database)?;
        let rp = db
            .retention_policy_mut(policy)
            .ok_or_else(|| MetaError::RetentionPolicyNotFound {
                name: policy.to_string(),
            })?;
        match rp.shard_groups.iter_mut().find(|g| g.id == id) {
            Some(group) => {
                group.deleted_at = Some(at);
                Ok(())
            }
            None => Err(MetaError::ShardGroupNotFound { id }),
        }
    }

    /// Marks every group straddling `at` so no point at or past `at` lands in
    /// it. Groups wholly past `at` are left alone.
    pub fn truncate_shard_groups(&mut self, at: Timestamp) {
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for group in &mut rp.shard_groups {
                    if !group.deleted()
                        && group.truncated_at.is_none()
                        && group.start_time < at
                        && at < group.end_time
                    {
                        group.truncated_at = Some(at);
                    }
                }
            }
        }
    }

    /// Physically removes groups deleted before `expiration`. Returns whether
    /// anything was removed.
    pub fn prune_shard_groups(&mut self, expiration: Timestamp) -> bool {
        let mut changed = false;
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                let before = rp.shard_groups.len();
                rp.shard_groups
                    .retain(|g| match g.deleted_at {
                        Some(deleted_at) => deleted_at >= expiration,
                        None => true,
                    });
                changed |= rp.shard_groups.len() != before;
            }
        }
        changed
    }

    pub fn drop_shard(&mut self, id: u64) {
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for group in &mut rp.shard_groups {
                    group.shards.retain(|s| s.id != id);
                }
            }
        }
    }

    pub fn add_shard_owner(&mut self, shard_id: u64, node_id: u64) {
        self.each_shard_mut(shard_id, |shard| {
            if !shard.owners.contains(&node_id) {
                shard.owners.push(node_id);
                shard.owners.sort_unstable();
            }
        });
    }

    pub fn remove_shard_owner(&mut self, shard_id: u64, node_id: u64) {
        self.each_shard_mut(shard_id, |shard| {
            shard.owners.retain(|id| *id != node_id);
        });
    }

    fn each_shard_mut(&mut self, shard_id: u64, mut f: impl FnMut(&mut ShardInfo)) {
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for group in &mut rp.shard_groups {
                    for shard in &mut group.shards {
                        if shard.id == shard_id {
                            f(shard);
                        }
                    }
                }
            }
        }
    }

    pub fn shard_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        for db in &self.databases {
            for rp in &db.retention_policies {
                for group in &rp.shard_groups {
                    for shard in &group.shards {
                        ids.push(shard.id);
                    }
                }
            }
        }
        ids.sort_unstable();
        ids
    }

    /// Live groups for the policy overlapping `[tmin, tmax]`, in start order.
    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        tmin: Timestamp,
        tmax: Timestamp,
    ) -> MetaResult<Vec<ShardGroupInfo>> {
        let rp = self
            .retention_policy(database, policy)?
            .ok_or_else(|| MetaError::RetentionPolicyNotFound {
                name: policy.to_string(),
            })?;
        Ok(rp
            .shard_groups
            .iter()
            .filter(|g| !g.deleted() && g.overlaps(tmin, tmax))
            .cloned()
            .collect())
    }

    /// Shards from live overlapping groups across all sources, deduplicated
    /// by shard id.
    pub fn shards_by_time_range(
        &self,
        sources: &[Source],
        tmin: Timestamp,
        tmax: Timestamp,
    ) -> MetaResult<Vec<ShardInfo>> {
        let mut seen = BTreeSet::new();
        let mut shards = Vec::new();
        for source in sources {
            let groups =
                self.shard_groups_by_time_range(&source.database, &source.retention_policy, tmin, tmax)?;
            for group in groups {
                for shard in group.shards {
                    if seen.insert(shard.id) {
                        shards.push(shard);
                    }
                }
            }
        }
        Ok(shards)
    }

    /// Resolves the live group containing the shard, with its database and
    /// policy names.
    pub fn shard_owner(&self, shard_id: u64) -> Option<(&str, &str, &ShardGroupInfo)> {
        for db in &self.databases {
            for rp in &db.retention_policies {
                for group in &rp.shard_groups {
                    if group.deleted() {
                        continue;
                    }
                    if group.shards.iter().any(|s| s.id == shard_id) {
                        return Some((&db.name, &rp.name, group));
                    }
                }
            }
        }
        None
    }

    // ---- users ----

    pub fn user(&self, name: &str) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.name == name)
    }

    fn user_mut(&mut self, name: &str) -> MetaResult<&mut UserInfo> {
        self.users
            .iter_mut()
            .find(|u| u.name == name)
            .ok_or_else(|| MetaError::UserNotFound {
                name: name.to_string(),
            })
    }

    pub fn create_user(&mut self, name: &str, hash: &str, admin: bool) -> MetaResult<()> {
        if name.is_empty() {
            return Err(MetaError::UsernameRequired);
        }
        if self.user(name).is_some() {
            return Err(MetaError::UserExists {
                name: name.to_string(),
            });
        }
        self.users.push(UserInfo {
            name: name.to_string(),
            hash: hash.to_string(),
            admin,
            privileges: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn update_user(&mut self, name: &str, hash: &str) -> MetaResult<()> {
        self.user_mut(name)?.hash = hash.to_string();
        Ok(())
    }

    pub fn drop_user(&mut self, name: &str) -> MetaResult<()> {
        let before = self.users.len();
        self.users.retain(|u| u.name != name);
        if self.users.len() == before {
            return Err(MetaError::UserNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_privilege(&mut self, name: &str, database: &str, privilege: Privilege) -> MetaResult<()> {
        if self.database(database).is_none() {
            return Err(MetaError::DatabaseNotFound {
                name: database.to_string(),
            });
        }
        let user = self.user_mut(name)?;
        if privilege == Privilege::None {
            user.privileges.remove(database);
        } else {
            user.privileges.insert(database.to_string(), privilege);
        }
        Ok(())
    }

    pub fn set_admin_privilege(&mut self, name: &str, admin: bool) -> MetaResult<()> {
        self.user_mut(name)?.admin = admin;
        Ok(())
    }

    pub fn user_privileges(&self, name: &str) -> MetaResult<BTreeMap<String, Privilege>> {
        match self.user(name) {
            Some(user) => Ok(user.privileges.clone()),
            None => Err(MetaError::UserNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Privilege on one database. Entries for dropped databases are never
    /// reported.
    pub fn user_privilege(&self, name: &str, database: &str) -> MetaResult<Privilege> {
        let user = self.user(name).ok_or_else(|| MetaError::UserNotFound {
            name: name.to_string(),
        })?;
        if self.database(database).is_none() {
            return Ok(Privilege::None);
        }
        Ok(user
            .privileges
            .get(database)
            .copied()
            .unwrap_or(Privilege::None))
    }

    pub fn admin_user_exists(&self) -> bool {
        self.users.iter().any(|u| u.admin)
    }

    // ---- continuous queries ----

    pub fn create_continuous_query(&mut self, database: &str, name: &str, query: &str) -> MetaResult<()> {
        let db = self.database_mut(database)?;
        if let Some(existing) = db.continuous_queries.iter().find(|cq| cq.name == name) {
            if existing.query == query {
                return Ok(());
            }
            return Err(MetaError::ContinuousQueryExists {
                name: name.to_string(),
            });
        }
        db.continuous_queries.push(ContinuousQueryInfo {
            name: name.to_string(),
            query: query.to_string(),
        });
        Ok(())
    }

    pub fn drop_continuous_query(&mut self, database: &str, name: &str) -> MetaResult<()> {
        let db = self.database_mut(database)?;
        let before = db.continuous_queries.len();
        db.continuous_queries.retain(|cq| cq.name != name);
        if db.continuous_queries.len() == before {
            return Err(MetaError::ContinuousQueryNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    // ---- subscriptions ----

    pub fn create_subscription(
        &mut self,
        database: &str,
        policy: &str,
        name: &str,
        mode: &str,
        destinations: &[String],
    ) -> MetaResult<()> {
        let mode = SubscriptionMode::parse(mode)?;
        if destinations.is_empty() {
            return Err(MetaError::SubscriptionDestinationsRequired);
        }
        let db = self.database_mut(database)?;
        let rp = db
            .retention_policy_mut(policy)
            .ok_or_else(|| MetaError::RetentionPolicyNotFound {
                name: policy.to_string(),
            })?;
        if rp.subscription(name).is_some() {
            return Err(MetaError::SubscriptionExists {
                name: name.to_string(),
            });
        }
        rp.subscriptions.push(SubscriptionInfo {
            name: name.to_string(),
            mode,
            destinations: destinations.to_vec(),
        });
        Ok(())
    }

    pub fn drop_subscription(&mut self, database: &str, policy: &str, name: &str) -> MetaResult<()> {
        let db = self.database_mut(database)?;
        let rp = db
            .retention_policy_mut(policy)
            .ok_or_else(|| MetaError::RetentionPolicyNotFound {
                name: policy.to_string(),
            })?;
        let before = rp.subscriptions.len();
        rp.subscriptions.retain(|s| s.name != name);
        if rp.subscriptions.len() == before {
            return Err(MetaError::SubscriptionNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    // ---- serialization ----

    /// Stable byte form used by the persistence hook and replication. Field
    /// order is fixed by the struct definitions; maps are ordered.
    pub fn marshal_binary(&self) -> MetaResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| MetaError::Marshal { source })
    }

    pub fn unmarshal_binary(bytes: &[u8]) -> MetaResult<Self> {
        serde_json::from_slice(bytes).map_err(|source| MetaError::Unmarshal { source })
    }
}
