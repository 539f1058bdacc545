//! In-process Redis Cluster stand-in for integration tests.
//!
//! Every node is a `TcpListener` on 127.0.0.1 speaking RESP through the
//! crate's own codec. Slot ownership, migrations and failures are driven
//! from the test through [`MockCluster`].

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use slotmux::core::connection::Connection;
use slotmux::{key_slot, Frame, SLOT_COUNT};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    Set(BTreeSet<Bytes>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    ttl: Option<i64>,
}

#[derive(Default)]
struct Session {
    asking: bool,
    readonly: bool,
}

#[derive(Default)]
struct State {
    addresses: Vec<String>,
    masters: usize,
    owners: Vec<usize>,
    replica_of: HashMap<usize, usize>,
    asks: HashMap<u16, usize>,
    redirect_loop: HashSet<u16>,
    data: Vec<HashMap<Bytes, Entry>>,
    down: HashSet<usize>,
    stalled: HashSet<usize>,
    cluster_down: bool,
    commands: Vec<Vec<String>>,
    accepts: Vec<usize>,
    slots_queries: usize,
}

/// A set of mock nodes sharing one cluster state.
pub struct MockCluster {
    state: Arc<Mutex<State>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockCluster {
    /// Starts `masters` nodes splitting the slots evenly.
    pub async fn start(masters: usize) -> Self {
        Self::start_with_replicas(masters, 0).await
    }

    /// Starts `masters` masters, each with `replicas` replicas.
    ///
    /// Node indexes: masters first, then the replicas of master 0, of master
    /// 1, and so on.
    pub async fn start_with_replicas(masters: usize, replicas: usize) -> Self {
        let total = masters * (1 + replicas);
        let mut listeners = Vec::with_capacity(total);
        for _ in 0..total {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }

        let slot_count = usize::from(SLOT_COUNT);
        let mut state = State {
            addresses: listeners
                .iter()
                .map(|l| l.local_addr().unwrap().to_string())
                .collect(),
            masters,
            owners: (0..slot_count).map(|slot| slot * masters / slot_count).collect(),
            data: vec![HashMap::new(); total],
            commands: vec![Vec::new(); total],
            accepts: vec![0; total],
            ..State::default()
        };
        for master in 0..masters {
            for r in 0..replicas {
                state
                    .replica_of
                    .insert(masters + master * replicas + r, master);
            }
        }

        let state = Arc::new(Mutex::new(state));
        let tasks = listeners
            .into_iter()
            .enumerate()
            .map(|(idx, listener)| tokio::spawn(accept_loop(listener, idx, state.clone())))
            .collect();
        Self { state, tasks }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// All node addresses, comma-separated.
    pub fn seeds(&self) -> String {
        self.state().addresses.join(",")
    }

    pub fn address(&self, idx: usize) -> String {
        self.state().addresses[idx].clone()
    }

    pub fn port(&self, idx: usize) -> u16 {
        let address = self.address(idx);
        address.rsplit_once(':').unwrap().1.parse().unwrap()
    }

    /// Index of the node owning `slot`.
    pub fn owner_of(&self, slot: u16) -> usize {
        self.state().owners[usize::from(slot)]
    }

    /// Index of the node owning the slot of `key`.
    pub fn owner_of_key(&self, key: &str) -> usize {
        self.owner_of(key_slot(key))
    }

    /// Reassigns `slot` to node `to`, carrying its keys along.
    pub fn move_slot(&self, slot: u16, to: usize) {
        let mut state = self.state();
        let from = state.owners[usize::from(slot)];
        state.owners[usize::from(slot)] = to;
        let keys: Vec<Bytes> = state.data[from]
            .keys()
            .filter(|k| key_slot(*k) == slot)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = state.data[from].remove(&key) {
                state.data[to].insert(key, entry);
            }
        }
    }

    /// Moves every slot of `from` to `to`.
    pub fn move_all_slots(&self, from: usize, to: usize) {
        let slots: Vec<u16> = {
            let state = self.state();
            (0..SLOT_COUNT)
                .filter(|slot| state.owners[usize::from(*slot)] == from)
                .collect()
        };
        for slot in slots {
            self.move_slot(slot, to);
        }
    }

    /// Marks `slot` as migrating to `to`: its owner answers ASK.
    pub fn ask_slot(&self, slot: u16, to: usize) {
        self.state().asks.insert(slot, to);
    }

    /// Every node answers MOVED to the next node for `slot`.
    pub fn redirect_loop(&self, slot: u16) {
        self.state().redirect_loop.insert(slot);
    }

    /// A down node closes its connections and refuses new ones.
    pub fn set_down(&self, idx: usize, down: bool) {
        let mut state = self.state();
        if down {
            state.down.insert(idx);
        } else {
            state.down.remove(&idx);
        }
    }

    /// A stalled node reads commands but never answers.
    pub fn set_stalled(&self, idx: usize, stalled: bool) {
        let mut state = self.state();
        if stalled {
            state.stalled.insert(idx);
        } else {
            state.stalled.remove(&idx);
        }
    }

    /// Key commands fail with CLUSTERDOWN while set.
    pub fn set_cluster_down(&self, down: bool) {
        self.state().cluster_down = down;
    }

    /// Number of CLUSTER SLOTS queries served by all nodes.
    pub fn slots_queries(&self) -> usize {
        self.state().slots_queries
    }

    /// Command names received by node `idx`, in order.
    pub fn commands_seen(&self, idx: usize) -> Vec<String> {
        self.state().commands[idx].clone()
    }

    /// Total count of `name` across every node.
    pub fn command_count(&self, name: &str) -> usize {
        self.state()
            .commands
            .iter()
            .flatten()
            .filter(|c| c.as_str() == name)
            .count()
    }

    /// Connections accepted by node `idx`.
    pub fn accepts(&self, idx: usize) -> usize {
        self.state().accepts[idx]
    }

    /// Keys stored on node `idx`, sorted.
    pub fn node_keys(&self, idx: usize) -> Vec<Bytes> {
        let mut keys: Vec<Bytes> = self.state().data[idx].keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, idx: usize, state: Arc<Mutex<State>>) {
    while let Ok((socket, _)) = listener.accept().await {
        let down = {
            let mut state = state.lock().unwrap();
            state.accepts[idx] += 1;
            state.down.contains(&idx)
        };
        if down {
            drop(socket);
            continue;
        }
        tokio::spawn(serve(socket, idx, state.clone()));
    }
}

async fn serve(socket: TcpStream, idx: usize, state: Arc<Mutex<State>>) {
    let mut connection = Connection::new(socket);
    let mut session = Session::default();
    while let Ok(frame) = connection.read_frame().await {
        let Some(args) = args_of(frame) else {
            return;
        };
        let reply = {
            let mut state = state.lock().unwrap();
            if state.down.contains(&idx) {
                return;
            }
            let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
            state.commands[idx].push(name);
            if state.stalled.contains(&idx) {
                None
            } else {
                Some(state.execute(idx, &args, &mut session))
            }
        };
        if let Some(reply) = reply {
            if connection.write_frame(&reply).await.is_err() {
                return;
            }
        }
    }
}

fn args_of(frame: Frame) -> Option<Vec<Bytes>> {
    match frame {
        Frame::Array(items) if !items.is_empty() => items
            .into_iter()
            .map(|item| match item {
                Frame::BulkString(Some(b)) => Some(b),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn ok() -> Frame {
    Frame::simple("OK")
}

fn err(message: &str) -> Frame {
    Frame::error(message)
}

fn wrong_type() -> Frame {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn is_read(name: &str) -> bool {
    matches!(name, "GET" | "EXISTS" | "MGET" | "TTL" | "SMEMBERS")
}

fn keys_of(name: &str, args: &[Bytes]) -> Vec<Bytes> {
    match name {
        "DEL" | "EXISTS" | "MGET" => args[1..].to_vec(),
        "MSET" => args[1..].iter().step_by(2).cloned().collect(),
        _ => args.get(1).cloned().into_iter().collect(),
    }
}

fn parse_int(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.parse().ok()
}

impl State {
    fn execute(&mut self, idx: usize, args: &[Bytes], session: &mut Session) -> Frame {
        let asking = std::mem::take(&mut session.asking);
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        match name.as_str() {
            "CLUSTER" => {
                self.slots_queries += 1;
                self.cluster_slots()
            }
            "ASKING" => {
                session.asking = true;
                ok()
            }
            "READONLY" => {
                session.readonly = true;
                ok()
            }
            "AUTH" => ok(),
            "PING" => Frame::simple("PONG"),
            "ECHO" => Frame::bulk(args.get(1).cloned().unwrap_or_default()),
            "DBSIZE" => Frame::Integer(self.data[idx].len() as i64),
            "FLUSHDB" => {
                self.data[idx].clear();
                ok()
            }
            "RANDOMKEY" => Frame::BulkString(self.data[idx].keys().min().cloned()),
            "INFO" => Frame::bulk(format!(
                "# Server\r\nredis_version:7.2.4\r\ntcp_port:{}\r\n\r\n# Keyspace\r\ndb0:keys={}\r\n",
                self.addresses[idx].rsplit_once(':').map(|(_, p)| p).unwrap_or(""),
                self.data[idx].len()
            )),
            _ => self.key_command(idx, &name, args, asking, session.readonly),
        }
    }

    fn key_command(
        &mut self,
        idx: usize,
        name: &str,
        args: &[Bytes],
        asking: bool,
        readonly: bool,
    ) -> Frame {
        let keys = keys_of(name, args);
        let Some(first) = keys.first() else {
            return err("ERR wrong number of arguments");
        };
        if self.cluster_down {
            return err("CLUSTERDOWN The cluster is down");
        }
        let slot = key_slot(first);
        if keys.iter().any(|k| key_slot(k) != slot) {
            return err("CROSSSLOT Keys in request don't hash to the same slot");
        }
        if self.redirect_loop.contains(&slot) {
            let next = (idx + 1) % self.addresses.len();
            return err(&format!("MOVED {} {}", slot, self.addresses[next]));
        }

        let owner = self.owners[usize::from(slot)];
        let target = if owner == idx {
            match self.asks.get(&slot) {
                Some(&to) if to != idx => {
                    return err(&format!("ASK {} {}", slot, self.addresses[to]));
                }
                _ => idx,
            }
        } else if asking && self.asks.get(&slot) == Some(&idx) {
            idx
        } else if readonly && is_read(name) && self.replica_of.get(&idx) == Some(&owner) {
            owner
        } else {
            return err(&format!("MOVED {} {}", slot, self.addresses[owner]));
        };
        self.apply(target, name, args)
    }

    fn apply(&mut self, idx: usize, name: &str, args: &[Bytes]) -> Frame {
        let data = &mut self.data[idx];
        let key = args[1].clone();
        match name {
            "GET" => match data.get(&key).map(|e| &e.value) {
                Some(Value::Str(v)) => Frame::bulk(v.clone()),
                Some(Value::Set(_)) => wrong_type(),
                None => Frame::BulkString(None),
            },
            "SET" => {
                let ttl = match args.get(3).map(|a| &a[..]) {
                    Some(b"EX") => args.get(4).and_then(|a| parse_int(a)),
                    _ => None,
                };
                data.insert(
                    key,
                    Entry {
                        value: Value::Str(args[2].clone()),
                        ttl,
                    },
                );
                ok()
            }
            "DEL" => Frame::Integer(
                args[1..]
                    .iter()
                    .filter(|k| data.remove(*k).is_some())
                    .count() as i64,
            ),
            "EXISTS" => Frame::Integer(
                args[1..].iter().filter(|k| data.contains_key(*k)).count() as i64,
            ),
            "INCRBY" | "DECRBY" => {
                let Some(delta) = parse_int(&args[2]) else {
                    return err("ERR value is not an integer or out of range");
                };
                let delta = if name == "DECRBY" { -delta } else { delta };
                let current = match data.get(&key).map(|e| &e.value) {
                    Some(Value::Str(v)) => match parse_int(v) {
                        Some(n) => n,
                        None => return err("ERR value is not an integer or out of range"),
                    },
                    Some(Value::Set(_)) => return wrong_type(),
                    None => 0,
                };
                let next = current + delta;
                let ttl = data.get(&key).and_then(|e| e.ttl);
                data.insert(
                    key,
                    Entry {
                        value: Value::Str(Bytes::from(next.to_string())),
                        ttl,
                    },
                );
                Frame::Integer(next)
            }
            "MGET" => Frame::Array(
                args[1..]
                    .iter()
                    .map(|k| match data.get(k).map(|e| &e.value) {
                        Some(Value::Str(v)) => Frame::bulk(v.clone()),
                        _ => Frame::BulkString(None),
                    })
                    .collect(),
            ),
            "MSET" => {
                for pair in args[1..].chunks(2) {
                    if let [k, v] = pair {
                        data.insert(
                            k.clone(),
                            Entry {
                                value: Value::Str(v.clone()),
                                ttl: None,
                            },
                        );
                    }
                }
                ok()
            }
            "EXPIRE" => match (data.get_mut(&key), args.get(2).and_then(|a| parse_int(a))) {
                (Some(entry), Some(secs)) => {
                    entry.ttl = Some(secs);
                    Frame::Integer(1)
                }
                _ => Frame::Integer(0),
            },
            "TTL" => Frame::Integer(match data.get(&key) {
                Some(entry) => entry.ttl.unwrap_or(-1),
                None => -2,
            }),
            "SADD" => {
                let entry = data.entry(key).or_insert_with(|| Entry {
                    value: Value::Set(BTreeSet::new()),
                    ttl: None,
                });
                match &mut entry.value {
                    Value::Set(members) => Frame::Integer(
                        args[2..]
                            .iter()
                            .filter(|m| members.insert((*m).clone()))
                            .count() as i64,
                    ),
                    Value::Str(_) => wrong_type(),
                }
            }
            "SMEMBERS" => match data.get(&key).map(|e| &e.value) {
                Some(Value::Set(members)) => {
                    Frame::Array(members.iter().cloned().map(Frame::bulk).collect())
                }
                Some(Value::Str(_)) => wrong_type(),
                None => Frame::Array(Vec::new()),
            },
            "SORT" => {
                let members: Vec<Bytes> = match data.get(&key).map(|e| &e.value) {
                    Some(Value::Set(members)) => members.iter().cloned().collect(),
                    Some(Value::Str(_)) => return wrong_type(),
                    None => Vec::new(),
                };
                let mut scored = Vec::with_capacity(members.len());
                for member in members {
                    let score: Option<f64> = std::str::from_utf8(&member)
                        .ok()
                        .and_then(|s| s.parse().ok());
                    match score {
                        Some(score) => scored.push((score, member)),
                        None => {
                            return err("ERR One or more scores can't be converted into double")
                        }
                    }
                }
                scored.sort_by(|a, b| a.0.total_cmp(&b.0));
                Frame::Array(scored.into_iter().map(|(_, m)| Frame::bulk(m)).collect())
            }
            other => err(&format!("ERR unknown command '{}'", other)),
        }
    }

    fn node_entry(&self, idx: usize) -> Frame {
        let (host, port) = self.addresses[idx].rsplit_once(':').unwrap();
        Frame::Array(vec![
            Frame::bulk(host.to_string()),
            Frame::Integer(port.parse().unwrap()),
            Frame::bulk(format!("{:040x}", idx + 1)),
        ])
    }

    fn slot_record(&self, start: usize, end: usize) -> Frame {
        let master = self.owners[start];
        let mut items = vec![
            Frame::Integer(start as i64),
            Frame::Integer(end as i64),
            self.node_entry(master),
        ];
        let mut replicas: Vec<usize> = self
            .replica_of
            .iter()
            .filter(|(_, m)| **m == master)
            .map(|(r, _)| *r)
            .collect();
        replicas.sort_unstable();
        items.extend(replicas.into_iter().map(|r| self.node_entry(r)));
        Frame::Array(items)
    }

    fn cluster_slots(&self) -> Frame {
        let count = self.owners.len();
        let mut records = Vec::new();
        let mut start = 0;
        for slot in 1..=count {
            if slot == count || self.owners[slot] != self.owners[start] {
                records.push(self.slot_record(start, slot - 1));
                start = slot;
            }
        }
        Frame::Array(records)
    }
}
