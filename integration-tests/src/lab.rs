use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use shoal_raft::{Persister, Transport};
use shoal_shardkv::{Config, ShardController};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Inbound half of a node: the lab routes `Transport::send` calls here.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn handle(&self, method: &str, args: Bytes) -> Result<Bytes>;
}

struct Slot {
    svc: Arc<dyn RpcService>,
    connected: bool,
}

/// In-memory RPC fabric with per-node connectivity control. A call to or
/// from a disconnected node loses its reply, which the caller must treat as
/// an unknown outcome.
pub struct LabNet {
    nodes: Mutex<HashMap<String, Slot>>,
}

impl LabNet {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, name: &str, svc: Arc<dyn RpcService>) {
        self.nodes.lock().unwrap().insert(
            name.to_owned(),
            Slot {
                svc,
                connected: true,
            },
        );
    }

    pub fn set_connected(&self, name: &str, connected: bool) {
        if let Some(slot) = self.nodes.lock().unwrap().get_mut(name) {
            slot.connected = connected;
        }
    }

    /// Unregistered callers (clients) are always reachable.
    fn connected(&self, name: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.connected)
            .unwrap_or(true)
    }

    pub fn transport(self: &Arc<Self>, me: &str) -> Arc<LabTransport> {
        Arc::new(LabTransport {
            net: self.clone(),
            me: me.to_owned(),
        })
    }
}

pub struct LabTransport {
    net: Arc<LabNet>,
    me: String,
}

#[async_trait]
impl Transport for LabTransport {
    async fn send(&self, peer: &str, method: &str, args: Bytes) -> Result<Bytes> {
        let svc = {
            let nodes = self.net.nodes.lock().unwrap();
            let caller_up = nodes.get(&self.me).map(|s| s.connected).unwrap_or(true);
            match nodes.get(peer) {
                Some(slot) if caller_up && slot.connected => Some(slot.svc.clone()),
                _ => None,
            }
        };
        let Some(svc) = svc else {
            tokio::time::sleep(Duration::from_millis(30)).await;
            bail!("no reply from {peer}");
        };
        let reply = svc.handle(method, args).await?;
        // A partition cut mid-call drops the reply, not the request.
        if !self.net.connected(&self.me) || !self.net.connected(peer) {
            bail!("no reply from {peer}");
        }
        Ok(reply)
    }
}

/// In-memory `Persister`. The state/snapshot pair is swapped under one lock,
/// which is what makes `save_state_and_snapshot` atomic.
#[derive(Default)]
pub struct MemPersister {
    inner: Mutex<(Bytes, Bytes)>,
}

impl MemPersister {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Persister for MemPersister {
    fn save_raft_state(&self, state: Bytes) {
        self.inner.lock().unwrap().0 = state;
    }

    fn save_state_and_snapshot(&self, state: Bytes, snapshot: Bytes) {
        *self.inner.lock().unwrap() = (state, snapshot);
    }

    fn read_raft_state(&self) -> Bytes {
        self.inner.lock().unwrap().0.clone()
    }

    fn read_snapshot(&self) -> Bytes {
        self.inner.lock().unwrap().1.clone()
    }

    fn raft_state_size(&self) -> usize {
        self.inner.lock().unwrap().0.len()
    }
}

/// Controller stub fed by the test script. Configuration 0 is always
/// present; `publish` appends the next numbered configuration.
pub struct ScriptedController {
    configs: Mutex<Vec<Config>>,
}

impl ScriptedController {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            configs: Mutex::new(vec![Config::default()]),
        })
    }

    pub fn publish(&self, config: Config) {
        let mut configs = self.configs.lock().unwrap();
        assert_eq!(config.num, configs.last().unwrap().num + 1);
        configs.push(config);
    }

    pub fn latest_num(&self) -> u64 {
        self.configs.lock().unwrap().last().unwrap().num
    }
}

#[async_trait]
impl ShardController for ScriptedController {
    async fn query(&self, num: Option<u64>) -> Config {
        let configs = self.configs.lock().unwrap();
        match num {
            Some(n) => configs
                .iter()
                .find(|c| c.num == n)
                .unwrap_or_else(|| configs.last().unwrap())
                .clone(),
            None => configs.last().unwrap().clone(),
        }
    }
}
