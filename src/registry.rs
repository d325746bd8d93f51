use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;

/// Sorted member ids of one (group, topic), as last published.
pub type Members = Vec<String>;

/// Group membership capability. Implementations publish this process under a
/// (group, topic) and let it observe the sorted peer set. The production
/// implementation sits on an external coordination service; `LocalRegistry`
/// covers single-process deployments and tests.
#[async_trait]
pub trait GroupRegistry: Send + Sync + 'static {
    async fn register(&self, group: &str, topic: &str, member_id: &str) -> Result<()>;

    async fn unregister(&self, group: &str, topic: &str, member_id: &str) -> Result<()>;

    /// Stream of sorted member id sets. The receiver's current value is the
    /// membership as of subscription.
    fn watch(&self, group: &str, topic: &str) -> watch::Receiver<Members>;
}

struct GroupEntry {
    tx: watch::Sender<Members>,
    // kept so watch() before the first register still observes updates
    _rx: watch::Receiver<Members>,
    members: std::sync::Mutex<BTreeSet<String>>,
}

impl GroupEntry {
    fn new() -> Self {
        let (tx, rx) = watch::channel(Vec::new());
        Self {
            tx,
            _rx: rx,
            members: std::sync::Mutex::new(BTreeSet::new()),
        }
    }

    fn publish(&self) {
        let members = self.members.lock().unwrap();
        self.tx.send_replace(members.iter().cloned().collect());
    }
}

/// In-process group registry: every service instance sharing one
/// `LocalRegistry` value participates in the same groups.
#[derive(Default)]
pub struct LocalRegistry {
    groups: DashMap<(String, String), GroupEntry>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl GroupRegistry for LocalRegistry {
    async fn register(&self, group: &str, topic: &str, member_id: &str) -> Result<()> {
        let key = (group.to_string(), topic.to_string());
        let entry = self.groups.entry(key).or_insert_with(GroupEntry::new);
        {
            let mut members = entry.members.lock().unwrap();
            if !members.insert(member_id.to_string()) {
                return Ok(());
            }
        }
        info!("member {member_id} registered under group [{group}] topic [{topic}]");
        entry.publish();
        Ok(())
    }

    async fn unregister(&self, group: &str, topic: &str, member_id: &str) -> Result<()> {
        let key = (group.to_string(), topic.to_string());
        if let Some(entry) = self.groups.get(&key) {
            {
                let mut members = entry.members.lock().unwrap();
                if !members.remove(member_id) {
                    return Ok(());
                }
            }
            info!("member {member_id} left group [{group}] topic [{topic}]");
            entry.publish();
        }
        Ok(())
    }

    fn watch(&self, group: &str, topic: &str) -> watch::Receiver<Members> {
        let key = (group.to_string(), topic.to_string());
        let entry = self.groups.entry(key).or_insert_with(GroupEntry::new);
        entry.tx.subscribe()
    }
}
