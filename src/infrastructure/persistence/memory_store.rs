//! 内存会话存储
//!
//! 单节点部署与测试使用。过期采用惰性判定：读到已过期的条目时视为不存在并移除。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::repository::SessionStore;
use crate::error::{RealtimeError, Result};

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Set(HashSet<String>),
    Counter(i64),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// 基于 DashMap 的会话存储
#[derive(Debug)]
pub struct InMemorySessionStore {
    entries: DashMap<String, StoredEntry>,
    available: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// 模拟存储不可用（故障演练）
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 未过期的键数量
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RealtimeError::Store("session store unavailable".to_string()))
        }
    }

    /// 读取条目，顺带清理已过期的条目
    fn live_entry(&self, key: &str) -> Option<StoredEntry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }

    fn wrong_type(key: &str) -> RealtimeError {
        RealtimeError::Store(format!(
            "WRONGTYPE operation against a key holding the wrong kind of value: {}",
            key
        ))
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        match self.live_entry(key) {
            Some(StoredEntry {
                value: StoredValue::Text(text),
                ..
            }) => Ok(Some(text)),
            Some(StoredEntry {
                value: StoredValue::Counter(n),
                ..
            }) => Ok(Some(n.to_string())),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<usize> {
        self.ensure_available()?;
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredEntry {
                        value: StoredValue::Set(HashSet::from([member.to_string()])),
                        expires_at: None,
                    });
                    return Ok(1);
                }
                match &mut occupied.get_mut().value {
                    StoredValue::Set(members) => Ok(usize::from(members.insert(member.to_string()))),
                    _ => Err(Self::wrong_type(key)),
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry {
                    value: StoredValue::Set(HashSet::from([member.to_string()])),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<usize> {
        self.ensure_available()?;
        let now = Instant::now();
        let removed = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => match &mut entry.value {
                StoredValue::Set(members) => usize::from(members.remove(member)),
                _ => return Err(Self::wrong_type(key)),
            },
            _ => 0,
        };
        // 空集合等价于不存在
        self.entries.remove_if(key, |_, e| {
            matches!(&e.value, StoredValue::Set(members) if members.is_empty())
        });
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        match self.live_entry(key) {
            Some(StoredEntry {
                value: StoredValue::Set(members),
                ..
            }) => Ok(members.into_iter().collect()),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                value: StoredValue::Counter(0),
                expires_at: None,
            });
        if entry.is_expired(now) {
            *entry = StoredEntry {
                value: StoredValue::Counter(0),
                expires_at: None,
            };
        }
        match &mut entry.value {
            StoredValue::Counter(n) => {
                *n += delta;
                Ok(*n)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }
}
