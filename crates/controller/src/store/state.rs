//! Deterministic key-value state machine
//!
//! Shared by the in-memory backend and the raft-log backend. Time is an
//! input of every lock command so replaying the same commands always yields
//! the same state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{is_direct_child, LockEvent, LockRecord, StoreError, StoreResult};

/// State machine command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Command {
    Put {
        key: String,
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
    Cas {
        key: String,
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
    },
    Acquire {
        name: String,
        holder: String,
        ttl_ms: i64,
        now_ms: i64,
    },
    Renew {
        name: String,
        holder: String,
        ttl_ms: i64,
        now_ms: i64,
    },
    Release {
        name: String,
        holder: String,
    },
    /// Drop the lock if it still carries `epoch` and has run out
    Expire {
        name: String,
        epoch: u64,
        now_ms: i64,
    },
}

/// Outcome of a successful command
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Applied {
    /// Lock change to broadcast, if any
    pub event: Option<(String, LockEvent)>,
    /// Epoch of the lock record written by acquire/renew
    pub epoch: Option<u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct KvState {
    kv: BTreeMap<String, Vec<u8>>,
    locks: BTreeMap<String, LockRecord>,
    next_epoch: u64,
}

impl KvState {
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.get(key).cloned()
    }

    pub fn list(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let start = format!("{}/", prefix);
        self.kv
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(&start))
            .filter(|(k, _)| is_direct_child(prefix, k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Current lock holder, ignoring leases that ran out
    pub fn lock_holder(&self, name: &str, now_ms: i64) -> Option<&LockRecord> {
        self.locks.get(name).filter(|r| !r.is_expired(now_ms))
    }

    pub fn lock_records(&self) -> impl Iterator<Item = (&String, &LockRecord)> {
        self.locks.iter()
    }

    pub fn apply(&mut self, cmd: Command) -> StoreResult<Applied> {
        match cmd {
            Command::Put { key, value } => {
                self.kv.insert(key, value);
                Ok(Applied::default())
            }
            Command::Delete { key } => {
                self.kv.remove(&key);
                Ok(Applied::default())
            }
            Command::Cas {
                key,
                expected,
                value,
            } => {
                if self.kv.get(&key) != expected.as_ref() {
                    return Err(StoreError::Conflict(key));
                }
                self.kv.insert(key, value);
                Ok(Applied::default())
            }
            Command::Acquire {
                name,
                holder,
                ttl_ms,
                now_ms,
            } => {
                let previous = self.lock_holder(&name, now_ms).map(|r| r.holder.clone());
                if let Some(current) = &previous {
                    if *current != holder {
                        return Err(StoreError::AlreadyHeld {
                            name,
                            holder: current.clone(),
                        });
                    }
                }
                let epoch = self.bump_epoch();
                self.locks.insert(
                    name.clone(),
                    LockRecord {
                        holder: holder.clone(),
                        expires_at_ms: now_ms.saturating_add(ttl_ms),
                        epoch,
                    },
                );
                let event = match previous {
                    Some(_) => None,
                    None => Some((name, LockEvent::held(holder))),
                };
                Ok(Applied {
                    event,
                    epoch: Some(epoch),
                })
            }
            Command::Renew {
                name,
                holder,
                ttl_ms,
                now_ms,
            } => {
                let owned = self
                    .lock_holder(&name, now_ms)
                    .map_or(false, |r| r.holder == holder);
                if !owned {
                    return Err(StoreError::LockLost(name));
                }
                let epoch = self.bump_epoch();
                if let Some(record) = self.locks.get_mut(&name) {
                    record.expires_at_ms = now_ms.saturating_add(ttl_ms);
                    record.epoch = epoch;
                }
                Ok(Applied {
                    event: None,
                    epoch: Some(epoch),
                })
            }
            Command::Release { name, holder } => {
                let owned = self.locks.get(&name).map_or(false, |r| r.holder == holder);
                if owned {
                    self.locks.remove(&name);
                    return Ok(Applied {
                        event: Some((name, LockEvent::released())),
                        epoch: None,
                    });
                }
                Ok(Applied::default())
            }
            Command::Expire {
                name,
                epoch,
                now_ms,
            } => {
                let due = self
                    .locks
                    .get(&name)
                    .map_or(false, |r| r.epoch == epoch && r.is_expired(now_ms));
                if due {
                    self.locks.remove(&name);
                    return Ok(Applied {
                        event: Some((name, LockEvent::released())),
                        epoch: None,
                    });
                }
                Ok(Applied::default())
            }
        }
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire(name: &str, holder: &str, now_ms: i64) -> Command {
        Command::Acquire {
            name: name.into(),
            holder: holder.into(),
            ttl_ms: 1000,
            now_ms,
        }
    }

    #[test]
    fn test_cas_absent_and_mismatch() {
        let mut state = KvState::default();
        let cas = |expected: Option<&[u8]>, value: &[u8]| Command::Cas {
            key: "/k".into(),
            expected: expected.map(|e| e.to_vec()),
            value: value.to_vec(),
        };
        state.apply(cas(None, b"1")).unwrap();
        assert_eq!(
            state.apply(cas(None, b"2")),
            Err(StoreError::Conflict("/k".into()))
        );
        assert!(state.apply(cas(Some(&b"x"[..]), b"2")).is_err());
        state.apply(cas(Some(&b"1"[..]), b"2")).unwrap();
        assert_eq!(state.get("/k"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_list_direct_children_sorted() {
        let mut state = KvState::default();
        for key in ["/p/b", "/p/a", "/p/a/deep", "/pq/x", "/p"] {
            state
                .apply(Command::Put {
                    key: key.into(),
                    value: key.as_bytes().to_vec(),
                })
                .unwrap();
        }
        let keys: Vec<_> = state.list("/p").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["/p/a".to_string(), "/p/b".to_string()]);
    }

    #[test]
    fn test_lock_lifecycle() {
        let mut state = KvState::default();
        let applied = state.apply(acquire("l", "a", 0)).unwrap();
        assert_eq!(applied.event, Some(("l".into(), LockEvent::held("a"))));

        // re-entrant
        assert!(state.apply(acquire("l", "a", 10)).unwrap().event.is_none());
        assert_eq!(
            state.apply(acquire("l", "b", 10)),
            Err(StoreError::AlreadyHeld {
                name: "l".into(),
                holder: "a".into()
            })
        );

        // expired lease can be taken over and is lost for the old holder
        state.apply(acquire("l", "b", 5000)).unwrap();
        let renew = Command::Renew {
            name: "l".into(),
            holder: "a".into(),
            ttl_ms: 1000,
            now_ms: 5001,
        };
        assert_eq!(state.apply(renew), Err(StoreError::LockLost("l".into())));

        // release by non-holder is a no-op
        let release = |holder: &str| Command::Release {
            name: "l".into(),
            holder: holder.into(),
        };
        assert!(state.apply(release("a")).unwrap().event.is_none());
        assert_eq!(
            state.apply(release("b")).unwrap().event,
            Some(("l".into(), LockEvent::released()))
        );
    }

    #[test]
    fn test_expire_respects_epoch() {
        let mut state = KvState::default();
        let first = state.apply(acquire("l", "a", 0)).unwrap().epoch.unwrap();
        let renew = Command::Renew {
            name: "l".into(),
            holder: "a".into(),
            ttl_ms: 1000,
            now_ms: 900,
        };
        state.apply(renew).unwrap();

        let stale = Command::Expire {
            name: "l".into(),
            epoch: first,
            now_ms: 1000,
        };
        assert!(state.apply(stale).unwrap().event.is_none());
        assert!(state.lock_holder("l", 1000).is_some());
        assert!(state.lock_holder("l", 1900).is_none());
    }
}
