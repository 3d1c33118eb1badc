// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-installer
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rumi_audit::{AuditCategory, AuditEntry, AuditLogger, AuditSeverity};
use rumi_core::fsio::atomic_write;
use rumi_core::{CapError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Seconds a rejection keeps a candidate out of `pending`.
pub const DEFAULT_COOLDOWN_SECONDS: i64 = 3600;

/// Rejections after which a candidate becomes `blocked`.
pub const DEFAULT_REJECT_THRESHOLD: u32 = 3;

/// Candidate lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    /// Awaiting an operator decision.
    Pending,
    /// Approved and installed.
    Installed,
    /// Rejected; returns to pending once the cooldown expires.
    Rejected,
    /// Absorbing until an explicit unblock.
    Blocked,
}

/// One tracked candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// `"{pack_id}:{artifact_path}:{sha256}"`.
    pub candidate_key: String,
    /// Declaring pack.
    pub pack_id: String,
    /// Pack-relative artifact path.
    pub artifact_ref: String,
    /// SHA-256 of the artifact contents.
    pub artifact_sha256: String,
    /// Persisted state (see [`InstallerState::effective_status`]).
    pub status: CandidateStatus,
    /// First discovery time.
    pub first_seen: DateTime<Utc>,
    /// Time of the most recent transition.
    pub last_action: DateTime<Utc>,
    /// Consecutive rejections so far.
    pub reject_count: u32,
    /// End of the current rejection cooldown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Journal entry; the snapshot is an idempotent fold of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Event {
    ts: DateTime<Utc>,
    candidate_key: String,
    action: Action,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    detail: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Discover,
    Approve,
    Reject,
    Block,
    Unblock,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    candidates: BTreeMap<String, Candidate>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlockedList {
    keys: Vec<String>,
}

/// Compute a candidate key. A change in any component yields a new
/// candidate.
pub fn make_candidate_key(pack_id: &str, artifact_path: &str, artifact_sha256: &str) -> String {
    format!("{pack_id}:{artifact_path}:{artifact_sha256}")
}

/// SHA-256 of artifact bytes, hex-encoded.
pub fn artifact_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// State machine for one installer family.
///
/// Transitions append to the journal first, then atomically replace the
/// snapshot; a missing snapshot is rebuilt by replaying the journal.
#[derive(Clone)]
pub struct InstallerState {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    audit: AuditLogger,
    index: Mutex<Index>,
    cooldown: Duration,
    reject_threshold: u32,
}

impl InstallerState {
    /// Open (or create) the state for a family rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, audit: AuditLogger) -> Self {
        let dir = dir.into();
        let index = load_index(&dir);
        Self {
            inner: Arc::new(Inner {
                dir,
                audit,
                index: Mutex::new(index),
                cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECONDS),
                reject_threshold: DEFAULT_REJECT_THRESHOLD,
            }),
        }
    }

    /// Record a newly declared artifact. Idempotent per candidate key; an
    /// existing candidate is returned unchanged.
    pub fn discover(
        &self,
        pack_id: &str,
        artifact_ref: &str,
        artifact_sha256: &str,
    ) -> Result<Candidate, CapError> {
        let key = make_candidate_key(pack_id, artifact_ref, artifact_sha256);
        let mut index = self.inner.index.lock();
        if let Some(existing) = index.candidates.get(&key) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let candidate = Candidate {
            candidate_key: key.clone(),
            pack_id: pack_id.to_string(),
            artifact_ref: artifact_ref.to_string(),
            artifact_sha256: artifact_sha256.to_string(),
            status: CandidateStatus::Pending,
            first_seen: now,
            last_action: now,
            reject_count: 0,
            cooldown_until: None,
        };
        index.candidates.insert(key.clone(), candidate.clone());
        self.commit(
            &mut index,
            Event {
                ts: now,
                candidate_key: key,
                action: Action::Discover,
                detail: json!({"pack_id": pack_id, "artifact_ref": artifact_ref}),
            },
        )?;
        Ok(candidate)
    }

    /// Approve a candidate. Fails with `blocked` on a blocked candidate and
    /// with `not_found` on an unknown key; approving an installed candidate
    /// is a no-op.
    pub fn approve(&self, candidate_key: &str) -> Result<Candidate, CapError> {
        let mut index = self.inner.index.lock();
        let candidate = index
            .candidates
            .get(candidate_key)
            .cloned()
            .ok_or_else(|| not_found(candidate_key))?;
        match candidate.status {
            CandidateStatus::Blocked => {
                self.inner.audit.log(
                    AuditEntry::new(
                        AuditCategory::Installer,
                        AuditSeverity::Warning,
                        "candidate_approve_blocked",
                        false,
                    )
                    .principal(&candidate.pack_id)
                    .details(json!({"candidate_key": candidate_key})),
                );
                Err(CapError::new(
                    ErrorKind::Blocked,
                    "Candidate is blocked; unblock before approving",
                ))
            }
            CandidateStatus::Installed => Ok(candidate),
            CandidateStatus::Pending | CandidateStatus::Rejected => {
                let updated = self.transition(
                    &mut index,
                    candidate_key,
                    Action::Approve,
                    |c, now| {
                        c.status = CandidateStatus::Installed;
                        c.cooldown_until = None;
                        c.last_action = now;
                    },
                )?;
                Ok(updated)
            }
        }
    }

    /// Reject a candidate: bumps `reject_count`, starts the cooldown, and
    /// blocks at the threshold.
    pub fn reject(&self, candidate_key: &str) -> Result<Candidate, CapError> {
        let mut index = self.inner.index.lock();
        let current = index
            .candidates
            .get(candidate_key)
            .cloned()
            .ok_or_else(|| not_found(candidate_key))?;
        if current.status == CandidateStatus::Blocked {
            return Ok(current);
        }
        let cooldown = self.inner.cooldown;
        let threshold = self.inner.reject_threshold;
        let updated = self.transition(&mut index, candidate_key, Action::Reject, |c, now| {
            c.reject_count += 1;
            c.last_action = now;
            if c.reject_count >= threshold {
                c.status = CandidateStatus::Blocked;
                c.cooldown_until = None;
            } else {
                c.status = CandidateStatus::Rejected;
                c.cooldown_until = Some(now + cooldown);
            }
        })?;
        if updated.status == CandidateStatus::Blocked {
            self.append_event(Event {
                ts: Utc::now(),
                candidate_key: candidate_key.to_string(),
                action: Action::Block,
                detail: json!({"reject_count": updated.reject_count}),
            })?;
            self.persist_snapshots(&index)?;
        }
        Ok(updated)
    }

    /// Explicitly block a candidate.
    pub fn block(&self, candidate_key: &str) -> Result<Candidate, CapError> {
        let mut index = self.inner.index.lock();
        index
            .candidates
            .get(candidate_key)
            .ok_or_else(|| not_found(candidate_key))?;
        self.transition(&mut index, candidate_key, Action::Block, |c, now| {
            c.status = CandidateStatus::Blocked;
            c.cooldown_until = None;
            c.last_action = now;
        })
    }

    /// Leave the blocked state: the candidate returns to `pending` with a
    /// cleared rejection history.
    pub fn unblock(&self, candidate_key: &str) -> Result<Candidate, CapError> {
        let mut index = self.inner.index.lock();
        index
            .candidates
            .get(candidate_key)
            .ok_or_else(|| not_found(candidate_key))?;
        self.transition(&mut index, candidate_key, Action::Unblock, |c, now| {
            c.status = CandidateStatus::Pending;
            c.reject_count = 0;
            c.cooldown_until = None;
            c.last_action = now;
        })
    }

    /// A candidate as persisted.
    pub fn get(&self, candidate_key: &str) -> Option<Candidate> {
        self.inner.index.lock().candidates.get(candidate_key).cloned()
    }

    /// The candidate's state with cooldown expiry applied: a rejected
    /// candidate whose cooldown has passed reads as `pending`.
    pub fn effective_status(&self, candidate_key: &str) -> Option<CandidateStatus> {
        let candidate = self.get(candidate_key)?;
        Some(match candidate.status {
            CandidateStatus::Rejected
                if candidate
                    .cooldown_until
                    .is_none_or(|until| until <= Utc::now()) =>
            {
                CandidateStatus::Pending
            }
            other => other,
        })
    }

    /// All candidates, keyed.
    pub fn candidates(&self) -> BTreeMap<String, Candidate> {
        self.inner.index.lock().candidates.clone()
    }

    fn transition(
        &self,
        index: &mut Index,
        candidate_key: &str,
        action: Action,
        apply: impl FnOnce(&mut Candidate, DateTime<Utc>),
    ) -> Result<Candidate, CapError> {
        let now = Utc::now();
        let candidate = index
            .candidates
            .get_mut(candidate_key)
            .ok_or_else(|| not_found(candidate_key))?;
        apply(candidate, now);
        let snapshot = candidate.clone();
        self.commit(
            index,
            Event {
                ts: now,
                candidate_key: candidate_key.to_string(),
                action,
                detail: json!({
                    "status": snapshot.status,
                    "reject_count": snapshot.reject_count,
                }),
            },
        )?;
        self.inner.audit.log(
            AuditEntry::new(
                AuditCategory::Installer,
                AuditSeverity::Info,
                format!("candidate_{}", action_name(action)),
                true,
            )
            .principal(&snapshot.pack_id)
            .details(json!({"candidate_key": candidate_key, "status": snapshot.status})),
        );
        Ok(snapshot)
    }

    // Journal first, snapshot second.
    fn commit(&self, index: &mut Index, event: Event) -> Result<(), CapError> {
        self.append_event(event)?;
        self.persist_snapshots(index)
    }

    fn append_event(&self, event: Event) -> Result<(), CapError> {
        std::fs::create_dir_all(&self.inner.dir).map_err(write_error)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .map_err(write_error)?;
        let line = serde_json::to_string(&event).map_err(|_| CapError::internal())?;
        writeln!(file, "{line}").map_err(write_error)
    }

    fn persist_snapshots(&self, index: &Index) -> Result<(), CapError> {
        let bytes = serde_json::to_vec_pretty(index).map_err(|_| CapError::internal())?;
        atomic_write(&self.index_path(), &bytes).map_err(write_error)?;

        let blocked = BlockedList {
            keys: index
                .candidates
                .iter()
                .filter(|(_, c)| c.status == CandidateStatus::Blocked)
                .map(|(k, _)| k.clone())
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&blocked).map_err(|_| CapError::internal())?;
        atomic_write(&self.blocked_path(), &bytes).map_err(write_error)
    }

    fn journal_path(&self) -> PathBuf {
        self.inner.dir.join("requests.jsonl")
    }

    fn index_path(&self) -> PathBuf {
        self.inner.dir.join("index.json")
    }

    fn blocked_path(&self) -> PathBuf {
        self.inner.dir.join("blocked.json")
    }
}

impl std::fmt::Debug for InstallerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallerState")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

fn action_name(action: Action) -> &'static str {
    match action {
        Action::Discover => "discovered",
        Action::Approve => "approved",
        Action::Reject => "rejected",
        Action::Block => "blocked",
        Action::Unblock => "unblocked",
    }
}

fn not_found(candidate_key: &str) -> CapError {
    CapError::new(
        ErrorKind::NotFound,
        format!("Unknown candidate: {candidate_key}"),
    )
}

fn write_error(e: std::io::Error) -> CapError {
    CapError::new(ErrorKind::WriteError, format!("Installer state write failed: {e}"))
}

// Snapshot if present, else a replay of the journal.
fn load_index(dir: &Path) -> Index {
    if let Ok(raw) = std::fs::read(dir.join("index.json"))
        && let Ok(index) = serde_json::from_slice::<Index>(&raw)
    {
        return index;
    }
    replay_journal(dir)
}

fn replay_journal(dir: &Path) -> Index {
    let mut index = Index::default();
    let Ok(raw) = std::fs::read_to_string(dir.join("requests.jsonl")) else {
        return index;
    };
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(event) = serde_json::from_str::<Event>(line) else {
            warn!(target: "rumi.installer", "skipping malformed journal line");
            continue;
        };
        apply_event(&mut index, &event);
    }
    index
}

fn apply_event(index: &mut Index, event: &Event) {
    match event.action {
        Action::Discover => {
            index
                .candidates
                .entry(event.candidate_key.clone())
                .or_insert_with(|| {
                    let (pack_id, artifact_ref, sha) = split_key(&event.candidate_key);
                    Candidate {
                        candidate_key: event.candidate_key.clone(),
                        pack_id,
                        artifact_ref,
                        artifact_sha256: sha,
                        status: CandidateStatus::Pending,
                        first_seen: event.ts,
                        last_action: event.ts,
                        reject_count: 0,
                        cooldown_until: None,
                    }
                });
        }
        Action::Approve => {
            if let Some(c) = index.candidates.get_mut(&event.candidate_key) {
                c.status = CandidateStatus::Installed;
                c.cooldown_until = None;
                c.last_action = event.ts;
            }
        }
        Action::Reject => {
            if let Some(c) = index.candidates.get_mut(&event.candidate_key) {
                c.reject_count += 1;
                c.last_action = event.ts;
                if c.reject_count >= DEFAULT_REJECT_THRESHOLD {
                    c.status = CandidateStatus::Blocked;
                    c.cooldown_until = None;
                } else {
                    c.status = CandidateStatus::Rejected;
                    c.cooldown_until =
                        Some(event.ts + Duration::seconds(DEFAULT_COOLDOWN_SECONDS));
                }
            }
        }
        Action::Block => {
            if let Some(c) = index.candidates.get_mut(&event.candidate_key) {
                c.status = CandidateStatus::Blocked;
                c.cooldown_until = None;
                c.last_action = event.ts;
            }
        }
        Action::Unblock => {
            if let Some(c) = index.candidates.get_mut(&event.candidate_key) {
                c.status = CandidateStatus::Pending;
                c.reject_count = 0;
                c.cooldown_until = None;
                c.last_action = event.ts;
            }
        }
    }
}

fn split_key(key: &str) -> (String, String, String) {
    let mut parts = key.splitn(3, ':');
    (
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
    )
}
