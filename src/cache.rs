//! Latest-known liveness per address.
//!
//! SQLite holds the durable copy; an in-memory snapshot per segment serves
//! reads. A write commits one transaction that replaces the segment's rows,
//! then swaps the segment's snapshot, so readers see either the previous
//! cycle or the new one in full.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rusqlite::{params, Connection};
use rusqlite::types::Type;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{LivenessMap, LivenessRecord, SegmentId};

pub struct StatusCache {
    db: Database,
    snapshots: RwLock<HashMap<SegmentId, Arc<LivenessMap>>>,
}

impl StatusCache {
    /// Load every persisted record into memory.
    pub fn open(db: Database) -> Result<Self> {
        let mut snapshots: HashMap<SegmentId, LivenessMap> = HashMap::new();
        {
            let conn = db.lock();
            let mut stmt = conn.prepare(
                "SELECT segment_id, address, status, response_time_ms, mac, previous_mac, \
                 conflict, updated_at FROM liveness",
            )?;
            let rows = stmt.query_map([], |row| {
                let status: String = row.get(2)?;
                let record = LivenessRecord {
                    address: row.get(1)?,
                    status: status.parse().map_err(|e: String| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
                    })?,
                    response_time_ms: row.get(3)?,
                    mac: row.get(4)?,
                    previous_mac: row.get(5)?,
                    conflict: row.get(6)?,
                    updated_at: row.get(7)?,
                };
                Ok((row.get::<_, SegmentId>(0)?, record))
            })?;
            for row in rows {
                let (segment_id, record) = row?;
                snapshots
                    .entry(segment_id)
                    .or_default()
                    .insert(record.address.clone(), record);
            }
        }
        let loaded: usize = snapshots.values().map(|m| m.len()).sum();
        debug!(segments = snapshots.len(), records = loaded, "status cache loaded");
        Ok(Self {
            db,
            snapshots: RwLock::new(
                snapshots
                    .into_iter()
                    .map(|(id, map)| (id, Arc::new(map)))
                    .collect(),
            ),
        })
    }

    /// Replace everything cached for `segment_id` with `records`.
    ///
    /// On failure nothing changes on disk or in memory. The connection stays
    /// locked until the snapshot is swapped.
    pub fn put(&self, segment_id: SegmentId, records: LivenessMap) -> Result<()> {
        let mut conn = self.db.lock();
        persist(&mut conn, segment_id, &records).map_err(|e| Error::CacheWrite(e.to_string()))?;
        let count = records.len();
        self.write_snapshots().insert(segment_id, Arc::new(records));
        drop(conn);
        debug!(segment_id, records = count, "status cache updated");
        Ok(())
    }

    /// All cached records for a segment; empty if none were ever written.
    pub fn latest_for_segment(&self, segment_id: SegmentId) -> Arc<LivenessMap> {
        self.read_snapshots()
            .get(&segment_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The cached record for one address, wherever it lives.
    pub fn latest_for_address(&self, address: &str) -> Option<LivenessRecord> {
        self.read_snapshots()
            .values()
            .find_map(|map| map.get(address).cloned())
    }

    /// Every cached record across segments.
    pub fn latest_all(&self) -> LivenessMap {
        self.read_snapshots()
            .values()
            .flat_map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    /// Forget a deleted segment. Its rows are removed by the cascade.
    pub fn evict(&self, segment_id: SegmentId) {
        if self.write_snapshots().remove(&segment_id).is_some() {
            info!(segment_id, "cached status evicted");
        }
    }

    fn read_snapshots(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SegmentId, Arc<LivenessMap>>> {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshots(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SegmentId, Arc<LivenessMap>>> {
        self.snapshots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn persist(conn: &mut Connection, segment_id: SegmentId, records: &LivenessMap) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM liveness WHERE segment_id = ?1", params![segment_id])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO liveness (segment_id, address, status, response_time_ms, mac, \
             previous_mac, conflict, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for record in records.values() {
            stmt.execute(params![
                segment_id,
                record.address,
                record.status.as_str(),
                record.response_time_ms,
                record.mac,
                record.previous_mac,
                record.conflict,
                record.updated_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::AddressSpace;
    use crate::types::{LivenessStatus, NewSegment};

    fn record(ip: &str, status: LivenessStatus) -> LivenessRecord {
        LivenessRecord {
            address: ip.to_string(),
            status,
            response_time_ms: Some(7),
            mac: Some("00:11:22:33:44:01".into()),
            previous_mac: None,
            conflict: false,
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn seeded() -> (Database, SegmentId) {
        let db = Database::open_in_memory().unwrap();
        let (seg, _) = AddressSpace::new(db.clone())
            .create_segment(NewSegment {
                name: "lab".into(),
                cidr: "10.0.0.0/29".into(),
                ..Default::default()
            })
            .unwrap();
        (db, seg.id)
    }

    #[test]
    fn read_after_write_returns_exact_records() {
        let (db, seg) = seeded();
        let cache = StatusCache::open(db).unwrap();
        let mut records = LivenessMap::new();
        records.insert("10.0.0.1".into(), record("10.0.0.1", LivenessStatus::Online));
        records.insert("10.0.0.2".into(), record("10.0.0.2", LivenessStatus::Offline));
        cache.put(seg, records.clone()).unwrap();
        assert_eq!(*cache.latest_for_segment(seg), records);
        assert_eq!(
            cache.latest_for_address("10.0.0.2").map(|r| r.status),
            Some(LivenessStatus::Offline)
        );
        assert!(cache.latest_for_address("10.0.0.3").is_none());
    }

    #[test]
    fn put_overwrites_whole_segment() {
        let (db, seg) = seeded();
        let cache = StatusCache::open(db).unwrap();
        let mut first = LivenessMap::new();
        first.insert("10.0.0.1".into(), record("10.0.0.1", LivenessStatus::Online));
        first.insert("10.0.0.2".into(), record("10.0.0.2", LivenessStatus::Online));
        cache.put(seg, first).unwrap();

        let mut second = LivenessMap::new();
        second.insert("10.0.0.3".into(), record("10.0.0.3", LivenessStatus::Blocked));
        cache.put(seg, second.clone()).unwrap();
        assert_eq!(*cache.latest_for_segment(seg), second);
    }

    #[test]
    fn snapshot_held_by_reader_is_stable() {
        let (db, seg) = seeded();
        let cache = StatusCache::open(db).unwrap();
        let mut first = LivenessMap::new();
        first.insert("10.0.0.1".into(), record("10.0.0.1", LivenessStatus::Online));
        cache.put(seg, first.clone()).unwrap();

        let held = cache.latest_for_segment(seg);
        cache.put(seg, LivenessMap::new()).unwrap();
        assert_eq!(*held, first);
        assert!(cache.latest_for_segment(seg).is_empty());
    }

    #[test]
    fn write_for_missing_segment_fails_cleanly() {
        let (db, _) = seeded();
        let cache = StatusCache::open(db).unwrap();
        let mut records = LivenessMap::new();
        records.insert("10.9.9.9".into(), record("10.9.9.9", LivenessStatus::Online));
        let err = cache.put(4242, records).unwrap_err();
        assert!(matches!(err, Error::CacheWrite(_)));
        assert!(cache.latest_for_segment(4242).is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipam.db");
        let seg = {
            let db = Database::open(&path).unwrap();
            let (seg, _) = AddressSpace::new(db.clone())
                .create_segment(NewSegment {
                    name: "lab".into(),
                    cidr: "10.0.0.0/29".into(),
                    ..Default::default()
                })
                .unwrap();
            let cache = StatusCache::open(db).unwrap();
            let mut records = LivenessMap::new();
            records.insert("10.0.0.4".into(), record("10.0.0.4", LivenessStatus::Online));
            cache.put(seg.id, records).unwrap();
            seg.id
        };
        let cache = StatusCache::open(Database::open(&path).unwrap()).unwrap();
        assert_eq!(cache.latest_for_segment(seg).len(), 1);
        assert_eq!(
            cache.latest_for_address("10.0.0.4").and_then(|r| r.mac),
            Some("00:11:22:33:44:01".to_string())
        );
    }
}
