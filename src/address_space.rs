//! Segments and their address pools.
//!
//! A segment's pool is created in the same transaction as the segment row and
//! is only ever removed by deleting the segment. Individual addresses change
//! solely through status transitions.

use std::net::Ipv4Addr;
use std::str::FromStr;

use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::arp::normalize_mac;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::netdetect::{is_usable_host, parse_segment_cidr, usable_host_count, usable_hosts};
use crate::types::{
    now_rfc3339, AddressId, AddressStatus, IpAddress, NewSegment, Segment, SegmentId,
    SegmentStats, SegmentWithStats,
};

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 1000;

const SEGMENT_COLUMNS: &str = "id, name, cidr, vlan_id, gateway, dns_primary, dns_secondary, \
                               tags, description, created_at";
const ADDRESS_COLUMNS: &str =
    "id, address, segment_id, status, device_id, hostname, mac_address, notes";

/// Filters for [`AddressSpace::list_addresses`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressQuery {
    #[serde(default)]
    pub segment_id: Option<SegmentId>,
    #[serde(default)]
    pub status: Option<AddressStatus>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AddressPage {
    pub items: Vec<IpAddress>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// Assignment request for [`AddressSpace::assign`]. `status` defaults to `in_use`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Assignment {
    #[serde(default)]
    pub device_id: Option<i64>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: Option<AddressStatus>,
}

/// Owns segments and their address pools.
#[derive(Clone)]
pub struct AddressSpace {
    db: Database,
    max_hosts: Option<u64>,
}

impl AddressSpace {
    pub fn new(db: Database) -> Self {
        Self { db, max_hosts: None }
    }

    /// Refuse segments with more usable addresses than `limit`.
    pub fn with_host_limit(mut self, limit: u64) -> Self {
        self.max_hosts = Some(limit);
        self
    }

    /// Validate `new` and create the segment together with one address row
    /// per usable host. Returns the segment and the number of rows created.
    pub fn create_segment(&self, new: NewSegment) -> Result<(Segment, u64)> {
        let net = parse_segment_cidr(&new.cidr)?;
        let cidr = net.to_string();
        let hosts = usable_host_count(net);
        if let Some(limit) = self.max_hosts {
            if hosts > limit {
                return Err(Error::SegmentTooLarge { cidr, hosts, limit });
            }
        }

        let gateway = match new.gateway.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
            Some(raw) => {
                let ip = parse_ipv4(raw)?;
                if !is_usable_host(net, ip) {
                    return Err(Error::InvalidGateway {
                        gateway: raw.to_string(),
                        cidr,
                    });
                }
                Some(ip)
            }
            None => None,
        };
        let dns_primary = optional_ipv4(new.dns_primary.as_deref())?;
        let dns_secondary = optional_ipv4(new.dns_secondary.as_deref())?;
        let name = if new.name.trim().is_empty() {
            cidr.clone()
        } else {
            new.name.trim().to_string()
        };
        let tags = serde_json::to_string(&new.tags)?;
        let created_at = now_rfc3339();
        let network = u32::from(net.network()) as i64;
        let broadcast = u32::from(net.broadcast()) as i64;

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT cidr FROM segments WHERE network <= ?2 AND broadcast >= ?1 LIMIT 1",
                params![network, broadcast],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            return Err(Error::CidrOverlap { cidr, existing });
        }

        tx.execute(
            "INSERT INTO segments (name, cidr, network, broadcast, vlan_id, gateway, dns_primary, \
             dns_secondary, tags, description, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                name,
                cidr,
                network,
                broadcast,
                new.vlan_id,
                gateway.map(|g| g.to_string()),
                dns_primary,
                dns_secondary,
                tags,
                new.description,
                created_at,
            ],
        )?;
        let id = tx.last_insert_rowid();

        let mut created = 0u64;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ip_addresses (segment_id, address, address_num, status) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for ip in usable_hosts(net) {
                let status = if Some(ip) == gateway {
                    AddressStatus::Gateway
                } else {
                    AddressStatus::Free
                };
                stmt.execute(params![id, ip.to_string(), u32::from(ip) as i64, status.as_str()])?;
                created += 1;
            }
        }
        tx.commit()?;

        info!(segment_id = id, cidr = %cidr, addresses = created, "segment created");

        let segment = Segment {
            id,
            name,
            cidr,
            vlan_id: new.vlan_id,
            gateway: gateway.map(|g| g.to_string()),
            dns_primary,
            dns_secondary,
            tags: new.tags,
            description: new.description,
            created_at,
        };
        Ok((segment, created))
    }

    /// Delete a segment; its addresses and liveness rows cascade.
    pub fn delete_segment(&self, id: SegmentId) -> Result<()> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM segments WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(Error::SegmentNotFound(id));
        }
        info!(segment_id = id, "segment deleted");
        Ok(())
    }

    pub fn get_segment(&self, id: SegmentId) -> Result<Segment> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {SEGMENT_COLUMNS} FROM segments WHERE id = ?1"),
            params![id],
            segment_from_row,
        )
        .optional()?
        .ok_or(Error::SegmentNotFound(id))
    }

    /// All segments with usage statistics, ordered by network address.
    pub fn list_segments(&self) -> Result<Vec<SegmentWithStats>> {
        let segments: Vec<Segment> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments ORDER BY network"
            ))?;
            let rows = stmt.query_map([], segment_from_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        segments
            .into_iter()
            .map(|segment| {
                let stats = self.segment_stats(segment.id)?;
                Ok(SegmentWithStats { segment, stats })
            })
            .collect()
    }

    pub fn segment_stats(&self, id: SegmentId) -> Result<SegmentStats> {
        let conn = self.db.lock();
        let (total, free): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'free' THEN 1 ELSE 0 END), 0) \
             FROM ip_addresses WHERE segment_id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total = total as u64;
        let free = free as u64;
        let used = total - free;
        let usage_percent = if total == 0 {
            0.0
        } else {
            ((used as f64 / total as f64) * 10_000.0).round() / 100.0
        };
        Ok(SegmentStats {
            total,
            used,
            free,
            usage_percent,
        })
    }

    /// Every address of a segment in numeric order.
    pub fn segment_addresses(&self, id: SegmentId) -> Result<Vec<IpAddress>> {
        let conn = self.db.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM segments WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(Error::SegmentNotFound(id));
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {ADDRESS_COLUMNS} FROM ip_addresses WHERE segment_id = ?1 ORDER BY address_num"
        ))?;
        let rows = stmt.query_map(params![id], address_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Paginated, filterable address listing.
    pub fn list_addresses(&self, query: &AddressQuery) -> Result<AddressPage> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(segment_id) = query.segment_id {
            values.push(Value::Integer(segment_id));
            clauses.push(format!("segment_id = ?{}", values.len()));
        }
        if let Some(status) = query.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            values.push(Value::Text(format!("%{}%", escape_like(search))));
            let n = values.len();
            clauses.push(format!(
                "(address LIKE ?{n} ESCAPE '\\' OR hostname LIKE ?{n} ESCAPE '\\' \
                 OR mac_address LIKE ?{n} ESCAPE '\\' OR notes LIKE ?{n} ESCAPE '\\')"
            ));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.db.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM ip_addresses {where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let offset = (page as i64 - 1) * limit as i64;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ADDRESS_COLUMNS} FROM ip_addresses {where_sql} \
             ORDER BY segment_id, address_num LIMIT {limit} OFFSET {offset}"
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), address_from_row)?;
        let items = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(AddressPage {
            items,
            total: total as u64,
            page,
            limit,
        })
    }

    pub fn get_address(&self, id: AddressId) -> Result<IpAddress> {
        let conn = self.db.lock();
        fetch_address(&conn, id)
    }

    /// Move an address to `in_use` (default) or `reserved` and record who holds it.
    pub fn assign(&self, id: AddressId, req: Assignment) -> Result<IpAddress> {
        let target = req.status.unwrap_or(AddressStatus::InUse);
        let mac = match req.mac_address.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            Some(raw) => Some(normalize_mac(raw).ok_or_else(|| Error::InvalidMac(raw.to_string()))?),
            None => None,
        };

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let current = fetch_address(&tx, id)?;
        let allowed = matches!(target, AddressStatus::InUse | AddressStatus::Reserved)
            && matches!(
                current.status,
                AddressStatus::Free | AddressStatus::InUse | AddressStatus::Reserved
            );
        if !allowed {
            return Err(Error::InvalidTransition {
                id,
                from: current.status,
                to: target,
            });
        }
        tx.execute(
            "UPDATE ip_addresses SET status = ?2, \
             device_id = COALESCE(?3, device_id), hostname = COALESCE(?4, hostname), \
             mac_address = COALESCE(?5, mac_address), notes = COALESCE(?6, notes) \
             WHERE id = ?1",
            params![id, target.as_str(), req.device_id, req.hostname, mac, req.notes],
        )?;
        let updated = fetch_address(&tx, id)?;
        tx.commit()?;
        info!(address = %updated.address, status = %updated.status, "address assigned");
        Ok(updated)
    }

    /// Return an address to the free pool and clear its assignment fields.
    pub fn release(&self, id: AddressId) -> Result<IpAddress> {
        self.transition(id, AddressStatus::Free, |from| from != AddressStatus::Gateway)
    }

    /// Take a free or reserved address out of circulation.
    pub fn block(&self, id: AddressId) -> Result<IpAddress> {
        self.transition(id, AddressStatus::Blocked, |from| {
            matches!(
                from,
                AddressStatus::Free | AddressStatus::Reserved | AddressStatus::Blocked
            )
        })
    }

    fn transition(
        &self,
        id: AddressId,
        to: AddressStatus,
        allowed: impl Fn(AddressStatus) -> bool,
    ) -> Result<IpAddress> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let current = fetch_address(&tx, id)?;
        if !allowed(current.status) {
            return Err(Error::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }
        if to == AddressStatus::Free {
            tx.execute(
                "UPDATE ip_addresses SET status = ?2, device_id = NULL, hostname = NULL, \
                 mac_address = NULL, notes = NULL WHERE id = ?1",
                params![id, to.as_str()],
            )?;
        } else {
            tx.execute(
                "UPDATE ip_addresses SET status = ?2 WHERE id = ?1",
                params![id, to.as_str()],
            )?;
        }
        let updated = fetch_address(&tx, id)?;
        tx.commit()?;
        info!(address = %updated.address, from = %current.status, to = %to, "address status changed");
        Ok(updated)
    }
}

fn fetch_address(conn: &rusqlite::Connection, id: AddressId) -> Result<IpAddress> {
    conn.query_row(
        &format!("SELECT {ADDRESS_COLUMNS} FROM ip_addresses WHERE id = ?1"),
        params![id],
        address_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::AddressNotFound(id.to_string()))
}

/// Make `%`, `_` and `\` match literally in a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn parse_ipv4(raw: &str) -> Result<Ipv4Addr> {
    raw.trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(raw.to_string()))
}

fn optional_ipv4(raw: Option<&str>) -> Result<Option<String>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Ok(Some(parse_ipv4(s)?.to_string())),
        None => Ok(None),
    }
}

fn parse_text<T: FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn segment_from_row(row: &Row<'_>) -> rusqlite::Result<Segment> {
    let tags_raw: String = row.get(7)?;
    let tags = serde_json::from_str(&tags_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(Segment {
        id: row.get(0)?,
        name: row.get(1)?,
        cidr: row.get(2)?,
        vlan_id: row.get(3)?,
        gateway: row.get(4)?,
        dns_primary: row.get(5)?,
        dns_secondary: row.get(6)?,
        tags,
        description: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn address_from_row(row: &Row<'_>) -> rusqlite::Result<IpAddress> {
    Ok(IpAddress {
        id: row.get(0)?,
        address: row.get(1)?,
        segment_id: row.get(2)?,
        status: parse_text(3, row.get(3)?)?,
        device_id: row.get(4)?,
        hostname: row.get(5)?,
        mac_address: row.get(6)?,
        notes: row.get(7)?,
    })
}
