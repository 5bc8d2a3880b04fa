//! Zone membership changes
//!
//! Adding and removing zone servers are ordinary log commands on the
//! `zone_server_pool` table, so every server updates its [`ZoneDirectory`]
//! when the command is applied. The operations must be issued at a server
//! of the zone being changed and are carried out by that zone's leader.
//!
//! [`ZoneDirectory`]: crate::zone::directory::ZoneDirectory

use crate::common::{AuditEventType, Error, FederationMode, Result, ServerId, ZoneId};
use crate::consensus::FedTag;
use crate::zone::context::ServerContext;
use crate::zone::directory::ZoneServer;
use tracing::info;

const POOL_INSERT: &str =
    "INSERT INTO zone_server_pool (zone_id, server_id, name, endpoint) VALUES (";
const POOL_DELETE: &str = "DELETE FROM zone_server_pool WHERE zone_id = ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(ZoneServer),
    Delete { zone_id: ZoneId, server_id: ServerId },
}

impl MembershipChange {
    pub fn to_sql(&self) -> String {
        match self {
            MembershipChange::Add(s) => format!(
                "{}{}, {}, {}, {})",
                POOL_INSERT,
                s.zone_id,
                s.id,
                quote(&s.name),
                quote(&s.endpoint)
            ),
            MembershipChange::Delete { zone_id, server_id } => {
                format!("{}{} AND server_id = {}", POOL_DELETE, zone_id, server_id)
            }
        }
    }

    /// Recognize a membership command. Any other statement yields `None`.
    pub fn parse(sql: &str) -> Option<Self> {
        let sql = sql.trim();

        if let Some(rest) = sql.strip_prefix(POOL_INSERT) {
            let values = split_values(rest.strip_suffix(')')?)?;
            let [zone_id, id, name, endpoint]: [String; 4] = values.try_into().ok()?;
            return Some(MembershipChange::Add(ZoneServer {
                zone_id: zone_id.parse().ok()?,
                id: id.parse().ok()?,
                name,
                endpoint,
            }));
        }

        let rest = sql.strip_prefix(POOL_DELETE)?;
        let (zone_id, server_id) = rest.split_once(" AND server_id = ")?;
        Some(MembershipChange::Delete {
            zone_id: zone_id.trim().parse().ok()?,
            server_id: server_id.trim().parse().ok()?,
        })
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Split a `VALUES` body into bare or single-quoted fields
fn split_values(body: &str) -> Option<Vec<String>> {
    let mut values = Vec::new();
    let mut chars = body.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next()? {
                    '\'' if chars.next_if_eq(&'\'').is_some() => value.push('\''),
                    '\'' => break,
                    c => value.push(c),
                }
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
        } else {
            while let Some(c) = chars.next_if(|&c| c != ',') {
                value.push(c);
            }
            value = value.trim().to_string();
        }
        values.push(value);

        match chars.next() {
            Some(',') => continue,
            None => return Some(values),
            Some(_) => return None,
        }
    }
}

fn check_zone(ctx: &ServerContext, zone_id: ZoneId) -> Result<()> {
    let local = ctx.config.zone_id;
    if zone_id != local {
        return Err(Error::MembershipRedirect {
            requested: zone_id,
            local,
        });
    }
    Ok(())
}

fn fed_tag(ctx: &ServerContext) -> FedTag {
    // master zones mirror their pool to slaves
    match ctx.config.federation.mode {
        FederationMode::Master => FedTag::Next,
        _ => FedTag::None,
    }
}

/// Register a new server in `zone_id`. Returns its assigned id.
pub async fn add_server(
    ctx: &ServerContext,
    zone_id: ZoneId,
    name: &str,
    endpoint: &str,
    actor: &str,
) -> Result<ServerId> {
    let raft = ctx.raft()?;
    check_zone(ctx, zone_id)?;
    if endpoint.is_empty() {
        return Err(Error::Malformed("server endpoint is required".into()));
    }

    let _serial = ctx.membership_lock().lock().await;

    let directory = raft.directory();
    if directory.contains_endpoint(zone_id, endpoint) {
        return Err(Error::Membership(format!(
            "endpoint {} is already registered in zone {}",
            endpoint, zone_id
        )));
    }

    let members_before = directory.len(zone_id);
    let existing: Vec<ServerId> = directory
        .peers(zone_id, raft.server_id())
        .iter()
        .map(|s| s.id)
        .collect();
    let server_id = directory.next_server_id(zone_id);
    let server = ZoneServer {
        zone_id,
        id: server_id,
        name: match name {
            "" => format!("zs{}", server_id),
            name => name.to_string(),
        },
        endpoint: endpoint.to_string(),
    };

    let index = raft
        .replicate(&MembershipChange::Add(server).to_sql(), fed_tag(ctx))
        .await?;

    // the leader starts replicating to the new server once the change is
    // applied, except in a two-member zone where the follower must hold it first
    if members_before == 2 {
        raft.wait_replicated(index, &existing, ctx.config.raft.membership_wait())
            .await?;
    }

    info!(
        "zone {}: added server {} at {} (log index {})",
        zone_id, server_id, endpoint, index
    );
    ctx.audit.log_event(
        AuditEventType::ServerAdded,
        actor,
        Some(format!("zone/{}/server/{}", zone_id, server_id)),
        "server added",
        Some(serde_json::json!({ "endpoint": endpoint, "index": index })),
    );
    Ok(server_id)
}

/// Remove `server_id` from `zone_id`
pub async fn delete_server(
    ctx: &ServerContext,
    zone_id: ZoneId,
    server_id: ServerId,
    actor: &str,
) -> Result<ServerId> {
    let raft = ctx.raft()?;
    check_zone(ctx, zone_id)?;

    let _serial = ctx.membership_lock().lock().await;

    if raft.directory().get(zone_id, server_id).is_none() {
        return Err(Error::Membership(format!(
            "server {} is not a member of zone {}",
            server_id, zone_id
        )));
    }
    if server_id == raft.server_id() && raft.is_leader() {
        return Err(Error::Membership(
            "the current leader cannot remove itself".into(),
        ));
    }

    let change = MembershipChange::Delete { zone_id, server_id };
    let index = raft.replicate(&change.to_sql(), fed_tag(ctx)).await?;

    info!(
        "zone {}: removed server {} (log index {})",
        zone_id, server_id, index
    );
    ctx.audit.log_event(
        AuditEventType::ServerDeleted,
        actor,
        Some(format!("zone/{}/server/{}", zone_id, server_id)),
        "server deleted",
        Some(serde_json::json!({ "index": index })),
    );
    Ok(server_id)
}

/// Make the leader re-match `server_id` from the end of its log
pub async fn reset_server(
    ctx: &ServerContext,
    zone_id: ZoneId,
    server_id: ServerId,
    actor: &str,
) -> Result<ServerId> {
    let raft = ctx.raft()?;
    check_zone(ctx, zone_id)?;

    raft.reset_follower(server_id)?;

    ctx.audit.log_event(
        AuditEventType::ServerReset,
        actor,
        Some(format!("zone/{}/server/{}", zone_id, server_id)),
        "replication index reset",
        None,
    );
    Ok(server_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_statement_escapes_quotes() {
        let change = MembershipChange::Add(ZoneServer {
            zone_id: 2,
            id: 7,
            name: "o'brien, zs7".into(),
            endpoint: "http://10.0.0.7:2634".into(),
        });
        let sql = change.to_sql();
        assert_eq!(
            sql,
            "INSERT INTO zone_server_pool (zone_id, server_id, name, endpoint) \
             VALUES (2, 7, 'o''brien, zs7', 'http://10.0.0.7:2634')"
        );
        assert_eq!(MembershipChange::parse(&sql), Some(change));
    }

    #[test]
    fn test_delete_statement() {
        let sql = "DELETE FROM zone_server_pool WHERE zone_id = 1 AND server_id = 4";
        assert_eq!(
            MembershipChange::parse(sql),
            Some(MembershipChange::Delete {
                zone_id: 1,
                server_id: 4
            })
        );
    }

    #[test]
    fn test_other_statements_are_not_membership() {
        assert_eq!(MembershipChange::parse("INSERT INTO vms VALUES (1)"), None);
        assert_eq!(
            MembershipChange::parse(
                "INSERT INTO zone_server_pool (zone_id, server_id, name, endpoint) VALUES (1, 2)"
            ),
            None
        );
        assert_eq!(
            MembershipChange::parse("DELETE FROM zone_server_pool WHERE zone_id = x AND server_id = 1"),
            None
        );
    }
}
