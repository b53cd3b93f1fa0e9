use diesel::prelude::*;
use chrono::prelude::*;
use diesel_async::{RunQueryDsl, AsyncConnection, AsyncPgConnection};
use std::collections::HashMap;
use crate::authz::AuthorizationState;
use crate::schema::{authorizations, order_fqdn_sets, order_to_authz, orders, requested_names};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Deactivated,
}

/// One authorization an order links to, as found in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkedAuthorization {
    /// Never persisted, or purged after expiry.
    Missing,
    Present(AuthorizationState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderRequest {
    pub registration_id: i64,
    pub expires: DateTime<Utc>,
    pub names: Vec<String>,
    pub authorization_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: i64,
    pub registration_id: i64,
    pub expires: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub names: Vec<String>,
    pub authorization_ids: Vec<i64>,
    pub began_processing: bool,
    pub certificate_serial: Option<String>,
    pub status: OrderStatus,
}

/// Derives the externally visible status of an order. Rules are checked in
/// order and the first that applies wins:
///
/// 1. invalid if any authorization is invalid or expired, or is missing while
///    the order itself has expired
/// 2. deactivated if any authorization is deactivated
/// 3. pending if any authorization is pending
/// 4. valid once a certificate serial is recorded
/// 5. processing once the processing flag is set
/// 6. ready otherwise
///
/// A missing authorization on a live order, or an order without any
/// authorizations, cannot be given a status and is an `InvalidRequest`.
pub fn derive_order_status(
    order: &crate::models::Order, linked: &[LinkedAuthorization], now: DateTime<Utc>,
) -> crate::Result<OrderStatus> {
    if linked.is_empty() {
        return Err(crate::Error::invalid(format!("order {} has no authorizations", order.id)));
    }

    let order_expired = order.expires <= now;
    let mut missing = false;
    let mut deactivated = false;
    let mut pending = false;
    for authz in linked {
        match authz {
            LinkedAuthorization::Present(AuthorizationState::Invalid) |
            LinkedAuthorization::Present(AuthorizationState::Expired) => return Ok(OrderStatus::Invalid),
            LinkedAuthorization::Missing if order_expired => return Ok(OrderStatus::Invalid),
            LinkedAuthorization::Missing => missing = true,
            LinkedAuthorization::Present(AuthorizationState::Deactivated) => deactivated = true,
            LinkedAuthorization::Present(AuthorizationState::Pending) => pending = true,
            LinkedAuthorization::Present(AuthorizationState::Valid) => {}
        }
    }

    if missing {
        return Err(crate::Error::invalid(format!(
            "order {} references an authorization that does not exist", order.id
        )));
    }
    if deactivated {
        return Ok(OrderStatus::Deactivated);
    }
    if pending {
        return Ok(OrderStatus::Pending);
    }
    if order.certificate_serial.as_deref().map_or(false, |s| !s.is_empty()) {
        return Ok(OrderStatus::Valid);
    }
    if order.began_processing {
        return Ok(OrderStatus::Processing);
    }
    Ok(OrderStatus::Ready)
}

async fn linked_authorizations(
    conn: &mut AsyncPgConnection, authz_ids: &[i64], now: DateTime<Utc>,
) -> crate::Result<Vec<LinkedAuthorization>> {
    let rows: Vec<crate::models::Authorization> = authorizations::table
        .filter(authorizations::dsl::id.eq_any(authz_ids.to_vec()))
        .get_results(conn).await?;
    let states = rows.into_iter()
        .map(|a| (a.id, a.status_at(now)))
        .collect::<HashMap<_, _>>();

    Ok(authz_ids.iter().map(|id| match states.get(id) {
        Some(s) => LinkedAuthorization::Present(*s),
        None => LinkedAuthorization::Missing,
    }).collect())
}

/// Loads everything hanging off an order row and derives its status.
async fn load_order(
    conn: &mut AsyncPgConnection, row: crate::models::Order, now: DateTime<Utc>,
) -> crate::Result<Order> {
    let authorization_ids: Vec<i64> = order_to_authz::table
        .filter(order_to_authz::dsl::order_id.eq(row.id))
        .select(order_to_authz::dsl::authz_id)
        .order(order_to_authz::dsl::authz_id.asc())
        .get_results(conn).await?;
    let names: Vec<String> = requested_names::table
        .filter(requested_names::dsl::order_id.eq(row.id))
        .select(requested_names::dsl::reversed_name)
        .order(requested_names::dsl::id.asc())
        .get_results(conn).await?;

    let linked = linked_authorizations(conn, &authorization_ids, now).await?;
    let status = derive_order_status(&row, &linked, now)?;

    Ok(Order {
        id: row.id,
        registration_id: row.registration_id,
        expires: row.expires,
        created: row.created,
        names: names.iter().map(|n| crate::names::reverse_name(n)).collect(),
        authorization_ids,
        began_processing: row.began_processing,
        certificate_serial: row.certificate_serial,
        status,
    })
}

async fn find_order(conn: &mut AsyncPgConnection, id: i64) -> crate::Result<crate::models::Order> {
    match orders::table.find(id).get_result(conn).await.optional()? {
        Some(o) => Ok(o),
        None => Err(crate::Error::not_found(format!("order {}", id))),
    }
}

impl crate::StorageAuthority {
    /// Creates an order together with its authorization links, requested
    /// names and name-set row.
    pub async fn new_order(&self, req: &NewOrderRequest) -> crate::Result<Order> {
        if req.names.is_empty() {
            return Err(crate::Error::invalid("order has no names"));
        }
        if req.authorization_ids.is_empty() {
            return Err(crate::Error::invalid("order has no authorizations"));
        }

        let now = self.now();
        let req = req.clone();
        let mut conn = self.get_db_conn().await?;
        let order = conn.transaction(|conn| Box::pin(async move {
            let row: crate::models::Order = diesel::insert_into(orders::table)
                .values(&crate::models::NewOrder {
                    registration_id: req.registration_id,
                    expires: req.expires,
                    created: now,
                    began_processing: false,
                })
                .get_result(conn).await?;

            let mut authz_ids = req.authorization_ids.clone();
            authz_ids.sort_unstable();
            authz_ids.dedup();
            let links = authz_ids.iter().map(|authz_id| crate::models::OrderToAuthz {
                order_id: row.id,
                authz_id: *authz_id,
            }).collect::<Vec<_>>();
            diesel::insert_into(order_to_authz::table)
                .values(&links)
                .execute(conn).await?;

            let names = req.names.iter().map(|name| crate::models::NewRequestedName {
                order_id: row.id,
                reversed_name: crate::names::reverse_name(name),
            }).collect::<Vec<_>>();
            diesel::insert_into(requested_names::table)
                .values(&names)
                .execute(conn).await?;

            let set_hash = crate::fqdn_set::hash_names(&req.names);
            diesel::insert_into(order_fqdn_sets::table)
                .values(&crate::models::NewOrderFqdnSet {
                    set_hash: &set_hash,
                    order_id: row.id,
                    registration_id: row.registration_id,
                    expires: row.expires,
                })
                .execute(conn).await?;

            load_order(conn, row, now).await
        })).await?;

        info!("Created order {} for account {} with {} name(s)", order.id, order.registration_id, order.names.len());
        Ok(order)
    }

    pub async fn get_order(&self, id: i64) -> crate::Result<Order> {
        let now = self.now();
        let mut conn = self.get_db_conn().await?;
        let row = find_order(&mut conn, id).await?;
        load_order(&mut conn, row, now).await
    }

    /// Marks a pending or ready order as being processed. Repeating the call
    /// on a processing order is a no-op; any other status is a conflict.
    pub async fn set_order_processing(&self, id: i64) -> crate::Result<()> {
        let now = self.now();
        let mut conn = self.get_db_conn().await?;
        conn.transaction(|conn| Box::pin(async move {
            let row = find_order(conn, id).await?;
            let order = load_order(conn, row, now).await?;
            match order.status {
                OrderStatus::Pending | OrderStatus::Ready => {}
                OrderStatus::Processing => return Ok(()),
                s => return Err(crate::Error::conflict(format!(
                    "order {} is {:?} and cannot begin processing", id, s
                ))),
            }

            diesel::update(orders::table.find(id))
                .set(orders::dsl::began_processing.eq(true))
                .execute(conn).await?;
            Ok::<_, crate::Error>(())
        })).await
    }

    /// Records the issued certificate's serial on a processing order. A
    /// second finalization is detected by the serial already being present.
    pub async fn finalize_order(&self, id: i64, serial: &str) -> crate::Result<()> {
        if serial.is_empty() {
            return Err(crate::Error::invalid("cannot finalize an order with an empty serial"));
        }

        let serial = serial.to_string();
        let mut conn = self.get_db_conn().await?;
        conn.transaction(|conn| Box::pin(async move {
            let updated = diesel::update(
                orders::table
                    .filter(orders::dsl::id.eq(id))
                    .filter(orders::dsl::began_processing.eq(true))
                    .filter(orders::dsl::certificate_serial.is_null())
            ).set(orders::dsl::certificate_serial.eq(Some(serial.as_str())))
                .execute(conn).await?;
            if updated == 0 {
                let row = find_order(conn, id).await?;
                return Err(if row.certificate_serial.is_some() {
                    crate::Error::conflict(format!("order {} is already finalized", id))
                } else {
                    crate::Error::conflict(format!("order {} is not processing", id))
                });
            }
            info!("Finalized order {} with certificate {}", id, serial);
            Ok::<_, crate::Error>(())
        })).await
    }

    /// The account's most recent unexpired order for exactly this name set,
    /// if it can still be reused. Finalized, failed and expired orders, and
    /// orders whose authorizations were purged, are reported as `NotFound`.
    pub async fn get_order_for_names(
        &self, registration_id: i64, names: &[String], now: DateTime<Utc>,
    ) -> crate::Result<Order> {
        let set_hash = crate::fqdn_set::hash_names(names);
        let mut conn = self.get_db_conn().await?;
        let order_id: Option<i64> = order_fqdn_sets::table
            .filter(order_fqdn_sets::dsl::set_hash.eq(set_hash))
            .filter(order_fqdn_sets::dsl::registration_id.eq(registration_id))
            .filter(order_fqdn_sets::dsl::expires.gt(now))
            .select(order_fqdn_sets::dsl::order_id)
            .order(order_fqdn_sets::dsl::order_id.desc())
            .first(&mut conn).await.optional()?;
        let order_id = match order_id {
            Some(id) => id,
            None => return Err(crate::Error::not_found("no unexpired order for names")),
        };

        let row = find_order(&mut conn, order_id).await?;
        let order = match load_order(&mut conn, row, now).await {
            Ok(o) => o,
            // A purged authorization leaves the order with no status to reuse.
            Err(e) if e.is_invalid_request() => {
                debug!("Not reusing order {}: {}", order_id, e);
                return Err(crate::Error::not_found("no reusable order for names"));
            }
            Err(e) => return Err(e),
        };
        match order.status {
            OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => Ok(order),
            s => {
                debug!("Not reusing order {} in status {:?}", order.id, s);
                Err(crate::Error::not_found("no reusable order for names"))
            }
        }
    }
}
