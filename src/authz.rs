use diesel::prelude::*;
use chrono::prelude::*;
use diesel_async::{RunQueryDsl, AsyncConnection, AsyncPgConnection};
use std::collections::HashMap;
use crate::models::{AuthorizationStatus, ChallengeStatus, ChallengeType};
use crate::schema::{authorizations, challenges, order_to_authz, orders};

/// Status of an authorization as observed at a point in time. `Expired` is
/// never stored; it is what a pending or valid authorization turns into once
/// its expiry has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationState {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRecord {
    pub hostname: String,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub addresses_resolved: Vec<std::net::IpAddr>,
    #[serde(default)]
    pub address_used: Option<std::net::IpAddr>,
}

/// Structured description of why validation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    pub challenge_type: ChallengeType,
    pub token: String,
}

/// An authorization to be created in the pending state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub identifier: String,
    pub registration_id: i64,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<PendingChallenge>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub id: i64,
    pub challenge_type: ChallengeType,
    pub token: String,
    pub status: ChallengeStatus,
    pub validated: Option<DateTime<Utc>>,
    pub validation_records: Vec<ValidationRecord>,
    pub error: Option<ProblemDetails>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub id: i64,
    pub identifier: String,
    pub registration_id: i64,
    pub status: AuthorizationState,
    pub expires: DateTime<Utc>,
    pub attempted: Option<ChallengeType>,
    pub challenges: Vec<Challenge>,
}

/// The outcome of validating a pending authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeAuthorization {
    pub id: i64,
    /// Either `Valid` or `Invalid`.
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
    pub attempted: ChallengeType,
    pub validation_records: Vec<ValidationRecord>,
    pub validation_error: Option<ProblemDetails>,
}

impl crate::models::Challenge {
    pub fn to_challenge(&self) -> Challenge {
        Challenge {
            id: self.id,
            challenge_type: self.challenge_type,
            token: self.token.clone(),
            status: self.status,
            validated: self.validated,
            validation_records: self.validation_records.clone()
                .and_then(|r| serde_json::from_value(r).ok())
                .unwrap_or_default(),
            error: self.error.clone().and_then(|e| serde_json::from_value(e).ok()),
        }
    }
}

fn check_pending(authz: &PendingAuthorization) -> crate::Result<()> {
    if authz.identifier.is_empty() {
        return Err(crate::Error::invalid("authorization has no identifier"));
    }
    if authz.challenges.is_empty() {
        return Err(crate::Error::invalid(format!("authorization for {} has no challenges", authz.identifier)));
    }
    if authz.challenges.iter().any(|c| c.token.is_empty()) {
        return Err(crate::Error::invalid(format!("authorization for {} has a challenge without a token", authz.identifier)));
    }
    Ok(())
}

/// Attaches challenges (in creation order) to authorization rows.
pub(crate) async fn load_authorizations(
    conn: &mut AsyncPgConnection, rows: Vec<crate::models::Authorization>, now: DateTime<Utc>,
) -> crate::Result<Vec<Authorization>> {
    let ids = rows.iter().map(|a| a.id).collect::<Vec<_>>();
    let challenge_rows: Vec<crate::models::Challenge> = challenges::table
        .filter(challenges::dsl::authorization_id.eq_any(ids))
        .order(challenges::dsl::id.asc())
        .get_results(conn).await?;

    let mut by_authz: HashMap<i64, Vec<Challenge>> = HashMap::new();
    for c in &challenge_rows {
        by_authz.entry(c.authorization_id).or_default().push(c.to_challenge());
    }

    Ok(rows.into_iter().map(|a| Authorization {
        status: a.status_at(now),
        challenges: by_authz.remove(&a.id).unwrap_or_default(),
        id: a.id,
        identifier: a.identifier,
        registration_id: a.registration_id,
        expires: a.expires,
        attempted: a.attempted,
    }).collect())
}

/// Keeps, per identifier, the first authorization in `authzs`.
fn first_per_identifier(authzs: Vec<Authorization>) -> HashMap<String, Authorization> {
    let mut out = HashMap::new();
    for a in authzs {
        out.entry(a.identifier.clone()).or_insert(a);
    }
    out
}

impl crate::StorageAuthority {
    /// Inserts pending authorizations and their challenges in one
    /// transaction, returning the new IDs in input order.
    pub async fn new_authorizations(&self, authzs: &[PendingAuthorization]) -> crate::Result<Vec<i64>> {
        for authz in authzs {
            check_pending(authz)?;
        }

        let authzs = authzs.to_vec();
        let mut conn = self.get_db_conn().await?;
        conn.transaction(|conn| Box::pin(async move {
            let mut ids = Vec::with_capacity(authzs.len());
            for authz in &authzs {
                let id = diesel::insert_into(authorizations::table)
                    .values(&crate::models::NewAuthorization {
                        identifier: &authz.identifier,
                        registration_id: authz.registration_id,
                        status: AuthorizationStatus::Pending,
                        expires: authz.expires,
                    })
                    .returning(authorizations::dsl::id)
                    .get_result::<i64>(conn).await?;

                let new_challenges = authz.challenges.iter().map(|c| crate::models::NewChallenge {
                    authorization_id: id,
                    challenge_type: c.challenge_type,
                    token: &c.token,
                    status: ChallengeStatus::Pending,
                }).collect::<Vec<_>>();
                diesel::insert_into(challenges::table)
                    .values(&new_challenges)
                    .execute(conn).await?;
                ids.push(id);
            }
            Ok::<_, crate::Error>(ids)
        })).await
    }

    pub async fn create_pending_authorization(&self, authz: &PendingAuthorization) -> crate::Result<i64> {
        let ids = self.new_authorizations(std::slice::from_ref(authz)).await?;
        ids.into_iter().next()
            .ok_or_else(|| crate::Error::Storage("authorization insert returned no ID".to_string()))
    }

    pub async fn get_authorization(&self, id: i64) -> crate::Result<Authorization> {
        let now = self.now();
        let mut conn = self.get_db_conn().await?;
        let row: crate::models::Authorization = match authorizations::table.find(id)
            .get_result(&mut conn).await.optional()? {
            Some(a) => a,
            None => return Err(crate::Error::not_found(format!("authorization {}", id))),
        };
        let mut authzs = load_authorizations(&mut conn, vec![row], now).await?;
        authzs.pop().ok_or_else(|| crate::Error::not_found(format!("authorization {}", id)))
    }

    /// Moves a pending authorization to valid or invalid, exactly once, and
    /// records the result on the attempted challenge.
    pub async fn finalize_authorization(&self, req: &FinalizeAuthorization) -> crate::Result<()> {
        let challenge_status = match req.status {
            AuthorizationStatus::Valid => ChallengeStatus::Valid,
            AuthorizationStatus::Invalid => ChallengeStatus::Invalid,
            s => return Err(crate::Error::invalid(format!("authorization cannot be finalized as {:?}", s))),
        };
        let records = serde_json::to_value(&req.validation_records)
            .map_err(|e| crate::Error::invalid(format!("unserializable validation records: {}", e)))?;
        let error = match &req.validation_error {
            Some(p) => Some(serde_json::to_value(p)
                .map_err(|e| crate::Error::invalid(format!("unserializable problem: {}", e)))?),
            None => None,
        };
        let validated = match req.status {
            AuthorizationStatus::Valid => Some(self.now()),
            _ => None,
        };
        let delete_unused = self.options.delete_unused_challenges;
        let req = req.clone();

        let mut conn = self.get_db_conn().await?;
        conn.transaction(|conn| Box::pin(async move {
            let updated = diesel::update(
                authorizations::table
                    .filter(authorizations::dsl::id.eq(req.id))
                    .filter(authorizations::dsl::status.eq(AuthorizationStatus::Pending))
            ).set((
                authorizations::dsl::status.eq(req.status),
                authorizations::dsl::expires.eq(req.expires),
                authorizations::dsl::attempted.eq(Some(req.attempted)),
            )).execute(conn).await?;
            if updated == 0 {
                let exists = diesel::select(diesel::dsl::exists(authorizations::table.find(req.id)))
                    .get_result::<bool>(conn).await?;
                return Err(if exists {
                    crate::Error::conflict(format!("authorization {} is not pending", req.id))
                } else {
                    crate::Error::not_found(format!("authorization {}", req.id))
                });
            }

            let updated = diesel::update(
                challenges::table
                    .filter(challenges::dsl::authorization_id.eq(req.id))
                    .filter(challenges::dsl::challenge_type.eq(req.attempted))
            ).set((
                challenges::dsl::status.eq(challenge_status),
                challenges::dsl::validated.eq(validated),
                challenges::dsl::validation_records.eq(Some(records)),
                challenges::dsl::error.eq(error),
            )).execute(conn).await?;
            if updated == 0 {
                return Err(crate::Error::invalid(format!(
                    "authorization {} has no {:?} challenge", req.id, req.attempted
                )));
            }

            if delete_unused {
                let deleted = diesel::delete(
                    challenges::table
                        .filter(challenges::dsl::authorization_id.eq(req.id))
                        .filter(challenges::dsl::challenge_type.ne(req.attempted))
                ).execute(conn).await?;
                debug!("Dropped {} unattempted challenge(s) of authorization {}", deleted, req.id);
            }
            Ok::<_, crate::Error>(())
        })).await
    }

    /// Deactivates a pending or valid authorization. Irreversible.
    pub async fn deactivate_authorization(&self, id: i64) -> crate::Result<()> {
        let mut conn = self.get_db_conn().await?;
        let updated = diesel::update(
            authorizations::table
                .filter(authorizations::dsl::id.eq(id))
                .filter(authorizations::dsl::status.eq_any(vec![
                    AuthorizationStatus::Pending, AuthorizationStatus::Valid,
                ]))
        ).set(authorizations::dsl::status.eq(AuthorizationStatus::Deactivated))
            .execute(&mut conn).await?;
        if updated == 0 {
            let exists = diesel::select(diesel::dsl::exists(authorizations::table.find(id)))
                .get_result::<bool>(&mut conn).await?;
            return Err(if exists {
                crate::Error::conflict(format!("authorization {} cannot be deactivated", id))
            } else {
                crate::Error::not_found(format!("authorization {}", id))
            });
        }
        Ok(())
    }

    /// Per name, the valid unexpired authorization of the account that
    /// stays valid the longest.
    pub async fn get_valid_authorizations(
        &self, names: &[String], registration_id: i64, now: DateTime<Utc>,
    ) -> crate::Result<HashMap<String, Authorization>> {
        let mut conn = self.get_db_conn().await?;
        let rows: Vec<crate::models::Authorization> = authorizations::table
            .filter(authorizations::dsl::registration_id.eq(registration_id))
            .filter(authorizations::dsl::status.eq(AuthorizationStatus::Valid))
            .filter(authorizations::dsl::expires.gt(now))
            .filter(authorizations::dsl::identifier.eq_any(names.to_vec()))
            .order((authorizations::dsl::expires.desc(), authorizations::dsl::id.desc()))
            .get_results(&mut conn).await?;

        let authzs = load_authorizations(&mut conn, rows, now).await?;
        Ok(first_per_identifier(authzs))
    }

    /// The account's pending authorization for `identifier` that expires
    /// soonest while still outliving `valid_until`.
    pub async fn get_pending_authorization(
        &self, registration_id: i64, identifier: &str, valid_until: DateTime<Utc>,
    ) -> crate::Result<Authorization> {
        let now = self.now();
        let mut conn = self.get_db_conn().await?;
        let row: crate::models::Authorization = match authorizations::table
            .filter(authorizations::dsl::registration_id.eq(registration_id))
            .filter(authorizations::dsl::identifier.eq(identifier))
            .filter(authorizations::dsl::status.eq(AuthorizationStatus::Pending))
            .filter(authorizations::dsl::expires.gt(valid_until))
            .order((authorizations::dsl::expires.asc(), authorizations::dsl::id.asc()))
            .first(&mut conn).await.optional()? {
            Some(a) => a,
            None => return Err(crate::Error::not_found(format!("pending authorization for {}", identifier))),
        };
        let mut authzs = load_authorizations(&mut conn, vec![row], now).await?;
        authzs.pop().ok_or_else(|| crate::Error::not_found(format!("pending authorization for {}", identifier)))
    }

    /// Valid, unexpired authorizations linked to the order, keyed by name.
    /// Empty when the order does not exist or belongs to another account.
    pub async fn get_valid_order_authorizations(
        &self, order_id: i64, registration_id: i64,
    ) -> crate::Result<HashMap<String, Authorization>> {
        let now = self.now();
        let mut conn = self.get_db_conn().await?;
        let owned = diesel::select(diesel::dsl::exists(
            orders::table
                .filter(orders::dsl::id.eq(order_id))
                .filter(orders::dsl::registration_id.eq(registration_id))
        )).get_result::<bool>(&mut conn).await?;
        if !owned {
            return Ok(HashMap::new());
        }

        let rows: Vec<crate::models::Authorization> = authorizations::table
            .filter(authorizations::dsl::id.eq_any(
                order_to_authz::table
                    .filter(order_to_authz::dsl::order_id.eq(order_id))
                    .select(order_to_authz::dsl::authz_id)
            ))
            .filter(authorizations::dsl::status.eq(AuthorizationStatus::Valid))
            .filter(authorizations::dsl::expires.gt(now))
            .order(authorizations::dsl::id.asc())
            .get_results(&mut conn).await?;

        let authzs = load_authorizations(&mut conn, rows, now).await?;
        Ok(first_per_identifier(authzs))
    }
}
