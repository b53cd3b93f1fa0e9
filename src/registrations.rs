use chrono::prelude::*;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use std::net::IpAddr;
use crate::models::RegistrationStatus;
use crate::schema::registrations;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRegistrationRequest {
    pub key: serde_json::Value,
    pub contact: Vec<String>,
    pub agreement: String,
    pub initial_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub id: i64,
    pub key: serde_json::Value,
    pub contact: Vec<String>,
    pub agreement: String,
    pub initial_ip: Option<IpAddr>,
    pub created_at: DateTime<Utc>,
    pub status: RegistrationStatus,
}

impl From<crate::models::Registration> for Registration {
    fn from(r: crate::models::Registration) -> Self {
        Registration {
            id: r.id,
            key: r.jwk,
            contact: r.contact,
            agreement: r.agreement,
            initial_ip: crate::rate_limits::ip_from_bytes(&r.initial_ip),
            created_at: r.created_at,
            status: r.status,
        }
    }
}

/// Rebuilds a JSON value with the members of every object in sorted order.
fn canonical_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(members) => {
            let mut members = members.iter().collect::<Vec<_>>();
            members.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::Value::Object(members.into_iter()
                .map(|(k, v)| (k.clone(), canonical_json(v)))
                .collect())
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonical_json).collect()),
        v => v.clone(),
    }
}

/// Hex SHA-256 of the key's canonical JSON form, with object members sorted
/// at every level, so member order in the submitted key does not matter.
pub fn key_fingerprint(key: &serde_json::Value) -> crate::Result<String> {
    let canonical = serde_json::to_string(&canonical_json(key))
        .map_err(|e| crate::Error::invalid(format!("unserializable key: {}", e)))?;
    Ok(hex::encode(openssl::sha::sha256(canonical.as_bytes())))
}

impl crate::StorageAuthority {
    pub async fn new_registration(&self, req: &NewRegistrationRequest) -> crate::Result<Registration> {
        if !req.key.is_object() {
            return Err(crate::Error::invalid("registration key must be a JSON object"));
        }
        let fingerprint = key_fingerprint(&req.key)?;

        let mut conn = self.get_db_conn().await?;
        let reg: crate::models::Registration = diesel::insert_into(registrations::table)
            .values(&crate::models::NewRegistration {
                jwk: &req.key,
                jwk_sha256: &fingerprint,
                contact: &req.contact,
                agreement: &req.agreement,
                initial_ip: crate::rate_limits::ip_to_bytes(req.initial_ip),
                created_at: self.now(),
                status: RegistrationStatus::Valid,
            })
            .get_result(&mut conn).await?;

        info!("Created registration {} from {}", reg.id, req.initial_ip);
        Ok(reg.into())
    }

    pub async fn get_registration(&self, id: i64) -> crate::Result<Registration> {
        let mut conn = self.get_db_conn().await?;
        let reg: crate::models::Registration = crate::errors::handle_db_result(
            registrations::table.find(id).get_result(&mut conn).await,
            &format!("registration {}", id),
        )?;
        Ok(reg.into())
    }

    pub async fn get_registration_by_key(&self, key: &serde_json::Value) -> crate::Result<Registration> {
        let fingerprint = key_fingerprint(key)?;
        let mut conn = self.get_db_conn().await?;
        let reg: crate::models::Registration = crate::errors::handle_db_result(
            registrations::table
                .filter(registrations::dsl::jwk_sha256.eq(&fingerprint))
                .get_result(&mut conn).await,
            "registration for key",
        )?;
        Ok(reg.into())
    }

    /// Replaces contact and agreement. Key, IP and status are not touched.
    pub async fn update_registration(&self, reg: &Registration) -> crate::Result<()> {
        let mut conn = self.get_db_conn().await?;
        let updated = diesel::update(registrations::table.find(reg.id))
            .set((
                registrations::dsl::contact.eq(&reg.contact),
                registrations::dsl::agreement.eq(&reg.agreement),
            ))
            .execute(&mut conn).await?;
        if updated == 0 {
            return Err(crate::Error::not_found(format!("registration {}", reg.id)));
        }
        Ok(())
    }

    pub async fn deactivate_registration(&self, id: i64) -> crate::Result<()> {
        let mut conn = self.get_db_conn().await?;
        let updated = diesel::update(
            registrations::table
                .filter(registrations::dsl::id.eq(id))
                .filter(registrations::dsl::status.eq(RegistrationStatus::Valid))
        ).set(registrations::dsl::status.eq(RegistrationStatus::Deactivated))
            .execute(&mut conn).await?;
        if updated == 0 {
            let exists = diesel::select(diesel::dsl::exists(registrations::table.find(id)))
                .get_result::<bool>(&mut conn).await?;
            return Err(if exists {
                crate::Error::conflict(format!("registration {} is already deactivated", id))
            } else {
                crate::Error::not_found(format!("registration {}", id))
            });
        }
        info!("Deactivated registration {}", id);
        Ok(())
    }
}
