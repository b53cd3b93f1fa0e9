use super::schema::*;
use diesel::prelude::*;
use chrono::prelude::*;

#[derive(DbEnum, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Valid,
    Deactivated,
}

#[derive(DbEnum, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
}

#[derive(DbEnum, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid,
}

#[derive(DbEnum, Debug, PartialEq, Eq, Hash, Copy, Clone, Serialize, Deserialize)]
pub enum ChallengeType {
    #[db_rename = "http-01"]
    #[serde(rename = "http-01")]
    Http01,
    #[db_rename = "dns-01"]
    #[serde(rename = "dns-01")]
    Dns01,
    #[db_rename = "tls-alpn-01"]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

#[derive(DbEnum, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcspStatus {
    Good,
    Revoked,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = registrations)]
pub struct Registration {
    pub id: i64,
    pub jwk: serde_json::Value,
    pub jwk_sha256: String,
    pub contact: Vec<String>,
    pub agreement: String,
    pub initial_ip: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub status: RegistrationStatus,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = registrations)]
pub struct NewRegistration<'a> {
    pub jwk: &'a serde_json::Value,
    pub jwk_sha256: &'a str,
    pub contact: &'a [String],
    pub agreement: &'a str,
    pub initial_ip: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub status: RegistrationStatus,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = authorizations)]
pub struct Authorization {
    pub id: i64,
    pub identifier: String,
    pub registration_id: i64,
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
    pub attempted: Option<ChallengeType>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = authorizations)]
pub struct NewAuthorization<'a> {
    pub identifier: &'a str,
    pub registration_id: i64,
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = challenges)]
pub struct Challenge {
    pub id: i64,
    pub authorization_id: i64,
    pub challenge_type: ChallengeType,
    pub token: String,
    pub status: ChallengeStatus,
    pub validated: Option<DateTime<Utc>>,
    pub validation_records: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = challenges)]
pub struct NewChallenge<'a> {
    pub authorization_id: i64,
    pub challenge_type: ChallengeType,
    pub token: &'a str,
    pub status: ChallengeStatus,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = orders)]
pub struct Order {
    pub id: i64,
    pub registration_id: i64,
    pub expires: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub began_processing: bool,
    pub certificate_serial: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = orders)]
pub struct NewOrder {
    pub registration_id: i64,
    pub expires: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub began_processing: bool,
}

#[derive(Insertable, Queryable, Debug, Clone)]
#[diesel(table_name = order_to_authz)]
pub struct OrderToAuthz {
    pub order_id: i64,
    pub authz_id: i64,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = requested_names)]
pub struct NewRequestedName {
    pub order_id: i64,
    pub reversed_name: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = order_fqdn_sets)]
pub struct NewOrderFqdnSet<'a> {
    pub set_hash: &'a [u8],
    pub order_id: i64,
    pub registration_id: i64,
    pub expires: DateTime<Utc>,
}

#[derive(Insertable, Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = certificates, primary_key(serial))]
pub struct Certificate {
    pub serial: String,
    pub registration_id: i64,
    pub digest: String,
    pub der: Vec<u8>,
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

#[derive(Insertable, Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = certificate_status, primary_key(serial))]
pub struct CertificateStatus {
    pub serial: String,
    pub status: OcspStatus,
    pub ocsp_last_updated: Option<DateTime<Utc>>,
    pub ocsp_response: Option<Vec<u8>>,
    pub revoked_date: Option<DateTime<Utc>>,
    pub revoked_reason: Option<i64>,
    pub not_after: DateTime<Utc>,
}

#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = fqdn_sets)]
pub struct FqdnSet {
    pub id: i64,
    pub set_hash: Vec<u8>,
    pub serial: String,
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = fqdn_sets)]
pub struct NewFqdnSet<'a> {
    pub set_hash: &'a [u8],
    pub serial: &'a str,
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = issued_names)]
pub struct NewIssuedName {
    pub reversed_name: String,
    pub not_before: DateTime<Utc>,
    pub serial: String,
    pub renewal: bool,
}

impl Authorization {
    /// Status as seen by callers: a pending or valid authorization past its
    /// expiry reads as expired without any write taking place.
    pub fn status_at(&self, now: DateTime<Utc>) -> crate::authz::AuthorizationState {
        match self.status {
            AuthorizationStatus::Invalid => crate::authz::AuthorizationState::Invalid,
            AuthorizationStatus::Deactivated => crate::authz::AuthorizationState::Deactivated,
            _ if self.expires <= now => crate::authz::AuthorizationState::Expired,
            AuthorizationStatus::Valid => crate::authz::AuthorizationState::Valid,
            AuthorizationStatus::Pending => crate::authz::AuthorizationState::Pending,
        }
    }
}
