//! Shared setup for tests that need a PostgreSQL database.
//!
//! Point `SA_TEST_DATABASE_URL` at a throwaway database to run them; without
//! it every database test returns early. Tests take a process-wide lock and
//! start from empty tables, so they never see each other's rows.

#![allow(dead_code)]

use chrono::prelude::*;
use std::sync::{Arc, OnceLock};
use storage_authority::authz::{FinalizeAuthorization, PendingAuthorization, PendingChallenge};
use storage_authority::clock::FakeClock;
use storage_authority::models::{AuthorizationStatus, ChallengeType};
use storage_authority::{SaOptions, StorageAuthority};

static DB_LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

pub struct Harness {
    pub sa: StorageAuthority,
    pub clock: Arc<FakeClock>,
    url: String,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl Harness {
    pub fn now(&self) -> DateTime<Utc> {
        use storage_authority::clock::Clock;
        self.clock.now()
    }

    /// Deletes an authorization behind the storage authority's back, the way
    /// a cleanup job purges expired rows.
    pub fn purge_authorization(&self, id: i64) {
        use diesel::{Connection, RunQueryDsl};
        let mut conn = diesel::pg::PgConnection::establish(&self.url).expect("connect failed");
        diesel::sql_query("DELETE FROM authorizations WHERE id = $1")
            .bind::<diesel::sql_types::BigInt, _>(id)
            .execute(&mut conn).expect("purge failed");
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 3, 4, 5, 0, 0).unwrap()
}

pub async fn setup() -> Option<Harness> {
    setup_with(SaOptions::default()).await
}

pub async fn setup_with(options: SaOptions) -> Option<Harness> {
    let url = match std::env::var("SA_TEST_DATABASE_URL") {
        Ok(u) => u,
        Err(_) => {
            eprintln!("SA_TEST_DATABASE_URL not set, skipping database test");
            return None;
        }
    };
    let guard = DB_LOCK.get_or_init(|| tokio::sync::Mutex::new(())).lock().await;

    storage_authority::run_migrations(&url).expect("migrations failed");
    {
        use diesel::{Connection, RunQueryDsl};
        let mut conn = diesel::pg::PgConnection::establish(&url).expect("connect failed");
        diesel::sql_query(
            "TRUNCATE registrations, authorizations, challenges, orders, order_to_authz, \
             requested_names, order_fqdn_sets, certificates, certificate_status, fqdn_sets, \
             issued_names RESTART IDENTITY CASCADE"
        ).execute(&mut conn).expect("truncate failed");
    }

    let clock = Arc::new(FakeClock::new(start_time()));
    let sa = StorageAuthority::new(storage_authority::build_pool(&url, 10), options)
        .expect("bad options")
        .with_clock(clock.clone());

    Some(Harness {
        sa,
        clock,
        url,
        _guard: guard,
    })
}

pub fn names(n: &[&str]) -> Vec<String> {
    n.iter().map(|n| n.to_string()).collect()
}

pub fn serial(n: u32) -> String {
    format!("{:036x}", n)
}

/// Self-signed certificate with the given serial, DNS names and validity.
pub fn make_cert(serial: u32, names: &[&str], not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Vec<u8> {
    make_cert_with_serial(openssl::bn::BigNum::from_u32(serial).unwrap(), names, not_before, not_after)
}

pub fn make_cert_with_serial(
    serial: openssl::bn::BigNum, names: &[&str], not_before: DateTime<Utc>, not_after: DateTime<Utc>,
) -> Vec<u8> {
    let group = openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
    let key = openssl::pkey::PKey::from_ec_key(openssl::ec::EcKey::generate(&group).unwrap()).unwrap();

    let mut name = openssl::x509::X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, names[0]).unwrap();
    let name = name.build();

    let mut builder = openssl::x509::X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(serial.to_asn1_integer().unwrap().as_ref()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(openssl::asn1::Asn1Time::from_unix(not_before.timestamp()).unwrap().as_ref()).unwrap();
    builder.set_not_after(openssl::asn1::Asn1Time::from_unix(not_after.timestamp()).unwrap().as_ref()).unwrap();
    let mut san = openssl::x509::extension::SubjectAlternativeName::new();
    for n in names {
        san.dns(n);
    }
    let san = san.build(&builder.x509v3_context(None, None)).unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

pub fn good_jwk(n: &str) -> serde_json::Value {
    serde_json::json!({
        "kty": "RSA",
        "n": n,
        "e": "AQAB",
    })
}

pub async fn create_registration(h: &Harness, key: &str, ip: &str) -> i64 {
    h.sa.new_registration(&storage_authority::registrations::NewRegistrationRequest {
        key: good_jwk(key),
        contact: vec!["mailto:foo@example.com".to_string()],
        agreement: "yes".to_string(),
        initial_ip: ip.parse().unwrap(),
    }).await.expect("registration failed").id
}

pub fn pending_authz(registration_id: i64, name: &str, expires: DateTime<Utc>) -> PendingAuthorization {
    PendingAuthorization {
        identifier: name.to_string(),
        registration_id,
        expires,
        challenges: vec![
            PendingChallenge {
                challenge_type: ChallengeType::Http01,
                token: "YXNkAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
            },
            PendingChallenge {
                challenge_type: ChallengeType::Dns01,
                token: "YXNkAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
            },
        ],
    }
}

pub async fn create_pending(h: &Harness, registration_id: i64, name: &str, expires: DateTime<Utc>) -> i64 {
    h.sa.create_pending_authorization(&pending_authz(registration_id, name, expires))
        .await.expect("creating pending authorization failed")
}

pub async fn create_finalized(
    h: &Harness, registration_id: i64, name: &str, expires: DateTime<Utc>, status: AuthorizationStatus,
) -> i64 {
    let id = create_pending(h, registration_id, name, expires).await;
    h.sa.finalize_authorization(&FinalizeAuthorization {
        id,
        status,
        expires,
        attempted: ChallengeType::Http01,
        validation_records: vec![],
        validation_error: None,
    }).await.expect("finalizing authorization failed");
    id
}
