use base64::prelude::*;
use chrono::prelude::*;
use diesel::prelude::*;
use diesel_async::{RunQueryDsl, AsyncConnection};
use crate::models::OcspStatus;
use crate::schema::{certificate_status, certificates, issued_names};

/// What gets pulled out of a DER certificate before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    pub serial: String,
    pub digest: String,
    pub names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcspCertStatus {
    Good,
    Revoked {
        reason: i64,
        date: Option<DateTime<Utc>>,
    },
    /// The serial was never issued.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspView {
    pub status: OcspCertStatus,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub cached_response: Option<Vec<u8>>,
}

/// Serials are the certificate serial number in lowercase hex, zero padded
/// to 36 characters. 32 character serials are accepted for older rows.
pub fn validate_serial(serial: &str) -> crate::Result<()> {
    if (serial.len() == 32 || serial.len() == 36) &&
        serial.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Ok(())
    } else {
        Err(crate::Error::invalid(format!("invalid serial {:?}", serial)))
    }
}

pub fn serial_to_string(serial: &openssl::asn1::Asn1IntegerRef) -> crate::Result<String> {
    let hex = serial.to_bn()?.to_hex_str()?.to_lowercase();
    if hex.starts_with('-') {
        return Err(crate::Error::invalid("negative certificate serial"));
    }
    Ok(format!("{:0>36}", hex))
}

fn asn1_time_to_chrono(t: &openssl::asn1::Asn1TimeRef) -> crate::Result<DateTime<Utc>> {
    let epoch = openssl::asn1::Asn1Time::from_unix(0)?;
    let diff = epoch.diff(t)?;
    let secs = diff.days as i64 * 86400 + diff.secs as i64;
    Utc.timestamp_opt(secs, 0).single()
        .ok_or_else(|| crate::Error::invalid("certificate time out of range"))
}

pub fn parse_certificate(der: &[u8]) -> crate::Result<ParsedCertificate> {
    let cert = openssl::x509::X509::from_der(der)?;
    let names = cert.subject_alt_names()
        .map(|sans| sans.iter()
            .filter_map(|san| san.dnsname().map(|n| n.to_string()))
            .collect::<Vec<_>>())
        .unwrap_or_default();
    if names.is_empty() {
        return Err(crate::Error::invalid("certificate has no DNS names"));
    }

    // Serials wider than 18 bytes do not fit the stored form.
    let serial = serial_to_string(cert.serial_number())?;
    validate_serial(&serial)?;

    Ok(ParsedCertificate {
        serial,
        digest: BASE64_URL_SAFE_NO_PAD.encode(openssl::sha::sha256(der)),
        names: crate::names::unique_lowercase_names(&names),
        not_before: asn1_time_to_chrono(cert.not_before())?,
        not_after: asn1_time_to_chrono(cert.not_after())?,
    })
}

/// One ledger row per name of the certificate, all sharing its renewal flag.
pub(crate) fn issued_name_rows(
    names: &[String], serial: &str, not_before: DateTime<Utc>, renewal: bool,
) -> Vec<crate::models::NewIssuedName> {
    names.iter().map(|name| crate::models::NewIssuedName {
        reversed_name: crate::names::reverse_name(&name.to_lowercase()),
        not_before,
        serial: serial.to_string(),
        renewal,
    }).collect()
}

impl crate::StorageAuthority {
    /// Stores a newly issued certificate and returns its digest. The
    /// renewal check, the certificate and status rows, the issued-name rows
    /// and the name-set row all commit together or not at all.
    pub async fn add_certificate(
        &self, der: &[u8], registration_id: i64, ocsp_response: Option<Vec<u8>>,
        issued: Option<DateTime<Utc>>,
    ) -> crate::Result<String> {
        let parsed = parse_certificate(der)?;
        let now = self.now();
        let issued = issued.unwrap_or(now);
        let der = der.to_vec();

        let mut conn = self.get_db_conn().await?;
        let digest = conn.transaction(|conn| Box::pin(async move {
            // Held until commit, so concurrent issuances for the same set see
            // each other and only the first is a new issuance.
            crate::fqdn_set::lock_fqdn_set(conn, &parsed.names).await?;
            let renewal = crate::fqdn_set::fqdn_set_exists(conn, &parsed.names).await?;

            diesel::insert_into(certificates::table)
                .values(&crate::models::Certificate {
                    serial: parsed.serial.clone(),
                    registration_id,
                    digest: parsed.digest.clone(),
                    der,
                    issued,
                    expires: parsed.not_after,
                })
                .execute(conn).await?;

            diesel::insert_into(certificate_status::table)
                .values(&crate::models::CertificateStatus {
                    serial: parsed.serial.clone(),
                    status: OcspStatus::Good,
                    ocsp_last_updated: ocsp_response.as_ref().map(|_| now),
                    ocsp_response,
                    revoked_date: None,
                    revoked_reason: None,
                    not_after: parsed.not_after,
                })
                .execute(conn).await?;

            diesel::insert_into(issued_names::table)
                .values(&issued_name_rows(&parsed.names, &parsed.serial, parsed.not_before, renewal))
                .execute(conn).await?;

            crate::fqdn_set::add_fqdn_set(
                conn, &parsed.names, &parsed.serial, parsed.not_before, parsed.not_after,
            ).await?;

            info!(
                "Stored certificate {} for account {} covering {} name(s), renewal: {}",
                parsed.serial, registration_id, parsed.names.len(), renewal
            );
            Ok::<_, crate::Error>(parsed.digest)
        })).await?;

        Ok(digest)
    }

    pub async fn get_certificate(&self, serial: &str) -> crate::Result<crate::models::Certificate> {
        validate_serial(serial)?;
        let mut conn = self.get_db_conn().await?;
        match certificates::table.find(serial).get_result(&mut conn).await.optional()? {
            Some(c) => Ok(c),
            None => Err(crate::Error::not_found(format!("certificate {}", serial))),
        }
    }

    pub async fn get_certificate_status(&self, serial: &str) -> crate::Result<crate::models::CertificateStatus> {
        validate_serial(serial)?;
        let mut conn = self.get_db_conn().await?;
        match certificate_status::table.find(serial).get_result(&mut conn).await.optional()? {
            Some(c) => Ok(c),
            None => Err(crate::Error::not_found(format!("certificate status {}", serial))),
        }
    }

    /// Revokes a good certificate. Reason, date and OCSP response are fixed
    /// by the first revocation; later attempts are conflicts.
    pub async fn revoke_certificate(
        &self, serial: &str, date: DateTime<Utc>, reason: i64, ocsp_response: Vec<u8>,
    ) -> crate::Result<()> {
        validate_serial(serial)?;
        let now = self.now();
        let mut conn = self.get_db_conn().await?;
        let updated = diesel::update(
            certificate_status::table
                .filter(certificate_status::dsl::serial.eq(serial))
                .filter(certificate_status::dsl::status.eq(OcspStatus::Good))
        ).set((
            certificate_status::dsl::status.eq(OcspStatus::Revoked),
            certificate_status::dsl::revoked_date.eq(Some(date)),
            certificate_status::dsl::revoked_reason.eq(Some(reason)),
            certificate_status::dsl::ocsp_response.eq(Some(ocsp_response)),
            certificate_status::dsl::ocsp_last_updated.eq(Some(now)),
        )).execute(&mut conn).await?;

        if updated == 0 {
            let exists = diesel::select(diesel::dsl::exists(certificate_status::table.find(serial)))
                .get_result::<bool>(&mut conn).await?;
            return Err(if exists {
                crate::Error::conflict(format!("certificate {} is already revoked", serial))
            } else {
                crate::Error::not_found(format!("certificate {}", serial))
            });
        }
        info!("Revoked certificate {} with reason {}", serial, reason);
        Ok(())
    }

    /// Whether the account already holds a certificate naming exactly `domain`.
    pub async fn previous_certificate_exists(&self, domain: &str, registration_id: i64) -> crate::Result<bool> {
        let reversed = crate::names::reverse_name(&domain.to_lowercase());
        let mut conn = self.get_db_conn().await?;
        Ok(diesel::select(diesel::dsl::exists(
            certificates::table
                .filter(certificates::dsl::registration_id.eq(registration_id))
                .filter(certificates::dsl::serial.eq_any(
                    issued_names::table
                        .filter(issued_names::dsl::reversed_name.eq(reversed))
                        .select(issued_names::dsl::serial)
                ))
        )).get_result::<bool>(&mut conn).await?)
    }

    /// The revocation view an OCSP responder would serve for `serial`.
    pub async fn ocsp_status_for(&self, serial: &str, now: DateTime<Utc>) -> crate::Result<OcspView> {
        debug!("OCSP status request for serial {}", serial);
        if validate_serial(serial).is_err() {
            return Ok(OcspView {
                status: OcspCertStatus::Unknown,
                this_update: now,
                next_update: now + chrono::Duration::days(365),
                cached_response: None,
            });
        }

        let mut conn = self.get_db_conn().await?;
        let status: crate::models::CertificateStatus = match certificate_status::table
            .find(serial).get_result(&mut conn).await.optional()? {
            Some(s) => s,
            None => return Ok(OcspView {
                status: OcspCertStatus::Unknown,
                this_update: now,
                next_update: now + chrono::Duration::days(7),
                cached_response: None,
            })
        };

        Ok(match status.status {
            OcspStatus::Revoked => OcspView {
                status: OcspCertStatus::Revoked {
                    reason: status.revoked_reason.unwrap_or_default(),
                    date: status.revoked_date,
                },
                this_update: now,
                next_update: now + chrono::Duration::days(365),
                cached_response: status.ocsp_response,
            },
            OcspStatus::Good => OcspView {
                status: OcspCertStatus::Good,
                this_update: now,
                next_update: now + chrono::Duration::days(3),
                cached_response: status.ocsp_response,
            },
        })
    }
}
