use diesel::prelude::*;
use chrono::prelude::*;
use diesel_async::RunQueryDsl;
use futures::StreamExt;
use std::net::IpAddr;
use crate::schema::{authorizations, issued_names, orders, registrations};

/// Number of certificates issued for one name in a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCount {
    pub name: String,
    pub count: i64,
}

/// Counts certificates issued for a single name. `count_certificates_by_names`
/// runs one of these per requested name; swapping the implementation lets a
/// caller observe or control how those per-name calls interleave.
#[mobc::async_trait]
pub trait CertificateCounter: Send + Sync {
    async fn count_certificates_by_name(
        &self, domain: &str, earliest: DateTime<Utc>, latest: DateTime<Utc>,
    ) -> crate::Result<i64>;
}

/// Counts distinct non-renewal certificates whose issued names are the domain
/// or any subdomain of it, with notBefore in `(earliest, latest]`. Each call
/// takes its own pooled connection.
#[derive(Clone)]
pub struct IssuedNameCounter {
    db: crate::DBPool,
}

impl IssuedNameCounter {
    pub fn new(db: crate::DBPool) -> Self {
        IssuedNameCounter { db }
    }
}

#[mobc::async_trait]
impl CertificateCounter for IssuedNameCounter {
    async fn count_certificates_by_name(
        &self, domain: &str, earliest: DateTime<Utc>, latest: DateTime<Utc>,
    ) -> crate::Result<i64> {
        let reversed = crate::names::reverse_name(&domain.to_lowercase());
        let subdomains = crate::names::subdomain_pattern(&reversed);

        let mut conn = crate::sa::get_db_conn(&self.db).await?;
        let count = issued_names::table
            .filter(
                issued_names::dsl::reversed_name.eq(&reversed)
                    .or(issued_names::dsl::reversed_name.like(&subdomains))
            )
            .filter(issued_names::dsl::not_before.gt(earliest))
            .filter(issued_names::dsl::not_before.le(latest))
            .filter(issued_names::dsl::renewal.eq(false))
            .select(diesel::dsl::count_distinct(issued_names::dsl::serial))
            .get_result::<i64>(&mut conn).await?;
        Ok(count)
    }
}

/// Runs `counter` once per name with at most `parallelism` calls in flight,
/// returning once every name has been counted. Any failure fails the whole
/// call.
pub async fn count_certificates_by_names(
    counter: &dyn CertificateCounter, names: &[String],
    earliest: DateTime<Utc>, latest: DateTime<Utc>, parallelism: usize,
) -> crate::Result<Vec<NameCount>> {
    if parallelism < 1 {
        return Err(crate::Error::invalid("parallelism must be at least 1"));
    }

    let results: Vec<crate::Result<NameCount>> = futures::stream::iter(names)
        .map(|name| async move {
            let count = counter.count_certificates_by_name(name, earliest, latest).await?;
            Ok::<_, crate::Error>(NameCount {
                name: name.clone(),
                count,
            })
        })
        .buffer_unordered(parallelism)
        .collect()
        .await;

    let counts = results.into_iter().collect::<crate::Result<Vec<_>>>()?;
    debug!("Counted certificates for {} name(s) between {} and {}", counts.len(), earliest, latest);
    Ok(counts)
}

/// Storage form of an address: 16 bytes, IPv4 mapped into IPv6, so that
/// byte-wise ordering in the store matches address ordering.
pub(crate) fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub(crate) fn ip_from_bytes(b: &[u8]) -> Option<IpAddr> {
    let octets: [u8; 16] = b.try_into().ok()?;
    let v6 = std::net::Ipv6Addr::from(octets);
    Some(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}

/// Inclusive storage-form bounds of the block an address is rate limited as:
/// the enclosing /48 for IPv6, the address itself for IPv4.
pub(crate) fn ip_range(ip: IpAddr) -> (Vec<u8>, Vec<u8>) {
    match ip {
        IpAddr::V4(_) => {
            let b = ip_to_bytes(ip);
            (b.clone(), b)
        }
        IpAddr::V6(v6) => {
            const HOST_BITS: u32 = 128 - 48;
            let mask = u128::MAX << HOST_BITS;
            let first = u128::from(v6) & mask;
            let last = first | !mask;
            (first.to_be_bytes().to_vec(), last.to_be_bytes().to_vec())
        }
    }
}

impl crate::StorageAuthority {
    /// Certificates per name in `(earliest, latest]`, counted concurrently
    /// with the configured parallelism. Output order is not tied to input
    /// order.
    pub async fn count_certificates_by_names(
        &self, names: &[String], earliest: DateTime<Utc>, latest: DateTime<Utc>,
    ) -> crate::Result<Vec<NameCount>> {
        count_certificates_by_names(
            self.cert_counter.as_ref(), names, earliest, latest, self.options.parallelism_per_rpc,
        ).await
    }

    /// Registrations created from exactly this address in `(earliest, latest]`.
    pub async fn count_registrations_by_ip(
        &self, ip: IpAddr, earliest: DateTime<Utc>, latest: DateTime<Utc>,
    ) -> crate::Result<i64> {
        let mut conn = self.get_db_conn().await?;
        Ok(registrations::table
            .filter(registrations::dsl::initial_ip.eq(ip_to_bytes(ip)))
            .filter(registrations::dsl::created_at.gt(earliest))
            .filter(registrations::dsl::created_at.le(latest))
            .count()
            .get_result::<i64>(&mut conn).await?)
    }

    /// Registrations created from anywhere in the address's /48 (IPv6) or
    /// from the address itself (IPv4) in `(earliest, latest]`.
    pub async fn count_registrations_by_ip_range(
        &self, ip: IpAddr, earliest: DateTime<Utc>, latest: DateTime<Utc>,
    ) -> crate::Result<i64> {
        let (first, last) = ip_range(ip);
        let mut conn = self.get_db_conn().await?;
        Ok(registrations::table
            .filter(registrations::dsl::initial_ip.ge(first))
            .filter(registrations::dsl::initial_ip.le(last))
            .filter(registrations::dsl::created_at.gt(earliest))
            .filter(registrations::dsl::created_at.le(latest))
            .count()
            .get_result::<i64>(&mut conn).await?)
    }

    /// Pending authorizations held by the account that have not yet expired.
    pub async fn count_pending_authorizations(
        &self, registration_id: i64, now: DateTime<Utc>,
    ) -> crate::Result<i64> {
        let mut conn = self.get_db_conn().await?;
        Ok(authorizations::table
            .filter(authorizations::dsl::registration_id.eq(registration_id))
            .filter(authorizations::dsl::status.eq(crate::models::AuthorizationStatus::Pending))
            .filter(authorizations::dsl::expires.gt(now))
            .count()
            .get_result::<i64>(&mut conn).await?)
    }

    /// Invalid authorizations for one hostname whose expiry falls in
    /// `(earliest, latest]`.
    pub async fn count_invalid_authorizations(
        &self, registration_id: i64, hostname: &str, earliest: DateTime<Utc>, latest: DateTime<Utc>,
    ) -> crate::Result<i64> {
        let mut conn = self.get_db_conn().await?;
        Ok(authorizations::table
            .filter(authorizations::dsl::registration_id.eq(registration_id))
            .filter(authorizations::dsl::identifier.eq(hostname))
            .filter(authorizations::dsl::status.eq(crate::models::AuthorizationStatus::Invalid))
            .filter(authorizations::dsl::expires.gt(earliest))
            .filter(authorizations::dsl::expires.le(latest))
            .count()
            .get_result::<i64>(&mut conn).await?)
    }

    /// Orders created by the account in `(earliest, latest]`.
    pub async fn count_orders(
        &self, registration_id: i64, earliest: DateTime<Utc>, latest: DateTime<Utc>,
    ) -> crate::Result<i64> {
        let mut conn = self.get_db_conn().await?;
        Ok(orders::table
            .filter(orders::dsl::registration_id.eq(registration_id))
            .filter(orders::dsl::created.gt(earliest))
            .filter(orders::dsl::created.le(latest))
            .count()
            .get_result::<i64>(&mut conn).await?)
    }
}
