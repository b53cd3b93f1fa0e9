use diesel::prelude::*;
use chrono::prelude::*;
use diesel_async::{RunQueryDsl, AsyncConnection, AsyncPgConnection};
use crate::schema::fqdn_sets;

/// Identity of a set of names: SHA-256 over the lower-cased, sorted,
/// de-duplicated names joined by commas.
pub fn hash_names(names: &[String]) -> Vec<u8> {
    let names = crate::names::unique_lowercase_names(names);
    openssl::sha::sha256(names.join(",").as_bytes()).to_vec()
}

/// Appends one issuance event for the name set. Runs on whatever connection it
/// is given so certificate insertion can share the transaction.
pub(crate) async fn add_fqdn_set(
    conn: &mut AsyncPgConnection, names: &[String], serial: &str,
    issued: DateTime<Utc>, expires: DateTime<Utc>,
) -> crate::Result<()> {
    let set_hash = hash_names(names);
    diesel::insert_into(fqdn_sets::table)
        .values(&crate::models::NewFqdnSet {
            set_hash: &set_hash,
            serial,
            issued,
            expires,
        })
        .execute(conn).await?;
    debug!("Recorded issuance of {} under name set {}", serial, hex::encode(&set_hash));
    Ok(())
}

/// Advisory lock key for a name set: the leading eight bytes of its hash.
pub(crate) fn fqdn_set_lock_key(set_hash: &[u8]) -> i64 {
    let mut key = [0u8; 8];
    for (k, b) in key.iter_mut().zip(set_hash) {
        *k = *b;
    }
    i64::from_be_bytes(key)
}

/// Takes a transaction-scoped advisory lock on the name set. Only meaningful
/// inside a transaction; the lock is released on commit or rollback.
pub(crate) async fn lock_fqdn_set(conn: &mut AsyncPgConnection, names: &[String]) -> crate::Result<()> {
    let key = fqdn_set_lock_key(&hash_names(names));
    diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
        .bind::<diesel::sql_types::BigInt, _>(key)
        .execute(conn).await?;
    Ok(())
}

pub(crate) async fn fqdn_set_exists(conn: &mut AsyncPgConnection, names: &[String]) -> crate::Result<bool> {
    let set_hash = hash_names(names);
    Ok(diesel::select(diesel::dsl::exists(
        fqdn_sets::table.filter(fqdn_sets::dsl::set_hash.eq(set_hash))
    )).get_result::<bool>(conn).await?)
}

/// Counts the hashes whose first-ever issuance falls at or after `earliest`.
/// Later issuances under an already seen hash are renewals and never count.
fn count_first_issuances(firsts: &[(Vec<u8>, Option<DateTime<Utc>>)], earliest: DateTime<Utc>) -> i64 {
    firsts.iter()
        .filter(|(_, first)| matches!(first, Some(first) if *first >= earliest))
        .count() as i64
}

impl crate::StorageAuthority {
    /// Records an issuance of `serial` for the name set in its own transaction.
    pub async fn add_fqdn_set(
        &self, names: &[String], serial: &str, issued: DateTime<Utc>, expires: DateTime<Utc>,
    ) -> crate::Result<()> {
        let names = names.to_vec();
        let serial = serial.to_string();
        let mut conn = self.get_db_conn().await?;
        conn.transaction(|conn| Box::pin(async move {
            add_fqdn_set(conn, &names, &serial, issued, expires).await?;
            Ok::<_, crate::Error>(())
        })).await
    }

    /// Whether any certificate, expired or not, was ever issued for exactly
    /// this set of names.
    pub async fn fqdn_set_exists(&self, names: &[String]) -> crate::Result<bool> {
        let mut conn = self.get_db_conn().await?;
        fqdn_set_exists(&mut conn, names).await
    }

    /// Number of issuances for exactly this name set in `(now - window, now]`.
    pub async fn count_fqdn_sets(
        &self, window: chrono::Duration, names: &[String], now: DateTime<Utc>,
    ) -> crate::Result<i64> {
        let set_hash = hash_names(names);
        let mut conn = self.get_db_conn().await?;
        let count = fqdn_sets::table
            .filter(fqdn_sets::dsl::set_hash.eq(set_hash))
            .filter(fqdn_sets::dsl::issued.gt(now - window))
            .filter(fqdn_sets::dsl::issued.le(now))
            .count()
            .get_result::<i64>(&mut conn).await?;
        Ok(count)
    }

    /// Counts name sets among `hashes` that were issued for the first time at
    /// or after `earliest`. An empty hash list is a caller bug and is refused
    /// rather than answered with zero.
    pub async fn count_new_issuances(
        &self, hashes: &[Vec<u8>], earliest: DateTime<Utc>,
    ) -> crate::Result<i64> {
        if hashes.is_empty() {
            return Err(crate::Error::invalid("no FQDN set hashes given to count new issuances for"));
        }

        let mut conn = self.get_db_conn().await?;
        let firsts = fqdn_sets::table
            .filter(fqdn_sets::dsl::set_hash.eq_any(hashes.to_vec()))
            .group_by(fqdn_sets::dsl::set_hash)
            .select((fqdn_sets::dsl::set_hash, diesel::dsl::min(fqdn_sets::dsl::issued)))
            .load::<(Vec<u8>, Option<DateTime<Utc>>)>(&mut conn).await?;

        let count = count_first_issuances(&firsts, earliest);
        debug!("{} of {} FQDN set(s) newly issued since {}", count, hashes.len(), earliest);
        Ok(count)
    }

    /// Set hashes recorded for the given serials, one per matching row.
    pub async fn get_fqdn_sets_by_serials(&self, serials: &[String]) -> crate::Result<Vec<Vec<u8>>> {
        if serials.is_empty() {
            return Err(crate::Error::invalid("no serials given to look up FQDN sets for"));
        }

        let mut conn = self.get_db_conn().await?;
        Ok(fqdn_sets::table
            .filter(fqdn_sets::dsl::serial.eq_any(serials.to_vec()))
            .select(fqdn_sets::dsl::set_hash)
            .load::<Vec<u8>>(&mut conn).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn hash_is_order_and_case_independent() {
        let a = hash_names(&names(&["a.com", "B.com"]));
        let b = hash_names(&names(&["b.COM", "A.com"]));
        let c = hash_names(&names(&["a.com", "b.com", "A.COM"]));
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, hash_names(&names(&["a.com"])));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn hash_matches_known_vectors() {
        assert_eq!(
            hex::encode(hash_names(&names(&["a.example.com", "B.example.com"]))),
            "92c7f247bd1eea8d527fb05919e9be817888e6f755f01cc963155f8e52ae95c1"
        );
        assert_eq!(
            hex::encode(hash_names(&names(&["example.org"]))),
            "bfabc37432958b063360d3ad6461c9c4735ae7f8edd46592a5e0f01452b2e4b5"
        );
    }

    #[test]
    fn lock_key_follows_the_set_hash() {
        let a = fqdn_set_lock_key(&hash_names(&names(&["a.com", "B.com"])));
        assert_eq!(a, fqdn_set_lock_key(&hash_names(&names(&["b.com", "a.com"]))));
        assert_ne!(a, fqdn_set_lock_key(&hash_names(&names(&["a.com"]))));
        assert_eq!(
            fqdn_set_lock_key(&hash_names(&names(&["a.example.com", "B.example.com"]))),
            i64::from_be_bytes([0x92, 0xc7, 0xf2, 0x47, 0xbd, 0x1e, 0xea, 0x8d]),
        );
        assert_eq!(fqdn_set_lock_key(&[0x01]), 0x0100_0000_0000_0000);
    }

    #[test]
    fn only_first_issuances_inside_cutoff_count() {
        let t0 = Utc.with_ymd_and_hms(2015, 3, 4, 5, 0, 0).unwrap();
        let firsts = vec![
            (vec![1], Some(t0)),
            (vec![2], Some(t0 - chrono::Duration::hours(5))),
            (vec![3], None),
        ];
        assert_eq!(count_first_issuances(&firsts, t0 - chrono::Duration::hours(1)), 1);
        assert_eq!(count_first_issuances(&firsts, t0 - chrono::Duration::hours(6)), 2);
        assert_eq!(count_first_issuances(&firsts, t0 + chrono::Duration::seconds(1)), 0);
    }
}
