mod common;

use chrono::Duration;
use common::*;
use storage_authority::certificates::OcspCertStatus;
use storage_authority::models::OcspStatus;

#[tokio::test]
async fn add_and_get_certificate() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();

    let der = make_cert(0x1d, &["www.example.com", "example.com"], now, now + Duration::days(90));
    let digest = h.sa.add_certificate(&der, reg, None, None).await.unwrap();
    assert!(!digest.contains('='));

    let cert = h.sa.get_certificate(&serial(0x1d)).await.unwrap();
    assert_eq!(cert.der, der);
    assert_eq!(cert.digest, digest);
    assert_eq!(cert.registration_id, reg);
    assert_eq!(cert.issued, now);
    assert_eq!(cert.expires, now + Duration::days(90));

    let status = h.sa.get_certificate_status(&serial(0x1d)).await.unwrap();
    assert_eq!(status.status, OcspStatus::Good);
    assert_eq!(status.ocsp_last_updated, None);
    assert_eq!(status.not_after, now + Duration::days(90));

    // Explicit issued time and an OCSP response.
    let issued = now - Duration::hours(1);
    let der = make_cert(0x1e, &["example.org"], now, now + Duration::days(90));
    h.sa.add_certificate(&der, reg, Some(vec![1, 2, 3]), Some(issued)).await.unwrap();
    assert_eq!(h.sa.get_certificate(&serial(0x1e)).await.unwrap().issued, issued);
    let status = h.sa.get_certificate_status(&serial(0x1e)).await.unwrap();
    assert_eq!(status.ocsp_last_updated, Some(now));
    assert_eq!(status.ocsp_response, Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn duplicate_certificate_conflicts() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();

    let der = make_cert(7, &["example.com"], now, now + Duration::days(90));
    h.sa.add_certificate(&der, reg, None, None).await.unwrap();
    let err = h.sa.add_certificate(&der, reg, None, None).await.unwrap_err();
    assert!(err.is_conflict(), "{}", err);

    // The failed insert must not have left name-set or ledger rows behind.
    assert_eq!(h.sa.count_fqdn_sets(Duration::days(1), &names(&["example.com"]), now).await.unwrap(), 1);
}

#[tokio::test]
async fn twenty_byte_serial_is_refused_before_storing() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();

    let wide = openssl::bn::BigNum::from_hex_str("7f0102030405060708090a0b0c0d0e0f10111213").unwrap();
    let der = make_cert_with_serial(wide, &["example.com"], now, now + Duration::days(90));
    let err = h.sa.add_certificate(&der, reg, None, None).await.unwrap_err();
    assert!(err.is_invalid_request(), "{}", err);

    assert!(!h.sa.fqdn_set_exists(&names(&["example.com"])).await.unwrap());
    let counts = h.sa.count_certificates_by_names(&names(&["example.com"]), now - Duration::days(1), now).await.unwrap();
    assert_eq!(counts[0].count, 0);
}

#[tokio::test]
async fn unknown_and_malformed_serials() {
    let h = match setup().await { Some(h) => h, None => return };
    assert!(h.sa.get_certificate(&serial(99)).await.unwrap_err().is_not_found());
    assert!(h.sa.get_certificate_status(&serial(99)).await.unwrap_err().is_not_found());
    assert!(h.sa.get_certificate("63").await.unwrap_err().is_invalid_request());
    assert!(h.sa.get_certificate_status("NOT-HEX").await.unwrap_err().is_invalid_request());
}

#[tokio::test]
async fn count_certificates_window_boundaries() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();
    let yesterday = now - Duration::days(1);
    let two_days_ago = now - Duration::days(2);
    let tomorrow = now + Duration::days(1);
    let example = names(&["example.com"]);

    let counts = h.sa.count_certificates_by_names(&example, yesterday, now).await.unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].name, "example.com");
    assert_eq!(counts[0].count, 0);

    let der = make_cert(0x1d, &["www.example.com", "example.com"], now, now + Duration::days(90));
    h.sa.add_certificate(&der, reg, None, None).await.unwrap();

    let counts = h.sa.count_certificates_by_names(&example, yesterday, now).await.unwrap();
    assert_eq!(counts[0].count, 1);
    let counts = h.sa.count_certificates_by_names(&example, now, tomorrow).await.unwrap();
    assert_eq!(counts[0].count, 0);
    let counts = h.sa.count_certificates_by_names(&example, two_days_ago, yesterday).await.unwrap();
    assert_eq!(counts[0].count, 0);
}

#[tokio::test]
async fn count_certificates_for_several_names() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();

    h.sa.add_certificate(&make_cert(1, &["example.com"], now, now + Duration::days(90)), reg, None, None).await.unwrap();
    h.sa.add_certificate(&make_cert(2, &["mail.example.com"], now, now + Duration::days(90)), reg, None, None).await.unwrap();
    h.sa.add_certificate(&make_cert(3, &["example.net"], now, now + Duration::days(90)), reg, None, None).await.unwrap();
    // Shares a suffix but is not a subdomain.
    h.sa.add_certificate(&make_cert(4, &["notexample.com"], now, now + Duration::days(90)), reg, None, None).await.unwrap();

    let mut counts = h.sa.count_certificates_by_names(
        &names(&["example.com", "example.net", "example.org"]), now - Duration::days(1), now,
    ).await.unwrap();
    counts.sort_by(|a, b| a.name.cmp(&b.name));
    let counts = counts.into_iter().map(|c| (c.name, c.count)).collect::<Vec<_>>();
    assert_eq!(counts, vec![
        ("example.com".to_string(), 2),
        ("example.net".to_string(), 1),
        ("example.org".to_string(), 0),
    ]);
}

#[tokio::test]
async fn renewals_are_flagged_and_not_counted() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();
    let expires = now + Duration::days(90);

    // A, then B for the exact same set (in another order and case), then C
    // for a disjoint set under the same base domain.
    h.sa.add_certificate(&make_cert(0xa, &["example.com", "a.example.com"], now, expires), reg, None, None).await.unwrap();
    assert!(h.sa.fqdn_set_exists(&names(&["A.example.com", "example.com"])).await.unwrap());
    h.sa.add_certificate(&make_cert(0xb, &["A.EXAMPLE.COM", "example.com"], now, expires), reg, None, None).await.unwrap();
    assert!(!h.sa.fqdn_set_exists(&names(&["www.example.com"])).await.unwrap());
    h.sa.add_certificate(&make_cert(0xc, &["www.example.com"], now, expires), reg, None, None).await.unwrap();

    let counts = h.sa.count_certificates_by_names(&names(&["example.com"]), now - Duration::days(1), now).await.unwrap();
    assert_eq!(counts[0].count, 2);

    assert_eq!(h.sa.count_fqdn_sets(Duration::days(1), &names(&["example.com", "a.example.com"]), now).await.unwrap(), 2);
    assert_eq!(h.sa.count_fqdn_sets(Duration::days(1), &names(&["www.example.com"]), now).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_issuances_for_one_set_yield_one_new_issuance() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();
    let expires = now + Duration::days(90);

    for round in 0..5u32 {
        let set = format!("round{}.example.com", round);
        let first = make_cert(0x100 + round * 2, &[set.as_str()], now, expires);
        let second = make_cert(0x101 + round * 2, &[set.as_str()], now, expires);
        let (a, b) = tokio::join!(
            h.sa.add_certificate(&first, reg, None, None),
            h.sa.add_certificate(&second, reg, None, None),
        );
        a.unwrap();
        b.unwrap();

        let counts = h.sa.count_certificates_by_names(&names(&[set.as_str()]), now - Duration::days(1), now).await.unwrap();
        assert_eq!(counts[0].count, 1, "round {}", round);
        assert_eq!(h.sa.count_fqdn_sets(Duration::days(1), &names(&[set.as_str()]), now).await.unwrap(), 2);
    }
}

#[tokio::test]
async fn previous_certificate_exists_per_account() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg_a = create_registration(&h, "key-a", "42.42.42.42").await;
    let reg_b = create_registration(&h, "key-b", "42.42.42.43").await;
    let now = h.now();

    h.sa.add_certificate(&make_cert(1, &["www.example.com"], now, now + Duration::days(90)), reg_a, None, None).await.unwrap();

    assert!(h.sa.previous_certificate_exists("www.example.com", reg_a).await.unwrap());
    assert!(!h.sa.previous_certificate_exists("www.example.com", reg_b).await.unwrap());
    assert!(!h.sa.previous_certificate_exists("example.com", reg_a).await.unwrap());
}

#[tokio::test]
async fn revoke_once() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();
    let der = make_cert(0x1d, &["example.com"], now, now + Duration::days(90));
    h.sa.add_certificate(&der, reg, None, None).await.unwrap();

    let date = now + Duration::hours(1);
    h.sa.revoke_certificate(&serial(0x1d), date, 1, vec![4, 5, 6]).await.unwrap();

    let status = h.sa.get_certificate_status(&serial(0x1d)).await.unwrap();
    assert_eq!(status.status, OcspStatus::Revoked);
    assert_eq!(status.revoked_reason, Some(1));
    assert_eq!(status.revoked_date, Some(date));
    assert_eq!(status.ocsp_response, Some(vec![4, 5, 6]));

    let err = h.sa.revoke_certificate(&serial(0x1d), date + Duration::hours(1), 4, vec![7]).await.unwrap_err();
    assert!(err.is_conflict(), "{}", err);
    let status = h.sa.get_certificate_status(&serial(0x1d)).await.unwrap();
    assert_eq!(status.revoked_reason, Some(1));
    assert_eq!(status.revoked_date, Some(date));
    assert_eq!(status.ocsp_response, Some(vec![4, 5, 6]));

    let err = h.sa.revoke_certificate(&serial(0x2d), date, 1, vec![]).await.unwrap_err();
    assert!(err.is_not_found(), "{}", err);
}

#[tokio::test]
async fn ocsp_view() {
    let h = match setup().await { Some(h) => h, None => return };
    let reg = create_registration(&h, "key-a", "42.42.42.42").await;
    let now = h.now();
    h.sa.add_certificate(&make_cert(0x1d, &["example.com"], now, now + Duration::days(90)), reg, None, None).await.unwrap();

    let view = h.sa.ocsp_status_for(&serial(0x1d), now).await.unwrap();
    assert_eq!(view.status, OcspCertStatus::Good);
    assert_eq!(view.this_update, now);
    assert!(view.next_update > now);

    let view = h.sa.ocsp_status_for(&serial(0x2d), now).await.unwrap();
    assert_eq!(view.status, OcspCertStatus::Unknown);
    let view = h.sa.ocsp_status_for("garbage", now).await.unwrap();
    assert_eq!(view.status, OcspCertStatus::Unknown);

    h.sa.revoke_certificate(&serial(0x1d), now, 5, vec![9]).await.unwrap();
    let view = h.sa.ocsp_status_for(&serial(0x1d), now).await.unwrap();
    assert_eq!(view.status, OcspCertStatus::Revoked { reason: 5, date: Some(now) });
    assert_eq!(view.cached_response, Some(vec![9]));
}

#[tokio::test]
async fn fqdn_set_windows() {
    let h = match setup().await { Some(h) => h, None => return };
    let now = h.now();
    let set = names(&["a.example.com", "B.example.com"]);

    assert!(!h.sa.fqdn_set_exists(&set).await.unwrap());
    h.sa.add_fqdn_set(&set, &serial(1), now - Duration::hours(2), now + Duration::days(90)).await.unwrap();
    assert!(h.sa.fqdn_set_exists(&names(&["b.example.com", "A.example.com"])).await.unwrap());

    assert_eq!(h.sa.count_fqdn_sets(Duration::hours(3), &set, now).await.unwrap(), 1);
    assert_eq!(h.sa.count_fqdn_sets(Duration::hours(1), &set, now).await.unwrap(), 0);
    // Issued exactly at the lower bound is outside the window.
    assert_eq!(h.sa.count_fqdn_sets(Duration::hours(2), &set, now).await.unwrap(), 0);
}

#[tokio::test]
async fn new_issuances_skip_renewals() {
    let h = match setup().await { Some(h) => h, None => return };
    let t0 = h.now();
    let expires = t0 + Duration::days(90);
    let set_a = names(&["a.example.com"]);
    let set_b = names(&["b.example.com"]);
    let hashes = vec![
        storage_authority::fqdn_set::hash_names(&set_a),
        storage_authority::fqdn_set::hash_names(&set_b),
    ];

    let err = h.sa.count_new_issuances(&[], t0).await.unwrap_err();
    assert!(err.is_invalid_request());
    assert_eq!(h.sa.count_new_issuances(&hashes, t0 - Duration::days(1)).await.unwrap(), 0);

    h.sa.add_fqdn_set(&set_a, &serial(1), t0, expires).await.unwrap();
    h.sa.add_fqdn_set(&set_a, &serial(2), t0 + Duration::hours(1), expires).await.unwrap();
    h.sa.add_fqdn_set(&set_b, &serial(3), t0 - Duration::hours(2), expires).await.unwrap();

    assert_eq!(h.sa.count_new_issuances(&hashes, t0).await.unwrap(), 1);
    assert_eq!(h.sa.count_new_issuances(&hashes, t0 - Duration::hours(3)).await.unwrap(), 2);
    // A renewal inside the window never makes an old set new again.
    assert_eq!(h.sa.count_new_issuances(&hashes, t0 + Duration::minutes(30)).await.unwrap(), 0);

    let by_serial = h.sa.get_fqdn_sets_by_serials(&[serial(1), serial(3), serial(99)]).await.unwrap();
    assert_eq!(by_serial.len(), 2);
    assert!(by_serial.contains(&hashes[0]));
    assert!(by_serial.contains(&hashes[1]));
    assert!(h.sa.get_fqdn_sets_by_serials(&[]).await.unwrap_err().is_invalid_request());
}
