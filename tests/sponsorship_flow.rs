mod common;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use chrono::{Datelike, Months, Utc};
use common::{acquire_db_lock, expect_json, Part, TestApp, UserSpec};
use serde_json::json;
use uuid::Uuid;

async fn create_child(app: &TestApp, token: &str, site: Uuid, last_name: &str) -> Result<String> {
    let payload = json!({
        "site_id": site,
        "last_name": last_name,
        "first_name": "Komi",
        "birth_date": "2014-07-01",
        "sex": "M",
        "arrival_date": "2019-09-01",
    });
    let created = expect_json(
        app.post_multipart("/api/children", &[Part::Text("child", payload.to_string())], token)
            .await?,
        StatusCode::CREATED,
    )
    .await?;
    Ok(created["id"].as_str().context("child id")?.to_string())
}

#[tokio::test]
async fn payment_status_tracks_linked_entries() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let site = app.insert_site("Lomé").await?;
    let token = app.user_token("root", UserSpec::superuser()).await?;
    let child = create_child(&app, &token, site, "Adjovi").await?;

    let today = Utc::now().date_naive();
    let start = today
        .with_day(1)
        .and_then(|first| first.checked_sub_months(Months::new(2)))
        .context("start date")?;

    let sponsorship = expect_json(
        app.post_json(
            "/api/finances/sponsorships",
            &json!({
                "child_id": child,
                "sponsor_name": "Famille Dupont",
                "monthly_amount": "100",
                "start_date": start,
            }),
            Some(&token),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let sponsorship_id = sponsorship["id"].as_str().context("sponsorship id")?.to_string();
    assert_eq!(sponsorship["payment"]["months_elapsed"], 3);
    assert_eq!(sponsorship["payment"]["amount_expected"], "300.00");
    assert_eq!(sponsorship["payment"]["status"], "en_retard");

    let account = expect_json(
        app.post_json(
            "/api/finances/accounts",
            &json!({ "site_id": site, "name": "Parrainages" }),
            Some(&token),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let account_id = account["id"].as_str().context("account id")?;

    expect_json(
        app.post_json(
            "/api/finances/transactions",
            &json!({
                "account_id": account_id,
                "direction": "entree",
                "category": "parrainage",
                "amount": "250",
                "transaction_date": today,
                "sponsorship_id": sponsorship_id,
            }),
            Some(&token),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    let refreshed = expect_json(
        app.get(
            &format!("/api/finances/sponsorships/{sponsorship_id}"),
            Some(&token),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(refreshed["payment"]["status"], "partiel");
    assert_eq!(refreshed["payment"]["amount_received"], "250.00");
    assert_eq!(refreshed["payment"]["difference"], "-50.00");

    let partial = expect_json(
        app.get("/api/finances/sponsorships?status=partiel", Some(&token))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(partial.as_array().map(Vec::len), Some(1));
    let late = expect_json(
        app.get("/api/finances/sponsorships?status=en_retard", Some(&token))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(late.as_array().map(Vec::len), Some(0));

    let detail = expect_json(
        app.get(&format!("/api/children/{child}"), Some(&token)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(detail["sponsorship"]["id"], sponsorship_id.as_str());

    let exit_link = app
        .post_json(
            "/api/finances/transactions",
            &json!({
                "account_id": account_id,
                "direction": "sortie",
                "category": "education",
                "amount": "10",
                "transaction_date": today,
                "sponsorship_id": sponsorship_id,
                "allow_negative_balance": true,
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(exit_link.status(), StatusCode::UNPROCESSABLE_ENTITY);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn one_active_sponsorship_per_child() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let site = app.insert_site("Kara").await?;
    let token = app.user_token("root", UserSpec::superuser()).await?;
    let child = create_child(&app, &token, site, "Bawa").await?;

    let payload = json!({
        "child_id": child,
        "sponsor_name": "Association Espoir",
        "monthly_amount": "75.50",
        "start_date": "2024-01-01",
    });
    let first = expect_json(
        app.post_json("/api/finances/sponsorships", &payload, Some(&token))
            .await?,
        StatusCode::CREATED,
    )
    .await?;

    let duplicate = app
        .post_json("/api/finances/sponsorships", &payload, Some(&token))
        .await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let first_id = first["id"].as_str().context("sponsorship id")?;
    let archived = app
        .post_empty(
            &format!("/api/finances/sponsorships/{first_id}/archive"),
            Some(&token),
        )
        .await?;
    assert_eq!(archived.status(), StatusCode::NO_CONTENT);

    let replacement = expect_json(
        app.post_json("/api/finances/sponsorships", &payload, Some(&token))
            .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_ne!(replacement["id"], first["id"]);

    let ended = expect_json(
        app.get("/api/finances/sponsorships?status=termine", Some(&token))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(ended.as_array().map(Vec::len), Some(1));
    assert_eq!(ended[0]["id"], first["id"]);

    let bad_dates = app
        .post_json(
            "/api/finances/sponsorships",
            &json!({
                "child_id": child,
                "sponsor_name": "Autre",
                "monthly_amount": "10",
                "start_date": "2024-05-01",
                "end_date": "2024-04-01",
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(bad_dates.status(), StatusCode::UNPROCESSABLE_ENTITY);

    app.cleanup().await?;
    Ok(())
}
