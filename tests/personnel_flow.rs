mod common;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_json, TestApp, UserSpec};
use serde_json::{json, Value};
use uuid::Uuid;

fn employee_payload(sites: &[Uuid], account: Option<Value>) -> Value {
    json!({
        "last_name": "Amegah",
        "first_name": "Esi",
        "position": "Infirmière",
        "contract_type": "cdi",
        "hire_date": "2022-09-01",
        "salary": "85000",
        "site_ids": sites,
        "create_account": account,
    })
}

#[tokio::test]
async fn create_employee_with_login() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let lome = app.insert_site("Lomé").await?;
    let kara = app.insert_site("Kara").await?;
    let token = app.user_token("rh", UserSpec::role("rh", &[])).await?;

    let created = expect_json(
        app.post_json(
            "/api/personnel",
            &employee_payload(
                &[lome, kara],
                Some(json!({
                    "username": "esi",
                    "password": "infirmiere-2024",
                    "role": "soignant",
                    "email": "esi@example.org",
                })),
            ),
            Some(&token),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_eq!(created["username"], "esi");
    assert_eq!(created["contract_type"], "cdi");
    assert_eq!(created["salary"], "85000.00");
    assert_eq!(created["sites"].as_array().map(Vec::len), Some(2));

    let esi = app.login_token("esi", "infirmiere-2024").await?;
    let me = expect_json(app.get("/api/auth/me", Some(&esi)).await?, StatusCode::OK).await?;
    assert_eq!(me["role"], "soignant");
    assert_eq!(me["site_ids"].as_array().map(Vec::len), Some(2));

    let employee_id = created["id"].as_str().context("employee id")?;
    let updated = expect_json(
        app.patch_json(
            &format!("/api/personnel/{employee_id}"),
            &json!({ "salary": null, "site_ids": [lome] }),
            Some(&token),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(updated["salary"], Value::Null);
    assert_eq!(updated["sites"].as_array().map(Vec::len), Some(1));

    let second_account = app
        .patch_json(
            &format!("/api/personnel/{employee_id}"),
            &json!({
                "create_account": {
                    "username": "esi2",
                    "password": "another-password",
                    "role": "soignant",
                }
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(second_account.status(), StatusCode::CONFLICT);

    let archived = app
        .post_empty(&format!("/api/personnel/{employee_id}/archive"), Some(&token))
        .await?;
    assert_eq!(archived.status(), StatusCode::NO_CONTENT);
    let listed = expect_json(app.get("/api/personnel", Some(&token)).await?, StatusCode::OK).await?;
    assert_eq!(listed.as_array().map(Vec::len), Some(0));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn account_creation_rules() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let site = app.insert_site("Sokodé").await?;
    let token = app.user_token("rh", UserSpec::role("rh", &[])).await?;
    app.insert_user("taken", UserSpec::role("benevole", &[site]))
        .await?;

    let directeur = app
        .post_json(
            "/api/personnel",
            &employee_payload(
                &[site],
                Some(json!({ "username": "boss", "password": "long-enough", "role": "directeur" })),
            ),
            Some(&token),
        )
        .await?;
    assert_eq!(directeur.status(), StatusCode::FORBIDDEN);

    let duplicate = app
        .post_json(
            "/api/personnel",
            &employee_payload(
                &[site],
                Some(json!({ "username": "taken", "password": "long-enough", "role": "benevole" })),
            ),
            Some(&token),
        )
        .await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let short = expect_json(
        app.post_json(
            "/api/personnel",
            &employee_payload(
                &[site],
                Some(json!({ "username": "newbie", "password": "short", "role": "benevole" })),
            ),
            Some(&token),
        )
        .await?,
        StatusCode::UNPROCESSABLE_ENTITY,
    )
    .await?;
    assert_eq!(short["details"]["field"], "password");

    assert_eq!(app.count_rows("employees").await?, 0);

    let admin = app.user_token("root", UserSpec::superuser()).await?;
    let allowed = app
        .post_json(
            "/api/personnel",
            &employee_payload(
                &[site],
                Some(json!({ "username": "boss", "password": "long-enough", "role": "directeur" })),
            ),
            Some(&admin),
        )
        .await?;
    assert_eq!(allowed.status(), StatusCode::CREATED);

    let volunteer = app.login_token("taken", common::PASSWORD).await?;
    let denied = app.get("/api/personnel", Some(&volunteer)).await?;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn site_restricted_edit_keeps_links_it_cannot_see() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let lome = app.insert_site("Lomé").await?;
    let kara = app.insert_site("Kara").await?;
    let global = app.user_token("rh", UserSpec::role("rh", &[])).await?;
    let lome_sites = [lome];
    let local = app
        .user_token("rh_lome", UserSpec::role("rh", &lome_sites))
        .await?;

    let created = expect_json(
        app.post_json(
            "/api/personnel",
            &employee_payload(&[lome, kara], None),
            Some(&global),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let employee_id = created["id"].as_str().context("employee id")?;

    expect_json(
        app.patch_json(
            &format!("/api/personnel/{employee_id}"),
            &json!({ "site_ids": [lome] }),
            Some(&local),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;

    let reread = expect_json(
        app.get(&format!("/api/personnel/{employee_id}"), Some(&global))
            .await?,
        StatusCode::OK,
    )
    .await?;
    let mut linked: Vec<&str> = reread["sites"]
        .as_array()
        .context("sites")?
        .iter()
        .filter_map(|site| site["name"].as_str())
        .collect();
    linked.sort_unstable();
    assert_eq!(linked, vec!["Kara", "Lomé"]);

    let outside = app
        .patch_json(
            &format!("/api/personnel/{employee_id}"),
            &json!({ "site_ids": [kara] }),
            Some(&local),
        )
        .await?;
    assert_eq!(outside.status(), StatusCode::FORBIDDEN);

    app.cleanup().await?;
    Ok(())
}
