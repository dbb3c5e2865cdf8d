mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_json, TestApp, UserSpec, PASSWORD};
use serde_json::json;

#[tokio::test]
async fn login_and_me_roundtrip() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let site = app.insert_site("Lomé Centre").await?;
    let sites = [site];
    app.insert_user("awa", UserSpec::role("secretaire", &sites))
        .await?;
    let token = app.login_token("awa", PASSWORD).await?;

    let me = expect_json(app.get("/api/auth/me", Some(&token)).await?, StatusCode::OK).await?;
    assert_eq!(me["username"], "awa");
    assert_eq!(me["role"], "secretaire");
    assert_eq!(me["is_superuser"], false);
    assert_eq!(me["site_ids"], json!([site.to_string()]));

    let permissions: Vec<&str> = me["permissions"]
        .as_array()
        .expect("permissions array")
        .iter()
        .filter_map(|value| value.as_str())
        .collect();
    assert!(permissions.contains(&"add_child"));
    assert!(permissions.contains(&"add_transaction"));
    assert!(!permissions.contains(&"archive_child"));

    assert_eq!(me["child_form"]["site_field"], "hidden");
    assert_eq!(me["child_form"]["default_site"], site.to_string());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn rejects_bad_credentials_and_missing_token() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("kofi", UserSpec::superuser()).await?;

    let wrong_password = app
        .post_json(
            "/api/auth/login",
            &json!({ "username": "kofi", "password": "not-the-password" }),
            None,
        )
        .await?;
    assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);

    let unknown_user = app
        .post_json(
            "/api/auth/login",
            &json!({ "username": "nobody", "password": PASSWORD }),
            None,
        )
        .await?;
    assert_eq!(unknown_user.status(), StatusCode::UNAUTHORIZED);

    let anonymous = app.get("/api/children", None).await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let health = app.get("/api/health", None).await?;
    assert_eq!(health.status(), StatusCode::OK);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn superuser_sees_every_permission() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let token = app.user_token("root", UserSpec::superuser()).await?;
    let me = expect_json(app.get("/api/auth/me", Some(&token)).await?, StatusCode::OK).await?;
    assert_eq!(me["is_superuser"], true);
    assert_eq!(me["permissions"].as_array().map(Vec::len), Some(28));
    assert_eq!(me["finance_form"]["site_field"], "required");

    app.cleanup().await?;
    Ok(())
}
