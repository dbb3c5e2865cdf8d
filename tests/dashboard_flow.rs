mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_json, Part, TestApp, UserSpec};
use serde_json::json;

#[tokio::test]
async fn dashboard_sections_follow_permissions_and_scope() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let lome = app.insert_site("Lomé").await?;
    let kara = app.insert_site("Kara").await?;
    let admin = app.user_token("root", UserSpec::superuser()).await?;

    for (site, last_name) in [(lome, "Akakpo"), (lome, "Dossou"), (kara, "Gnassingbé")] {
        let payload = json!({
            "site_id": site,
            "last_name": last_name,
            "first_name": "Ama",
            "birth_date": "2016-02-02",
            "sex": "F",
            "arrival_date": "2021-05-05",
        });
        expect_json(
            app.post_multipart("/api/children", &[Part::Text("child", payload.to_string())], &admin)
                .await?,
            StatusCode::CREATED,
        )
        .await?;
    }

    let overview = expect_json(app.get("/api/dashboard", Some(&admin)).await?, StatusCode::OK).await?;
    assert_eq!(overview["active_children"], 3);
    assert_eq!(overview["site_count"], 2);
    assert_eq!(overview["children_per_site"][0]["name"], "Lomé");
    assert_eq!(overview["children_per_site"][0]["active_children"], 2);
    assert_eq!(overview["recent_activity"].as_array().map(Vec::len), Some(3));
    assert_eq!(overview["total_activity"], 3);

    let kara_sites = [kara];
    let volunteer = app
        .user_token("benevole", UserSpec::role("benevole", &kara_sites))
        .await?;
    let scoped = expect_json(app.get("/api/dashboard", Some(&volunteer)).await?, StatusCode::OK).await?;
    assert_eq!(scoped["active_children"], 1);
    assert!(scoped.get("site_count").is_none());
    assert_eq!(scoped["recent_medical"].as_array().map(Vec::len), Some(0));

    let accountant = app
        .user_token("compta", UserSpec::role("comptable", &kara_sites))
        .await?;
    let finance_only = expect_json(app.get("/api/dashboard", Some(&accountant)).await?, StatusCode::OK).await?;
    assert_eq!(finance_only["active_children"], 0);
    assert_eq!(finance_only["recent_activity"].as_array().map(Vec::len), Some(0));

    app.cleanup().await?;
    Ok(())
}
