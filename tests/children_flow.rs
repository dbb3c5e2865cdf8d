mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_json, Part, TestApp, UserSpec};
use serde_json::{json, Value};

fn child_payload(site_id: Option<String>, last_name: &str) -> Value {
    json!({
        "site_id": site_id,
        "last_name": last_name,
        "first_name": "Afi",
        "birth_date": "2015-03-10",
        "sex": "F",
        "birth_place": "Kpalimé",
        "arrival_date": "2020-01-15",
        "admission_reason": "orpheline",
    })
}

#[tokio::test]
async fn create_child_with_photo_and_document() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let site = app.insert_site("Lomé Centre").await?;
    let sites = [site];
    let token = app
        .user_token("gestion", UserSpec::role("gestionnaire", &sites))
        .await?;

    let response = app
        .post_multipart(
            "/api/children",
            &[
                Part::Text("child", child_payload(None, "Mensah").to_string()),
                Part::File {
                    name: "photo",
                    filename: "afi.jpg",
                    content_type: "image/jpeg",
                    data: b"\xff\xd8\xff\xe0fake-jpeg",
                },
                Part::Text("document_type", "acte_naissance".to_string()),
                Part::Text("document_description", "copie certifiée".to_string()),
                Part::File {
                    name: "document",
                    filename: "acte.pdf",
                    content_type: "application/pdf",
                    data: b"%PDF-1.4 fake",
                },
            ],
            &token,
        )
        .await?;
    let created = expect_json(response, StatusCode::CREATED).await?;

    assert_eq!(created["site_id"], site.to_string());
    assert_eq!(created["status"], "accueilli");
    assert_eq!(created["has_photo"], true);
    assert!(created["photo_url"]
        .as_str()
        .is_some_and(|url| url.starts_with("https://fake-storage/")));
    let documents = created["documents"].as_array().expect("documents");
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0]["document_type"], "acte_naissance");
    assert_eq!(documents[0]["original_name"], "acte.pdf");
    assert_eq!(app.storage().object_count().await, 2);

    let child_id = created["id"].as_str().expect("child id").to_string();
    let history = expect_json(
        app.get(&format!("/api/children/{child_id}/history"), Some(&token))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(history.as_array().map(Vec::len), Some(1));
    assert_eq!(history[0]["change_kind"], "created");
    assert_eq!(history[0]["changed_by_username"], "gestion");
    assert_eq!(history[0]["snapshot"]["last_name"], "Mensah");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn departure_status_requires_a_date() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let site = app.insert_site("Kara").await?;
    let token = app.user_token("root", UserSpec::superuser()).await?;

    let mut payload = child_payload(Some(site.to_string()), "Agbeko");
    payload["status"] = json!("adopte");
    let response = app
        .post_multipart(
            "/api/children",
            &[Part::Text("child", payload.to_string())],
            &token,
        )
        .await?;
    let error = expect_json(response, StatusCode::UNPROCESSABLE_ENTITY).await?;
    assert_eq!(error["details"]["field"], "departure_date");

    let mut future = child_payload(Some(site.to_string()), "Agbeko");
    future["birth_date"] = json!("2999-01-01");
    let response = app
        .post_multipart(
            "/api/children",
            &[Part::Text("child", future.to_string())],
            &token,
        )
        .await?;
    let error = expect_json(response, StatusCode::UNPROCESSABLE_ENTITY).await?;
    assert_eq!(error["details"]["field"], "birth_date");

    assert_eq!(app.count_rows("children").await?, 0);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn update_and_archive_record_history() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let site = app.insert_site("Sokodé").await?;
    let token = app.user_token("root", UserSpec::superuser()).await?;

    let created = expect_json(
        app.post_multipart(
            "/api/children",
            &[Part::Text(
                "child",
                child_payload(Some(site.to_string()), "Kodjo").to_string(),
            )],
            &token,
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let child_id = created["id"].as_str().expect("child id").to_string();

    let updated = expect_json(
        app.patch_json(
            &format!("/api/children/{child_id}"),
            &json!({ "status": "reunifie", "departure_date": "2024-06-01" }),
            Some(&token),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(updated["status"], "reunifie");
    assert_eq!(updated["departure_date"], "2024-06-01");

    let archived = app
        .post_empty(&format!("/api/children/{child_id}/archive"), Some(&token))
        .await?;
    assert_eq!(archived.status(), StatusCode::NO_CONTENT);

    let listed = expect_json(app.get("/api/children", Some(&token)).await?, StatusCode::OK).await?;
    assert_eq!(listed.as_array().map(Vec::len), Some(0));

    let with_archived = expect_json(
        app.get("/api/children?include_archived=true", Some(&token))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(with_archived.as_array().map(Vec::len), Some(1));

    let detail = expect_json(
        app.get(&format!("/api/children/{child_id}"), Some(&token))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(detail["is_active"], false);

    let rejected = app
        .patch_json(
            &format!("/api/children/{child_id}"),
            &json!({ "first_name": "Yao" }),
            Some(&token),
        )
        .await?;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

    let history = expect_json(
        app.get(&format!("/api/children/{child_id}/history"), Some(&token))
            .await?,
        StatusCode::OK,
    )
    .await?;
    let kinds: Vec<&str> = history
        .as_array()
        .expect("history")
        .iter()
        .filter_map(|entry| entry["change_kind"].as_str())
        .collect();
    assert_eq!(kinds, vec!["archived", "updated", "created"]);

    let entry_id = history[1]["id"].as_str().expect("entry id");
    let entry = expect_json(
        app.get(&format!("/api/children/history/{entry_id}"), Some(&token))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(entry["snapshot"]["status"], "reunifie");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn site_scope_hides_other_sites() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let lome = app.insert_site("Lomé").await?;
    let kara = app.insert_site("Kara").await?;
    let admin = app.user_token("root", UserSpec::superuser()).await?;

    let mut ids = Vec::new();
    for (site, name) in [(lome, "Lawson"), (kara, "Tchalla")] {
        let created = expect_json(
            app.post_multipart(
                "/api/children",
                &[Part::Text(
                    "child",
                    child_payload(Some(site.to_string()), name).to_string(),
                )],
                &admin,
            )
            .await?,
            StatusCode::CREATED,
        )
        .await?;
        ids.push(created["id"].as_str().expect("child id").to_string());
    }

    let lome_sites = [lome];
    let carer = app
        .user_token("soignant", UserSpec::role("soignant", &lome_sites))
        .await?;

    let visible = expect_json(app.get("/api/children", Some(&carer)).await?, StatusCode::OK).await?;
    let names: Vec<&str> = visible
        .as_array()
        .expect("children")
        .iter()
        .filter_map(|child| child["last_name"].as_str())
        .collect();
    assert_eq!(names, vec!["Lawson"]);

    let blank_status = expect_json(
        app.get("/api/children?status=", Some(&carer)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(blank_status.as_array().map(Vec::len), Some(1));

    let filtered = expect_json(
        app.get(&format!("/api/children?site={kara}"), Some(&carer))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(filtered.as_array().map(Vec::len), Some(0));

    let hidden = app
        .get(&format!("/api/children/{}", ids[1]), Some(&carer))
        .await?;
    assert_eq!(hidden.status(), StatusCode::NOT_FOUND);

    let forbidden = app
        .post_empty(&format!("/api/children/{}/archive", ids[0]), Some(&carer))
        .await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let medical = app
        .post_json(
            &format!("/api/children/{}/medical", ids[0]),
            &json!({
                "consultation_date": "2024-02-01",
                "consultation_type": "générale",
                "doctor": "Dr Amouzou",
                "diagnosis": "paludisme",
            }),
            Some(&carer),
        )
        .await?;
    assert_eq!(medical.status(), StatusCode::CREATED);

    let detail = expect_json(
        app.get(&format!("/api/children/{}", ids[0]), Some(&carer))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(detail["medical_followups"].as_array().map(Vec::len), Some(1));
    assert!(detail.get("documents").is_none());

    app.cleanup().await?;
    Ok(())
}
